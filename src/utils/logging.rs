use std::{
    error::Error,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::Path,
};

use env_logger::{Builder, Target};
use jiff::Zoned;
use log::LevelFilter;

/// Writes every log line to the job's log file and to stderr.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        io::stderr().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        io::stderr().flush()
    }
}

fn builder() -> Builder {
    let mut builder = Builder::new();
    builder
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Zoned::now().strftime("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        });
    builder
}

/// Log to `log_dir/log_filename` (appending) and to the console.
pub fn init(log_dir: &Path, log_filename: &str) -> Result<(), Box<dyn Error>> {
    fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(log_filename))?;
    builder()
        .target(Target::Pipe(Box::new(Tee { file })))
        .try_init()?;
    Ok(())
}

/// Console only, for failures that happen before the log file is known.
pub fn init_console() {
    let _ = builder().target(Target::Stderr).try_init();
}
