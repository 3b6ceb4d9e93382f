use std::{env, fmt::Debug, path::PathBuf};

use crate::error::EtlError;

/// Where the relational store lives.
#[derive(Clone, PartialEq, Eq)]
pub enum DbLocation {
    /// A local DuckDB file.
    DuckDb(PathBuf),
    /// A MySQL/MariaDB server, attached through the DuckDB mysql extension.
    MySql {
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    },
}

// Keep the password out of the logs.
impl Debug for DbLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbLocation::DuckDb(path) => write!(f, "DuckDb({})", path.display()),
            DbLocation::MySql {
                host,
                port,
                user,
                database,
                ..
            } => write!(f, "MySql({}@{}:{}/{})", user, host, port, database),
        }
    }
}

/// Everything a job needs from the environment.  Built once at startup and
/// passed to the pipeline.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub db: DbLocation,
    /// External tool used for archives the zip crate can't read, e.g. `unrar`.
    pub extract_tool: PathBuf,
    pub download_dir: PathBuf,
    pub extract_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_filename: String,
}

impl JobConfig {
    /// Read the configuration from the process environment.  Load the env
    /// file with `dotenvy` before calling this.
    pub fn from_env() -> Result<JobConfig, EtlError> {
        JobConfig::from_vars(|name| env::var(name).ok())
    }

    /// Build the configuration from a variable lookup.  All missing variables
    /// are reported together.
    pub fn from_vars<F>(lookup: F) -> Result<JobConfig, EtlError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut missing: Vec<&str> = Vec::new();
        let mut require = |name: &'static str, value: Option<String>| -> String {
            match value {
                Some(v) => v,
                None => {
                    missing.push(name);
                    String::new()
                }
            }
        };

        let db = match get("DUCKDB_PATH") {
            Some(path) => DbLocation::DuckDb(PathBuf::from(path)),
            None => {
                let user = require("DB_USER", get("DB_USER"));
                let password = require("DB_PASS", get("DB_PASS"));
                let host = require("DB_HOST", get("DB_HOST"));
                let port = require("DB_PORT", get("DB_PORT"));
                let database = require("DB_NAME", get("DB_NAME"));
                DbLocation::MySql {
                    host,
                    port: port.parse().unwrap_or_default(),
                    user,
                    password,
                    database,
                }
            }
        };
        let extract_tool = require(
            "EXTRACT_TOOL",
            get("EXTRACT_TOOL").or_else(|| get("WINRAR_PATH")),
        );
        let download_dir = require("DOWNLOAD_DIR", get("DOWNLOAD_DIR"));
        let extract_dir = require("EXTRACT_DIR", get("EXTRACT_DIR"));
        let output_dir = require("OUTPUT_DIR", get("OUTPUT_DIR"));
        let log_dir = require("LOG_DIRECTORY", get("LOG_DIRECTORY"));
        let log_filename = require("LOG_FILENAME", get("LOG_FILENAME"));

        if !missing.is_empty() {
            return Err(EtlError::Config(format!(
                "missing environment variables: {}",
                missing.join(", ")
            )));
        }
        if let DbLocation::MySql { port: 0, .. } = db {
            return Err(EtlError::Config(format!(
                "DB_PORT is not a valid port: {:?}",
                get("DB_PORT").unwrap_or_default()
            )));
        }

        Ok(JobConfig {
            db,
            extract_tool: PathBuf::from(extract_tool),
            download_dir: PathBuf::from(download_dir),
            extract_dir: PathBuf::from(extract_dir),
            output_dir: PathBuf::from(output_dir),
            log_dir: PathBuf::from(log_dir),
            log_filename,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const DIRS: [(&str, &str); 6] = [
        ("EXTRACT_TOOL", "/usr/bin/unrar"),
        ("DOWNLOAD_DIR", "/tmp/jobs/download"),
        ("EXTRACT_DIR", "/tmp/jobs/extracted"),
        ("OUTPUT_DIR", "/tmp/jobs/output"),
        ("LOG_DIRECTORY", "/tmp/jobs/logs"),
        ("LOG_FILENAME", "enrolled_job_logs.log"),
    ];

    #[test]
    fn duckdb_config() -> Result<(), Box<dyn std::error::Error>> {
        let mut env = vars(&DIRS);
        env.insert("DUCKDB_PATH".into(), "/tmp/jobs/vocational.duckdb".into());
        let config = JobConfig::from_vars(|k| env.get(k).cloned())?;
        assert_eq!(
            config.db,
            DbLocation::DuckDb(PathBuf::from("/tmp/jobs/vocational.duckdb"))
        );
        assert_eq!(config.log_filename, "enrolled_job_logs.log");
        Ok(())
    }

    #[test]
    fn mysql_config() -> Result<(), Box<dyn std::error::Error>> {
        let mut env = vars(&DIRS);
        env.extend(vars(&[
            ("DB_USER", "etl"),
            ("DB_PASS", "secret"),
            ("DB_HOST", "db.local"),
            ("DB_PORT", "3306"),
            ("DB_NAME", "vocational"),
        ]));
        let config = JobConfig::from_vars(|k| env.get(k).cloned())?;
        assert!(matches!(config.db, DbLocation::MySql { port: 3306, .. }));
        assert!(!format!("{:?}", config).contains("secret"));
        Ok(())
    }

    #[test]
    fn winrar_path_is_accepted() -> Result<(), Box<dyn std::error::Error>> {
        let mut env = vars(&DIRS[1..]);
        env.insert("DUCKDB_PATH".into(), "/tmp/x.duckdb".into());
        env.insert("WINRAR_PATH".into(), "/opt/rar/unrar".into());
        let config = JobConfig::from_vars(|k| env.get(k).cloned())?;
        assert_eq!(config.extract_tool, PathBuf::from("/opt/rar/unrar"));
        Ok(())
    }

    #[test]
    fn missing_values_are_reported_together() {
        let env = vars(&[("DB_HOST", "db.local"), ("DOWNLOAD_DIR", "")]);
        let err = JobConfig::from_vars(|k| env.get(k).cloned()).unwrap_err();
        let msg = err.to_string();
        for name in ["DB_USER", "DB_PASS", "DB_PORT", "DB_NAME", "EXTRACT_TOOL", "DOWNLOAD_DIR", "LOG_FILENAME"] {
            assert!(msg.contains(name), "{} not in {}", name, msg);
        }
        assert!(!msg.contains("DB_HOST"));
    }

    #[test]
    fn bad_port() {
        let mut env = vars(&DIRS);
        env.extend(vars(&[
            ("DB_USER", "etl"),
            ("DB_PASS", "secret"),
            ("DB_HOST", "db.local"),
            ("DB_PORT", "mysql"),
            ("DB_NAME", "vocational"),
        ]));
        let err = JobConfig::from_vars(|k| env.get(k).cloned()).unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }
}
