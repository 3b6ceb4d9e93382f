use std::fmt::Display;

use thiserror::Error;

/// The step of an ingestion run an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Gate,
    Fetch,
    Extract,
    Parse,
    Load,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Stage::*;
        match self {
            Gate => write!(f, "gate"),
            Fetch => write!(f, "fetch"),
            Extract => write!(f, "extract"),
            Parse => write!(f, "parse"),
            Load => write!(f, "load"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EtlError {
    /// Remote resource unreachable or returned a non-success status.
    #[error("network error: {0}")]
    Network(String),
    /// Corrupt archive, missing extraction tool, or no usable file inside.
    #[error("format error: {0}")]
    Format(String),
    /// The data provider changed the shape of the file.
    #[error("schema error: {0}")]
    Schema(String),
    /// Database unreachable or processed markers inconsistent.
    #[error("state error: {0}")]
    State(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("period {period}, {stage} stage: {source}")]
    Stage {
        period: i32,
        stage: Stage,
        #[source]
        source: Box<EtlError>,
    },
}

impl EtlError {
    /// Attach the period and stage to an error.  Errors that already carry
    /// a stage are returned unchanged.
    pub fn at(self, period: i32, stage: Stage) -> EtlError {
        match self {
            EtlError::Stage { .. } => self,
            e => EtlError::Stage {
                period,
                stage,
                source: Box::new(e),
            },
        }
    }

    /// The innermost error, with the stage context removed.
    pub fn kind(&self) -> &EtlError {
        match self {
            EtlError::Stage { source, .. } => source.kind(),
            e => e,
        }
    }
}

impl From<duckdb::Error> for EtlError {
    fn from(e: duckdb::Error) -> Self {
        EtlError::State(e.to_string())
    }
}

impl From<reqwest::Error> for EtlError {
    fn from(e: reqwest::Error) -> Self {
        EtlError::Network(e.to_string())
    }
}

impl From<zip::result::ZipError> for EtlError {
    fn from(e: zip::result::ZipError) -> Self {
        EtlError::Format(e.to_string())
    }
}

impl From<csv::Error> for EtlError {
    fn from(e: csv::Error) -> Self {
        EtlError::Format(e.to_string())
    }
}
