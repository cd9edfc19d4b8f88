use std::fmt;

/// Why a module reply could not be turned into a reading.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("{section} reply is not terminated by 'Command completed'")]
    Truncated { section: Section },
    #[error("{field} missing from power reply")]
    MissingField { field: &'static str },
    #[error("invalid value '{value}' for {field}")]
    InvalidField { field: String, value: String },
    #[error("cell row out of order - expected={expected} received={received}")]
    CellOutOfOrder { expected: usize, received: usize },
    #[error("cell count mismatch - configured={expected} received={actual}")]
    CellCountMismatch { expected: usize, actual: usize },
}

/// Reply sections making up one module frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Power,
    Cells,
    Info,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Section::Power => write!(f, "pwr"),
            Section::Cells => write!(f, "bat"),
            Section::Info => write!(f, "info"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("module {address}: {source}")]
    Decode {
        address: u8,
        #[source]
        source: DecodeError,
    },
    #[error("module {address}: no complete reply within timeout")]
    TransportTimeout { address: u8 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{consecutive_failures} consecutive communication failures, last at module {address}")]
    CommsExhausted {
        address: u8,
        consecutive_failures: u32,
    },
    #[error("publish failed: {0}")]
    Publish(String),
}

impl Error {
    /// Failures that count against comms health.
    pub fn is_poll_failure(&self) -> bool {
        matches!(
            self,
            Error::Decode { .. } | Error::TransportTimeout { .. } | Error::Io(_)
        )
    }
}
