use thiserror::Error;

/// Errors that can occur in the dump daemon
#[derive(Error, Debug)]
pub enum NetdumpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Alloc(#[from] crate::storage::AllocError),
}

pub type Result<T> = std::result::Result<T, NetdumpError>;
