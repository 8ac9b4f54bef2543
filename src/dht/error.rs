use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid id length")]
    InvalidId,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("node is shutting down")]
    ShuttingDown,
}
