use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed BOOTP frame: {0}")]
    Malformed(String),

    #[error("Cannot encode a reply without option {0}")]
    MissingRequiredOption(u8),

    #[error("No available addresses in pool")]
    Exhausted,

    #[error("Address {0} is not allowed on this network")]
    Unallowed(Ipv4Addr),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Socket error: {0}")]
    Socket(String),
}

pub type Result<T> = std::result::Result<T, Error>;
