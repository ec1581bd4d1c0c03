use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid service path: {0}")]
    InvalidServicePath(String),
}
