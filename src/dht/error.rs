use thiserror::Error;

use crate::peer::PeerError;
use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("invalid package: {0}")]
    InvalidPackage(#[from] ProtocolError),

    #[error("timeout")]
    Timeout,

    #[error("aborted")]
    Aborted,

    #[error("dht stopped")]
    Stopped,

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PeerError> for DhtError {
    fn from(err: PeerError) -> Self {
        DhtError::InvalidArgs(err.to_string())
    }
}

/// Outcome of an asynchronous operation; also the `r` field of response bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResultCode {
    #[default]
    Success = 0,
    Failed = 1,
    Pending = 2,
    Timeout = 3,
    InvalidArgs = 4,
    InvalidPackage = 5,
    Abort = 6,
    Stopped = 7,
    NotFound = 8,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl From<u32> for ResultCode {
    fn from(value: u32) -> Self {
        match value {
            0 => ResultCode::Success,
            2 => ResultCode::Pending,
            3 => ResultCode::Timeout,
            4 => ResultCode::InvalidArgs,
            5 => ResultCode::InvalidPackage,
            6 => ResultCode::Abort,
            7 => ResultCode::Stopped,
            8 => ResultCode::NotFound,
            _ => ResultCode::Failed,
        }
    }
}

impl From<&DhtError> for ResultCode {
    fn from(err: &DhtError) -> Self {
        match err {
            DhtError::InvalidArgs(_) => ResultCode::InvalidArgs,
            DhtError::InvalidPackage(_) => ResultCode::InvalidPackage,
            DhtError::Timeout => ResultCode::Timeout,
            DhtError::Aborted => ResultCode::Abort,
            DhtError::Stopped => ResultCode::Stopped,
            DhtError::ServiceNotFound(_) => ResultCode::NotFound,
            DhtError::Io(_) => ResultCode::Failed,
        }
    }
}
