use thiserror::Error;

use crate::bencode::BencodeError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("package too short: {0} bytes")]
    TooShort(usize),

    #[error("bad magic: {0:#06x}")]
    BadMagic(u16),

    #[error("unsupported version: {0}")]
    BadVersion(u16),

    #[error("foreign app id: {0}")]
    ForeignApp(u32),

    #[error("declared length {declared} does not fit {actual} bytes")]
    Length { declared: usize, actual: usize },

    #[error("unknown command: {0:#06x}")]
    UnknownCommand(u16),

    #[error("source hash mismatch for {0}")]
    HashMismatch(String),

    #[error("package of {0} bytes cannot be encoded")]
    TooLarge(usize),

    #[error("malformed body: {0}")]
    Body(String),

    #[error("malformed common section: {0}")]
    Common(String),

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),
}
