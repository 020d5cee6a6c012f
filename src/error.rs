//! Error taxonomy of the programmer core.
//!
//! `ConfigError` aborts device-description loading, `ChannelError` is a
//! transport-level failure (never retried inside the channel), `EngineError`
//! covers the programming protocol itself. All expected failures are typed;
//! retries live in the engine, not here.

use thiserror::Error;

use crate::part::OpKind;

/// Malformed device description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("opcode bit specification has {0} tokens, expected 32")]
    TokenCount(usize),
    #[error("bad token {token:?} at bit position {pos} of opcode bit specification")]
    BadToken { pos: usize, token: String },
    #[error("memory {name:?}: size {size} != page_size {page_size} * num_pages {num_pages}")]
    PageSizeMismatch {
        name: String,
        size: u32,
        page_size: u32,
        num_pages: u32,
    },
    #[error("device description: {0}")]
    Description(String),
}

/// Transport failure. The channel reports these as-is and never retries.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("USB transfer timed out")]
    Timeout,
    #[error("channel is not open")]
    NotOpen,
    #[error("short transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("USB: {0}")]
    Usb(#[from] rusb::Error),
}

/// Programming protocol failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("wrong firmware version: expected {expected:?}, device reports {found:?}")]
    WrongFirmware { expected: String, found: String },
    #[error("cannot synchronize with target after all clock/timing setups")]
    SyncFailure,
    #[error("write completion poll timed out at address 0x{addr:04x}")]
    WriteVerifyTimeout { addr: u32 },
    #[error("memory {name:?} does not support paged access")]
    UnsupportedMemory { name: String },
    #[error("{op} instruction not defined for {owner}")]
    MissingOpcode { owner: String, op: OpKind },
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
