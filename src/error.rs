//! Crate-wide error type.
//!
//! Most failure modes in the control core are recovered locally (retried
//! next tick, or replaced with defaults) and never reach this type.
//! `Error` exists for the handful of checked operations that do have a
//! precise failure to report: EEPROM framing, blob decode, and RPC decode.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("eeprom crc mismatch: expected={expected:#010x} actual={actual:#010x}")]
    EepromCrcMismatch { expected: u32, actual: u32 },

    #[error("eeprom payload too large: {len} bytes")]
    EepromPayloadTooLarge { len: usize },

    #[error("eeprom device io error: {0}")]
    EepromIo(String),

    #[error("i2c sensor error: {0}")]
    SensorIo(String),

    #[error("blob decode failed: {0}")]
    BlobDecode(String),

    #[error("rpc decode failed: {0}")]
    RpcDecode(String),

    #[error("profile invalid: {0}")]
    ProfileInvalid(String),

    #[error("head not connected")]
    HeadNotConnected,
}

pub type Result<T> = std::result::Result<T, Error>;
