//! Engine result codes as seen by the host.

use std::fmt;

use pmcache_core::EngineError;

/// Result code returned across the engine API.
///
/// Numeric values follow the host's engine ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EngineStatus {
    Success = 0x00,
    KeyNotFound = 0x01,
    KeyExists = 0x02,
    OutOfMemory = 0x03,
    NotStored = 0x04,
    Invalid = 0x05,
    NotSupported = 0x06,
    Failed = 0xff,
}

impl EngineStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == EngineStatus::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineStatus::Success => "success",
            EngineStatus::KeyNotFound => "key not found",
            EngineStatus::KeyExists => "key exists",
            EngineStatus::OutOfMemory => "out of memory",
            EngineStatus::NotStored => "not stored",
            EngineStatus::Invalid => "invalid arguments",
            EngineStatus::NotSupported => "not supported",
            EngineStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&EngineError> for EngineStatus {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::KeyNotFound => EngineStatus::KeyNotFound,
            EngineError::KeyExists => EngineStatus::KeyExists,
            EngineError::NotStored => EngineStatus::NotStored,
            EngineError::OutOfMemory { .. } => EngineStatus::OutOfMemory,
            EngineError::NotSupported { .. } => EngineStatus::NotSupported,
            EngineError::InvalidArgument { .. } => EngineStatus::Invalid,
            EngineError::Fatal { .. } | EngineError::Pool(_) => EngineStatus::Failed,
        }
    }
}

impl From<EngineError> for EngineStatus {
    fn from(err: EngineError) -> Self {
        EngineStatus::from(&err)
    }
}
