#![cfg_attr(not(test), no_std)]

pub mod action;
pub mod config;
pub mod device;
pub mod http;
pub mod json;
pub mod ota;
pub mod shadow;
pub mod sntp;
pub mod topic;

pub use action::{Ack, Action, ActionError, ActionOutcome, ActionRouter, ActionStatusEncoder};
pub use config::{DeviceConfig, NodeConfig};
pub use device::{Device, FirmwareUpdate};
pub use shadow::{BlindState, Blinds, Readings, ShadowEncoder};
pub use topic::Topics;

/// Errors raised while building or parsing the JSON documents exchanged with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Output did not fit the provided buffer.
    BufferFull,
    /// Input was not the JSON document we expected.
    Malformed,
    /// A string escape sequence could not be decoded.
    InvalidEscape,
}

impl From<serde_json_core::ser::Error> for Error {
    fn from(_: serde_json_core::ser::Error) -> Self {
        Error::BufferFull
    }
}

impl From<serde_json_core::de::Error> for Error {
    fn from(_: serde_json_core::de::Error) -> Self {
        Error::Malformed
    }
}

impl From<core::fmt::Error> for Error {
    fn from(_: core::fmt::Error) -> Self {
        Error::BufferFull
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BufferFull => write!(f, "buffer full"),
            Self::Malformed => write!(f, "malformed json"),
            Self::InvalidEscape => write!(f, "invalid escape sequence"),
        }
    }
}
