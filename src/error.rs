//! Errors surfaced by the connection manager and transport backends

use speedlink_shared::{AdapterState, DeviceId, Selector};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Bluetooth adapter not ready (state: {0})")]
    AdapterNotReady(AdapterState),

    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("Already connected to {connected}; disconnect before connecting to {requested}")]
    AlreadyConnected {
        connected: DeviceId,
        requested: DeviceId,
    },

    #[error("Connection to {device} failed: {reason}")]
    Connection { device: DeviceId, reason: String },

    #[error("No device connected")]
    NotConnected,

    #[error("Selector not found on device: {0}")]
    SelectorNotFound(Selector),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl LinkError {
    pub fn connection(device: &DeviceId, reason: impl ToString) -> Self {
        LinkError::Connection {
            device: device.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn transport(reason: impl ToString) -> Self {
        LinkError::Transport(reason.to_string())
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Transport(e.to_string())
    }
}

impl From<bluer::Error> for LinkError {
    fn from(e: bluer::Error) -> Self {
        match e.kind {
            bluer::ErrorKind::NotAuthorized | bluer::ErrorKind::NotPermitted => {
                LinkError::PermissionDenied
            }
            bluer::ErrorKind::NotReady => LinkError::AdapterNotReady(AdapterState::PoweredOff),
            _ => LinkError::Transport(e.to_string()),
        }
    }
}

pub type LinkResult<T> = Result<T, LinkError>;
