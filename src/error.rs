//! Error types surfaced by channels, monitors, the context and the server.
//!
//! Connection problems are always reported as [`ConnectionError`], either
//! directly or wrapped in the request-specific error, so that callers can tell
//! "disconnected" apart from "the value could not be read".

use crate::{protocol::ErrorCondition, records::RecordError};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("The transport context is not initialized")]
    NotInitialized,
    #[error("The channel \"{0}\" must be connected to use this feature")]
    NotConnected(String),
    #[error("The channel \"{0}\" must have been connected at least once to use this feature")]
    NeverConnected(String),
    #[error("Failed to create native channel for \"{name}\": {condition}")]
    CreateFailed {
        name: String,
        condition: ErrorCondition,
    },
}

/// How a single issued request failed to complete
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("Timed out waiting for the request to complete")]
    Timeout,
    #[error("{0}")]
    Failed(#[from] ErrorCondition),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GetError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Get request on \"{name}\" timed out")]
    Timeout { name: String },
    #[error("Get request on \"{name}\" failed: {condition}")]
    Failed {
        name: String,
        condition: ErrorCondition,
    },
    #[error("Unexpected record shape from \"{name}\": {source}")]
    BadRecord {
        name: String,
        #[source]
        source: RecordError,
    },
    #[error("\"{0}\" is an ENUM channel and has no control record")]
    NoControlRecord(String),
}

impl GetError {
    /// A request that failed because the channel dropped is a connection error
    pub(crate) fn from_request(name: &str, error: RequestError) -> Self {
        match error {
            RequestError::Timeout => GetError::Timeout {
                name: name.to_owned(),
            },
            RequestError::Failed(ErrorCondition::Disconn) => {
                ConnectionError::NotConnected(name.to_owned()).into()
            }
            RequestError::Failed(condition) => GetError::Failed {
                name: name.to_owned(),
                condition,
            },
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PutError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("No write access to \"{0}\"")]
    NoWriteAccess(String),
    #[error("Put request on \"{name}\" timed out")]
    Timeout { name: String },
    #[error("Put request on \"{name}\" was rejected: {condition}")]
    Rejected {
        name: String,
        condition: ErrorCondition,
    },
}

impl PutError {
    pub(crate) fn from_request(name: &str, error: RequestError) -> Self {
        match error {
            RequestError::Timeout => PutError::Timeout {
                name: name.to_owned(),
            },
            RequestError::Failed(ErrorCondition::Disconn) => {
                ConnectionError::NotConnected(name.to_owned()).into()
            }
            RequestError::Failed(condition) => PutError::Rejected {
                name: name.to_owned(),
                condition,
            },
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Subscription to \"{name}\" was rejected: {condition}")]
    Rejected {
        name: String,
        condition: ErrorCondition,
    },
    #[error("Subscription to \"{name}\" was not confirmed in time")]
    Timeout { name: String },
}

impl MonitorError {
    pub(crate) fn from_request(name: &str, error: RequestError) -> Self {
        match error {
            RequestError::Timeout => MonitorError::Timeout {
                name: name.to_owned(),
            },
            RequestError::Failed(ErrorCondition::Disconn) => {
                ConnectionError::NotConnected(name.to_owned()).into()
            }
            RequestError::Failed(condition) => MonitorError::Rejected {
                name: name.to_owned(),
                condition,
            },
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ContextError {
    #[error("The transport context is not initialized")]
    NotInitialized,
    #[error("Could not start the transport runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("Transport failure: {0}")]
    Transport(#[from] ErrorCondition),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("A PV named \"{0}\" is already registered")]
    AlreadyExists(String),
    #[error("The server has been destroyed")]
    Destroyed,
    #[error("Initial value for \"{name}\" cannot be stored as the requested type: {condition}")]
    BadInitialValue {
        name: String,
        condition: ErrorCondition,
    },
}
