// src/core/errors.rs

//! Defines the primary error type for the queue manager and its mapping onto
//! the wire-protocol status codes.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum QManagerError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("missing required argument '{0}'")]
    MissingArgument(&'static str),

    #[error("wrong type for argument '{0}'")]
    WrongArgumentType(&'static str),

    #[error("error in body: {0}")]
    BodyError(String),

    #[error("error in argument: {0}")]
    ArgumentError(String),

    #[error("no machines match the given constraints")]
    NoMachines,

    #[error("would block: no free slot available")]
    WouldBlock,

    #[error("no such job {0}")]
    NoSuchJob(u64),

    #[error("job {0} is not running")]
    JobNotRunning(u64),

    #[error("job {0} is already running")]
    JobAlreadyRunning(u64),

    #[error("permission denied")]
    PermissionDenied,

    #[error("object '{0}' already exists")]
    AlreadyExists(String),

    #[error("no such object '{0}'")]
    NoSuchObject(String),

    #[error("machine '{0}' still has jobs assigned")]
    MachineBusy(String),

    #[error("acl '{0}' still referenced by a machine")]
    AclInUse(String),

    #[error("identity resolution failed: {0}")]
    Identity(String),

    #[error("catalog storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QManagerError {
    /// Maps this error onto the three-digit status code sent on the wire.
    pub fn status_code(&self) -> u16 {
        match self {
            QManagerError::Protocol(_) | QManagerError::UnknownCommand(_) => 401,
            QManagerError::NoMachines => 402,
            QManagerError::WouldBlock => 403,
            QManagerError::NoSuchJob(_) | QManagerError::NoSuchObject(_) => 404,
            QManagerError::JobNotRunning(_) => 405,
            QManagerError::BodyError(_) => 406,
            QManagerError::MissingArgument(_)
            | QManagerError::WrongArgumentType(_)
            | QManagerError::ArgumentError(_) => 407,
            QManagerError::PermissionDenied | QManagerError::Identity(_) => 408,
            QManagerError::JobAlreadyRunning(_) | QManagerError::MachineBusy(_) => 409,
            QManagerError::AlreadyExists(_) | QManagerError::AclInUse(_) => 411,
            QManagerError::Io(_) | QManagerError::Storage(_) | QManagerError::Internal(_) => 406,
        }
    }
}

impl From<std::io::Error> for QManagerError {
    fn from(e: std::io::Error) -> Self {
        QManagerError::Io(Arc::new(e))
    }
}

impl From<sqlx::Error> for QManagerError {
    fn from(e: sqlx::Error) -> Self {
        QManagerError::Storage(e.to_string())
    }
}

impl From<std::num::ParseIntError> for QManagerError {
    fn from(e: std::num::ParseIntError) -> Self {
        QManagerError::ArgumentError(e.to_string())
    }
}
