//! Error types of the sink and its display devices

use std::{io, path::PathBuf};

use crate::{
    buffer::BufferId, device::TransactionId, pipeline::PipelineNotFound, utils::Size, Fourcc,
};

/// A failed call into the display device
#[derive(thiserror::Error, Debug)]
#[error("{errmsg} on device `{dev:?}` ({source})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

/// Configuring the sink failed
#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
    /// The requested connector does not exist
    #[error("No connector named `{0}`")]
    ConnectorNotFound(String),
    /// No connector was given and none has a display attached
    #[error("No connected connector found")]
    NoConnectedConnector,
    /// The stride cannot hold a line of pixels
    #[error("Stride {stride} is too small for {width} pixels of format {format}")]
    InvalidStride {
        /// Configured format
        format: Fourcc,
        /// Configured width
        width: u32,
        /// Configured stride in bytes
        stride: u32,
    },
    /// No hardware path is able to display the stream
    #[error(transparent)]
    PipelineNotFound(#[from] PipelineNotFound),
    /// Creating the mode blob failed
    #[error("Failed to create the mode blob")]
    ModeBlob(#[source] AccessError),
}

/// A frame buffer could not be bound to a display object
#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    /// The buffer carries no memory planes
    #[error("Buffer {0:?} has no planes")]
    NoPlanes(BufferId),
    /// The first plane cannot hold a full frame
    #[error("Buffer {buffer:?} is too small: {length} bytes for {size} with stride {stride}")]
    BufferTooSmall {
        /// Buffer that failed to import
        buffer: BufferId,
        /// Length of its first plane
        length: u32,
        /// Negotiated frame size
        size: Size,
        /// Negotiated stride
        stride: u32,
    },
    /// The device rejected the import
    #[error("Device failed to import buffer {buffer:?}")]
    Device {
        /// Buffer that failed to import
        buffer: BufferId,
        /// Underlying device error
        #[source]
        source: AccessError,
    },
}

/// The device rejected an atomic commit
#[derive(thiserror::Error, Debug)]
#[error("Commit of {transaction:?} failed: {errmsg}")]
pub struct CommitError {
    /// What the commit was supposed to do
    pub errmsg: &'static str,
    /// The rejected transaction
    pub transaction: TransactionId,
    /// Underlying device error
    #[source]
    pub source: AccessError,
}

/// The display device reported completions out of order
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Completion for {got:?} does not match the queued transaction {expected:?}")]
pub struct ProtocolViolation {
    /// Transaction waiting for confirmation, if any
    pub expected: Option<TransactionId>,
    /// Transaction that was reported as completed
    pub got: TransactionId,
}

/// Errors returned by [`KmsSink`](crate::sink::KmsSink)
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration failed
    #[error("Configuration failed")]
    Configuration(#[from] ConfigurationError),
    /// Binding a frame buffer failed
    #[error("Frame import failed")]
    Import(#[from] ImportError),
    /// A commit was rejected by the device
    #[error("Atomic commit failed")]
    Commit(#[from] CommitError),
    /// Completions arrived out of order, the session cannot continue
    #[error("Display device broke its completion ordering")]
    Protocol(#[from] ProtocolViolation),
    /// `start` was called before `configure`
    #[error("The sink is not configured")]
    NotConfigured,
    /// A frame was submitted outside of a session
    #[error("The sink is not started")]
    NotStarted,
    /// The operation is not allowed while a session is running
    #[error("The sink is already started")]
    AlreadyStarted,
}

/// A frame submission failed.
///
/// The frame is handed back, so it can be returned to its producer.
#[derive(thiserror::Error, Debug)]
#[error("Frame submission failed")]
pub struct SubmitError<B> {
    /// The frame that was not accepted
    pub buffer: B,
    /// Cause of the failure
    #[source]
    pub source: Error,
}

impl<B> SubmitError<B> {
    pub(crate) fn new(buffer: B, source: impl Into<Error>) -> Self {
        SubmitError {
            buffer,
            source: source.into(),
        }
    }

    /// Split the error into the frame and its cause
    pub fn into_parts(self) -> (B, Error) {
        (self.buffer, self.source)
    }
}
