//! Crate-wide error type.

use thiserror::Error;

/// Convenience alias for `Result<T, weld_core::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while building or running a pipeline.
///
/// `EndOfChannel` is deliberately absent from this enum: a channel running
/// dry is ordinary stream termination, represented as `None` from `recv`,
/// not an error.
#[derive(Error, Debug)]
pub enum Error {
    /// A send was attempted against a channel whose receive side is closed.
    #[error("broken resource: receiver has gone away")]
    BrokenResource,

    /// A tap exhausted its configured retries without completing a send.
    #[error("busy resource: unable to send item after {attempts} attempt(s)")]
    BusyResource {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// The `PipelineSection` tree passed to `weld` is ill-formed, e.g. more
    /// than one async-iterable head, or an iterable that isn't in head
    /// position.
    #[error("invalid pipeline shape: {0}")]
    InvalidPipelineShape(String),

    /// A section was invoked with no input and no way to produce one.
    #[error("section requires an input but none was supplied")]
    ProducerRequiresInput,

    /// Propagated unchanged from a `Section::run` implementation.
    #[error("section error: {0}")]
    Section(#[from] anyhow::Error),

    /// I/O failure at a bridge boundary (thread pipe, child process pipe,
    /// foreign-loop socket pair).
    #[error("bridge i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to (de)serialize an item crossing the child-process boundary.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A background task (pump, bridge thread, bridge process) was joined
    /// but had already panicked or been aborted.
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// True for errors that represent ordinary shutdown rather than a
    /// pipeline defect — used by the scope to decide whether to keep the
    /// first error or let a later one take precedence.
    pub fn is_broken_resource(&self) -> bool {
        matches!(self, Error::BrokenResource)
    }
}
