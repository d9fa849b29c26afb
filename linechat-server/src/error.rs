use thiserror::Error;

/// Errors surfaced by the relay library.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The broadcaster task has exited, so no event can be delivered.
    #[error("broadcaster is no longer running")]
    BroadcasterGone,
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),
}
