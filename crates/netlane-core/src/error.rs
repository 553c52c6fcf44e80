use thiserror::Error;

/// Errors surfaced by fallible library entry points.
///
/// Protocol-state problems (desync, queue overflow, serialize failure) are
/// not errors in this sense: they latch as channel or connection error
/// levels and are sampled by the application each tick.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// A configuration field holds a value the protocol cannot honor.
    #[error("invalid configuration value for `{0}`")]
    InvalidConfig(&'static str),

    /// A client index outside the running server's slot range was used.
    #[error("client index {0} out of range")]
    ClientOutOfRange(usize),
}

/// Convenience result alias used across the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;
