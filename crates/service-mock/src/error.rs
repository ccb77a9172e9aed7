use thiserror::Error;

/// Errors injected by mock services.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Failure configured on the mock.
    #[error("{0}")]
    Injected(String),

    /// The call was cancelled before it finished.
    #[error("cancelled")]
    Cancelled,
}
