//! Error taxonomy for the sampling pipeline.
//!
//! Configuration problems are caught when a schedule or stage is built,
//! validation problems before the first sampling step, and numeric blow-ups
//! abort the stage they occur in. Later stages never run on a failed
//! predecessor and there is no retry: callers re-invoke with a new seed.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed schedule name, out-of-range beta, bad solver order, ...
    /// Detected at construction time, never mid-run.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Missing required input or a shape mismatch between a stage and its
    /// denoiser. Detected before any sampling step executes.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A predicted sample contained non-finite values.
    #[error("non-finite values in {stage} sample at step {step}")]
    NumericInstability { stage: String, step: usize },

    #[error(transparent)]
    Tensor(#[from] candle::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
