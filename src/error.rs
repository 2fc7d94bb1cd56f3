//! Typed, non-recoverable error model for the IES update core.
//!
//! Every public entry point returns `Result<_, IesError>`; nothing in this
//! crate catches one of these locally, and nothing panics on malformed-but
//! well-typed input.

use thiserror::Error;

/// ==============================================================================================
/// ======================================== Error Model =========================================
/// ==============================================================================================

/// The single error type surfaced across the public API.
#[derive(Debug, Error)]
pub enum IesError {
    /// Matrix dimensions inconsistent with masks or with each other.
    #[error("shape error: {0}")]
    Shape(String),

    /// Mask transitions violate monotonicity, or mask sizes disagree between iterations.
    #[error("mask error: {0}")]
    Mask(String),

    /// Unknown configuration key, out-of-range value, or unknown inversion tag.
    #[error("config error: {0}")]
    Config(String),

    /// SVD/solve failure, or a non-finite value appeared where one is not allowed.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// `updateA` called before `init_update`, or before `alloc`.
    #[error("state error: {0}")]
    State(String),
}

impl IesError {
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn mask(msg: impl Into<String>) -> Self {
        Self::Mask(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }
}

pub type IesResult<T> = Result<T, IesError>;
