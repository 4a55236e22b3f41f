//! Unified error handling for fanctl-core
//!
//! One error type for the whole crate, built with thiserror. Hardware
//! faults are values here, never panics: the control loop and the
//! verification engine both fold failures into results and keep running.

/// Result type alias using FanCtlError
pub type Result<T> = std::result::Result<T, FanCtlError>;

/// Unified error type for all fan-control operations
#[derive(thiserror::Error, Debug)]
pub enum FanCtlError {
    // ========================================================================
    // Hardware Errors
    // ========================================================================
    #[error("fan controller not available: {0}")]
    ControllerUnavailable(String),

    #[error("fan controller write failed: {0}")]
    ControllerWrite(String),

    #[error("fan controller read failed: {0}")]
    ControllerRead(String),

    #[error("temperature read failed: {0}")]
    TemperatureRead(String),

    #[error("fan {index} not found (controller reports {available} fans)")]
    FanNotFound { index: usize, available: usize },

    // ========================================================================
    // Validation Errors
    // ========================================================================
    #[error("invalid fan curve: {0}")]
    InvalidCurve(String),

    #[error("invalid percentage: {value} (must be 0-100)")]
    InvalidPercentage { value: u16 },

    #[error("invalid configuration value for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ========================================================================
    // Control Flow
    // ========================================================================
    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Generic(String),
}

impl FanCtlError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a controller-write error from a string
    pub fn write(msg: impl Into<String>) -> Self {
        Self::ControllerWrite(msg.into())
    }

    /// Create a controller-read error from a string
    pub fn read(msg: impl Into<String>) -> Self {
        Self::ControllerRead(msg.into())
    }

    /// Create an invalid-config error
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True if this error came from cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<String> for FanCtlError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

impl From<&str> for FanCtlError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
