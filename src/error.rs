use thiserror::Error;

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum OpsError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration document: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Component errors
    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Component failure: {component} - {reason}")]
    ComponentFailure { component: String, reason: String },

    #[error("Dependency {dependency} of {component} is not running and healthy")]
    DependencyFailed {
        component: String,
        dependency: String,
    },

    #[error("Restart refused for {component}: {reason}")]
    RestartRefused { component: String, reason: String },

    // Alerting errors
    #[error("Unknown alert: {0}")]
    UnknownAlert(String),

    #[error("Unknown notification channel: {0}")]
    UnknownChannel(String),

    #[error("Notification channel disabled: {0}")]
    ChannelDisabled(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Feature disabled: {0}")]
    FeatureDisabled(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for OpsError
pub type Result<T> = std::result::Result<T, OpsError>;

impl OpsError {
    /// Wrap an adapter-level failure for a component
    pub fn component(component: &str, reason: impl std::fmt::Display) -> Self {
        OpsError::ComponentFailure {
            component: component.to_string(),
            reason: reason.to_string(),
        }
    }
}
