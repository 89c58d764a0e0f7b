use thiserror::Error;

/// Closed error taxonomy shared by every vmkit crate (spec §7).
///
/// Each kind carries a human message and the subsystem that raised it, so
/// callers at the HTTP boundary can map a kind to a status code without
/// inspecting the message text.
#[derive(Debug, Error)]
pub enum Error {
    #[error("[{subsystem}] not found: {message}")]
    NotFound { subsystem: &'static str, message: String },

    #[error("[{subsystem}] already exists: {message}")]
    AlreadyExists { subsystem: &'static str, message: String },

    #[error("[{subsystem}] ambiguous name: {message}")]
    AmbiguousName { subsystem: &'static str, message: String },

    #[error("[{subsystem}] invalid input: {message}")]
    InvalidInput { subsystem: &'static str, message: String },

    #[error("[{subsystem}] invalid state: {message}")]
    InvalidState { subsystem: &'static str, message: String },

    #[error("[{subsystem}] conflict: {message}")]
    Conflict { subsystem: &'static str, message: String },

    #[error("[{subsystem}] resources exhausted: {message}")]
    ResourcesExhausted { subsystem: &'static str, message: String },

    #[error("[{subsystem}] dependency unavailable: {message}")]
    DependencyUnavailable { subsystem: &'static str, message: String },

    #[error("[{subsystem}] cancelled: {message}")]
    Cancelled { subsystem: &'static str, message: String },

    #[error("[{subsystem}] timeout: {message}")]
    Timeout { subsystem: &'static str, message: String },

    #[error("[{subsystem}] internal error: {message}")]
    Internal { subsystem: &'static str, message: String },
}

impl Error {
    pub fn not_found(subsystem: &'static str, message: impl Into<String>) -> Self {
        Error::NotFound { subsystem, message: message.into() }
    }
    pub fn already_exists(subsystem: &'static str, message: impl Into<String>) -> Self {
        Error::AlreadyExists { subsystem, message: message.into() }
    }
    pub fn ambiguous_name(subsystem: &'static str, message: impl Into<String>) -> Self {
        Error::AmbiguousName { subsystem, message: message.into() }
    }
    pub fn invalid_input(subsystem: &'static str, message: impl Into<String>) -> Self {
        Error::InvalidInput { subsystem, message: message.into() }
    }
    pub fn invalid_state(subsystem: &'static str, message: impl Into<String>) -> Self {
        Error::InvalidState { subsystem, message: message.into() }
    }
    pub fn conflict(subsystem: &'static str, message: impl Into<String>) -> Self {
        Error::Conflict { subsystem, message: message.into() }
    }
    pub fn resources_exhausted(subsystem: &'static str, message: impl Into<String>) -> Self {
        Error::ResourcesExhausted { subsystem, message: message.into() }
    }
    pub fn dependency_unavailable(subsystem: &'static str, message: impl Into<String>) -> Self {
        Error::DependencyUnavailable { subsystem, message: message.into() }
    }
    pub fn cancelled(subsystem: &'static str, message: impl Into<String>) -> Self {
        Error::Cancelled { subsystem, message: message.into() }
    }
    pub fn timeout(subsystem: &'static str, message: impl Into<String>) -> Self {
        Error::Timeout { subsystem, message: message.into() }
    }
    pub fn internal(subsystem: &'static str, message: impl Into<String>) -> Self {
        Error::Internal { subsystem, message: message.into() }
    }

    /// True for errors where a delete-style caller should treat a missing
    /// downstream resource as already-cleaned-up rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Closed code used for the client-facing `{code, message}` JSON body
    /// (spec §7). The HTTP status mapping lives outside this crate's scope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::AmbiguousName { .. } => "ambiguous_name",
            Error::InvalidInput { .. } => "invalid_input",
            Error::InvalidState { .. } => "invalid_state",
            Error::Conflict { .. } => "conflict",
            Error::ResourcesExhausted { .. } => "resources_exhausted",
            Error::DependencyUnavailable { .. } => "dependency_unavailable",
            Error::Cancelled { .. } => "cancelled",
            Error::Timeout { .. } => "timeout",
            Error::Internal { .. } => "internal",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::not_found("io", e.to_string())
        } else {
            Error::internal("io", e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::invalid_input("json", e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_mapping_is_stable() {
        assert_eq!(Error::not_found("x", "y").code(), "not_found");
        assert_eq!(Error::conflict("x", "y").code(), "conflict");
        assert_eq!(Error::resources_exhausted("x", "y").code(), "resources_exhausted");
    }

    #[test]
    fn is_not_found_only_matches_that_variant() {
        assert!(Error::not_found("x", "y").is_not_found());
        assert!(!Error::internal("x", "y").is_not_found());
    }

    #[test]
    fn io_not_found_maps_to_not_found_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(err.is_not_found());
    }
}
