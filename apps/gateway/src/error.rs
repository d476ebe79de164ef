use std::fmt;

/// Application-level error for gateway commands.
///
/// Command rejections are acknowledged to the issuing connection only and
/// never broadcast; the variant decides the `code` field of the `error` ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Bad or missing token at handshake. The connection is closed without
    /// emitting any event.
    Unauthenticated(String),
    /// Authenticated user is not allowed to touch the target resource.
    Forbidden(String),
    /// Referenced conversation/message/user does not exist.
    NotFound(String),
    /// Malformed or missing command fields.
    InvalidArgument(String),
    /// External collaborator failure (store, notification sender).
    Transient(String),
}

impl GatewayError {
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Stable machine-readable code used in `error` acks.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Transient(_) => "TRANSIENT",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Unauthenticated(m)
            | Self::Forbidden(m)
            | Self::NotFound(m)
            | Self::InvalidArgument(m)
            | Self::Transient(m) => m,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(GatewayError::forbidden("x").code(), "FORBIDDEN");
        assert_eq!(GatewayError::not_found("x").code(), "NOT_FOUND");
        assert_eq!(GatewayError::invalid_argument("x").code(), "INVALID_ARGUMENT");
        assert_eq!(GatewayError::transient("x").code(), "TRANSIENT");
        assert_eq!(GatewayError::unauthenticated("x").code(), "UNAUTHENTICATED");
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = GatewayError::not_found("Conversation not found");
        assert_eq!(err.to_string(), "NOT_FOUND: Conversation not found");
    }
}
