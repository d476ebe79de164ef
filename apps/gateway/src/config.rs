use std::time::Duration;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the WebSocket server binds to.
    pub port: u16,
    /// HS256 secret used to validate handshake tokens.
    pub jwt_secret: String,
    /// How long an unanswered call may stay in `ringing` before auto-cancel.
    pub ringing_timeout: Duration,
    /// How long a typing indicator survives without a refresh.
    pub typing_expiry: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4000),
            jwt_secret: required_var("JWT_SECRET"),
            ringing_timeout: Duration::from_secs(secs_var("RINGING_TIMEOUT_SECS", 45)),
            typing_expiry: Duration::from_secs(secs_var("TYPING_EXPIRY_SECS", 6)),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn secs_var(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
