//! Error types for funnelbot.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Chat transport errors (Telegram Bot API).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Send failed for chat {chat_id}: {reason}")]
    SendFailed { chat_id: i64, reason: String },

    #[error("Delete failed for chat {chat_id} message {message_id}: {reason}")]
    DeleteFailed {
        chat_id: i64,
        message_id: i64,
        reason: String,
    },

    #[error("Bot API request failed: {0}")]
    Http(String),

    #[error("Bot API returned an error: {0}")]
    Api(String),
}

/// Conversion intake errors. These are surfaced to the affiliate network
/// through the JSON envelope, never as HTTP error codes.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Missing click_id parameter")]
    MissingCorrelation,

    #[error("Shared secret mismatch for tenant {tenant_id}")]
    BadSecret { tenant_id: i64 },

    #[error("Malformed amount: {raw:?}")]
    BadAmount { raw: String },

    #[error("Malformed tenant id: {raw:?}")]
    BadTenantHint { raw: String },

    #[error("Unknown correlation id: {correlation_id}")]
    UnknownCorrelation { correlation_id: String },
}

/// Result type alias for funnelbot.
pub type Result<T> = std::result::Result<T, Error>;
