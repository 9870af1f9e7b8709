use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum LodestarError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(lodestar::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(lodestar::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(lodestar::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(lodestar::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("JOSE error: {0}")]
    #[diagnostic(code(lodestar::jose))]
    Jose(String),

    #[error("Device not found")]
    #[diagnostic(code(lodestar::not_found))]
    NotFound,

    #[error("Device code has expired")]
    #[diagnostic(code(lodestar::expired))]
    Expired,

    #[error("Device code is no longer valid")]
    #[diagnostic(code(lodestar::conflict))]
    Conflict,

    #[error("Device does not belong to the requesting user")]
    #[diagnostic(code(lodestar::forbidden))]
    Forbidden,

    #[error("Invalid request: {0}")]
    #[diagnostic(code(lodestar::invalid_input))]
    InvalidInput(String),

    #[error("Too many requests")]
    #[diagnostic(code(lodestar::rate_limited))]
    RateLimited,

    #[error("Invalid or expired session token")]
    #[diagnostic(code(lodestar::token_invalid))]
    TokenInvalid,

    #[error("{0}")]
    #[diagnostic(code(lodestar::other))]
    Other(String),
}

impl From<josekit::JoseError> for LodestarError {
    fn from(value: josekit::JoseError) -> Self {
        LodestarError::Jose(value.to_string())
    }
}
