use thiserror::Error;

/// Reasons a presented bearer token is rejected.
///
/// The `Display` text is what the gateway sends back in the body of a
/// `401 Unauthorized` response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("token is invalid: {0}")]
    InvalidToken(String),

    #[error("token is expired")]
    TokenExpired,

    #[error("token is too old")]
    TokenTooOld,
}

/// Errors raised while loading the destination map.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("failed to read map file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid line {line}: {content:?}")]
    InvalidLine { line: usize, content: String },
}

/// Errors raised while loading the token verification key.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to read public key {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse public key: {0}")]
    Parse(String),
}

/// Errors produced while setting the gateway up.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type GateResult<T> = Result<T, GateError>;
