use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// GNAP error response code for malformed requests.
pub const ERR_INVALID_REQUEST: &str = "invalid_request";
/// GNAP error response code for everything the server refuses to grant.
pub const ERR_REQUEST_DENIED: &str = "request_denied";

#[derive(Debug)]
pub enum Error {
    // Request classification
    InvalidRequest(String),
    RequestDenied(String),

    // Proof verification
    MissingSignature,
    BadSignature(String),
    KeyMismatch,
    BodyDigestMismatch,
    UnsupportedProof(String),

    // Interaction
    UnknownTxn,
    WrongState,
    InteractionExpired,

    // Storage
    StoreConflict,
    Storage(String),

    // Upstream identity provider
    Network(String),

    // Generic errors
    Internal(String),
}

impl Error {
    /// The GNAP wire code this error collapses to. Handle lookups, proof
    /// failures and policy denials are indistinguishable on the wire.
    pub fn gnap_code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => ERR_INVALID_REQUEST,
            _ => ERR_REQUEST_DENIED,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidRequest(msg) => write!(f, "invalid_request: {}", msg),
            Error::RequestDenied(msg) => write!(f, "request_denied: {}", msg),
            Error::MissingSignature => write!(f, "request signature missing"),
            Error::BadSignature(msg) => write!(f, "bad request signature: {}", msg),
            Error::KeyMismatch => write!(f, "request key does not match bound key"),
            Error::BodyDigestMismatch => write!(f, "content-digest does not match body"),
            Error::UnsupportedProof(method) => write!(f, "unsupported proof method: {}", method),
            Error::UnknownTxn => write!(f, "unknown transaction"),
            Error::WrongState => write!(f, "transaction in wrong state"),
            Error::InteractionExpired => write!(f, "interaction expired"),
            Error::StoreConflict => write!(f, "store conflict"),
            Error::Storage(msg) => write!(f, "storage error: {}", msg),
            Error::Network(msg) => write!(f, "network error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

// axum IntoResponse implementation
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::Json;
        use axum::http::StatusCode;

        use crate::gnap::ErrorResponse;

        let status = match self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Storage(_) | Error::Internal(_) | Error::Network(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::UNAUTHORIZED,
        };

        // The body never says whether a handle was unknown, expired or
        // replayed; details stay in the server log.
        let body = ErrorResponse {
            error: self.gnap_code().to_string(),
            error_description: None,
        };

        (status, Json(body)).into_response()
    }
}
