use http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network-level failure (connect, timeout, body read). Retryable.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered 5xx; the request may succeed on retry.
    #[error("server error {status}: {body}")]
    ServerError { status: StatusCode, body: String },

    /// 401/403. Never retried; bad credentials won't get better.
    #[error("authentication rejected ({status})")]
    Auth { status: StatusCode },

    /// Any other non-2xx response. The query itself is at fault.
    #[error("query failed ({status}): {body}")]
    Query { status: StatusCode, body: String },

    /// The requested field mapping contradicts the live index mapping.
    /// Requires operator action.
    #[error(
        "mapping conflict on {index}/{field}: mapped as {existing:?}, requested {requested:?}"
    )]
    MappingConflict {
        index: String,
        field: String,
        existing: String,
        requested: String,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request signing failed: {0}")]
    Signing(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::ServerError { .. })
    }
}
