use serde_json::{json, Value};
use thiserror::Error;

/// Failure talking to a remote engine (Power BI REST, XMLA, warehouse SQL).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timeout")]
    Timeout,
    #[error("HTTP {status}")]
    Http { status: u16, body: String },
    #[error("not authenticated: no token for scope {0}")]
    Auth(&'static str),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("SQL error: {0}")]
    Sql(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Raw response text worth surfacing to the caller, if any.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            TransportError::Http { body, .. } if !body.is_empty() => Some(body.as_str()),
            _ => None,
        }
    }
}

impl From<ureq::Error> for TransportError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => TransportError::Http {
                status,
                body: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(t) => {
                if is_timeout(&t) {
                    TransportError::Timeout
                } else {
                    TransportError::Io(t.to_string())
                }
            }
        }
    }
}

fn is_timeout(err: &ureq::Transport) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            );
        }
        source = e.source();
    }
    err.to_string().to_ascii_lowercase().contains("timed out")
}

impl From<tiberius::error::Error> for TransportError {
    fn from(err: tiberius::error::Error) -> Self {
        TransportError::Sql(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            TransportError::Timeout
        } else {
            TransportError::Io(err.to_string())
        }
    }
}

/// Anything a tool handler can fail with. Never crosses the dispatcher boundary:
/// [`ToolError::into_value`] turns it into the `{error, response?}` payload.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0} required")]
    Required(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    NoSession(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ToolError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ToolError::Invalid(msg.into())
    }

    pub fn into_value(self) -> Value {
        match self {
            ToolError::Transport(t) => match t.response_body() {
                Some(body) => json!({ "error": t.to_string(), "response": body }),
                None => json!({ "error": t.to_string() }),
            },
            other => json!({ "error": other.to_string() }),
        }
    }
}

pub type ToolResult = Result<Value, ToolError>;
