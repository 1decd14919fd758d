use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Classification reported to the UI next to the human-readable detail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidConfiguration,
    TransportFailure,
    TlsFailure,
    AuthFailure,
    DecodeFailure,
    ServerFailure,
    StorageFailure,
    NotFound,
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("TLS failure: {0}")]
    Tls(String),
    #[error("authentication rejected (HTTP {status})")]
    Auth { status: u16 },
    #[error("unexpected payload: {0}")]
    Decode(String),
    #[error("server returned HTTP {status}: {detail}")]
    Server { status: u16, detail: String },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            CoreError::Transport(_) => ErrorKind::TransportFailure,
            CoreError::Tls(_) => ErrorKind::TlsFailure,
            CoreError::Auth { .. } => ErrorKind::AuthFailure,
            CoreError::Decode(_) => ErrorKind::DecodeFailure,
            CoreError::Server { .. } => ErrorKind::ServerFailure,
            CoreError::Storage(_) => ErrorKind::StorageFailure,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Errors that mean the whole transport is misconfigured; retrying or
    /// continuing a batch against the same server cannot succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoreError::Tls(_) | CoreError::InvalidConfiguration(_)
        )
    }

    /// Maps a non-success engine response onto the taxonomy.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        if status == StatusCode::BAD_REQUEST && looks_like_plaintext_to_tls(body) {
            return CoreError::Tls(format!(
                "plain HTTP request reached a TLS port: {}",
                body.trim()
            ));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return CoreError::Auth {
                status: status.as_u16(),
            };
        }
        CoreError::Server {
            status: status.as_u16(),
            detail: body.trim().to_string(),
        }
    }
}

fn looks_like_plaintext_to_tls(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("http request to an https server")
        || lower.contains("plain http request was sent to https port")
}

/// Walks a source chain looking for certificate / handshake markers.
/// Neither reqwest nor tungstenite expose the rustls error kind directly.
/// reqwest's top-level message embeds the request URL, which carries node
/// names, so callers start below it.
fn chain_mentions_tls(start: Option<&(dyn std::error::Error + 'static)>) -> bool {
    let mut current = start;
    while let Some(e) = current {
        let msg = e.to_string().to_ascii_lowercase();
        if msg.contains("certificate")
            || msg.contains("handshake")
            || msg.contains("tls")
            || msg.contains("corrupt message")
        {
            return true;
        }
        current = e.source();
    }
    false
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return CoreError::InvalidConfiguration(err.to_string());
        }
        if err.is_decode() {
            return CoreError::Decode(err.to_string());
        }
        if !err.is_timeout() && chain_mentions_tls(std::error::Error::source(&err)) {
            return CoreError::Tls(error_chain(&err));
        }
        if let Some(status) = err.status() {
            return CoreError::from_status(status, "");
        }
        CoreError::Transport(error_chain(&err))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Decode(err.to_string())
    }
}

impl From<tungstenite::Error> for CoreError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Tls(e) => CoreError::Tls(e.to_string()),
            tungstenite::Error::Url(e) => CoreError::InvalidConfiguration(e.to_string()),
            tungstenite::Error::Http(resp) => {
                let body = resp
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).to_string())
                    .unwrap_or_default();
                CoreError::from_status(resp.status(), &body)
            }
            tungstenite::Error::Io(e) => {
                if chain_mentions_tls(Some(&e)) {
                    CoreError::Tls(e.to_string())
                } else {
                    CoreError::Transport(e.to_string())
                }
            }
            other => CoreError::Transport(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        parts.push(e.to_string());
        current = e.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_to_tls_port_is_tls_failure() {
        let err = CoreError::from_status(
            StatusCode::BAD_REQUEST,
            "Client sent an HTTP request to an HTTPS server.\n",
        );
        assert_eq!(err.kind(), ErrorKind::TlsFailure);
        assert!(err.is_terminal());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            CoreError::from_status(StatusCode::UNAUTHORIZED, "").kind(),
            ErrorKind::AuthFailure
        );
        let err = CoreError::from_status(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(err.kind(), ErrorKind::ServerFailure);
        assert_eq!(err.to_string(), "server returned HTTP 502: upstream down");
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn test_node_name_in_url_does_not_imply_tls() {
        let err = reqwest::get("http://127.0.0.1:1/proxies/HK-TLS-01/delay")
            .await
            .unwrap_err();
        let err = CoreError::from(err);
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let v = serde_json::to_value(ErrorKind::InvalidConfiguration).unwrap();
        assert_eq!(v, serde_json::json!("invalid_configuration"));
    }
}
