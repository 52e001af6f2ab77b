use hyper::{header, Body, Response, StatusCode};
use std::{io, path::PathBuf, process::ExitStatus, time::Duration};
use thiserror::Error;

/// Everything that can go wrong while running one CGI request.
#[derive(Debug, Error)]
pub enum CgiError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to spawn {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed request body: {0}")]
    MalformedBody(String),

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("invalid header line from script: {0:?}")]
    InvalidHeaderSyntax(String),

    #[error("script produced no output")]
    EmptyResponse,

    #[error("script exited with {0} before sending a header block")]
    ScriptFailed(ExitStatus),

    #[error("script did not finish within {0:?}")]
    Timeout(Duration),

    #[error("process {pid} survived SIGKILL")]
    KillFailed { pid: u32 },

    #[error("no free script slot before the deadline")]
    Overloaded,

    #[error("client went away")]
    ClientGone,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CgiError {
    pub fn status(&self) -> StatusCode {
        match self {
            CgiError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            CgiError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            CgiError::EmptyResponse | CgiError::InvalidHeaderSyntax(_) => StatusCode::BAD_GATEWAY,
            CgiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CgiError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            CgiError::Configuration(_)
            | CgiError::Spawn { .. }
            | CgiError::ScriptFailed(_)
            | CgiError::KillFailed { .. }
            | CgiError::ClientGone
            | CgiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub fn error_response(status: StatusCode) -> Response<Body> {
    let body = format!("<h1>{} Error</h1>", status.as_u16());
    let mut res = Response::new(Body::from(body.clone()));
    *res.status_mut() = status;
    res.headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("text/html"));
    res.headers_mut()
        .insert(header::CONTENT_LENGTH, header::HeaderValue::from(body.len()));
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_statuses() {
        assert_eq!(CgiError::MalformedBody("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(CgiError::EmptyResponse.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            CgiError::Timeout(Duration::from_secs(1)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            CgiError::KillFailed { pid: 1 }.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn renders_error_page() {
        let res = error_response(StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "text/html");
        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&body[..], b"<h1>504 Error</h1>");
    }
}
