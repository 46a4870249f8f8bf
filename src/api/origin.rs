// Origin checks for the local-only control plane.

use axum::{
    extract::Request,
    http::{
        header::{ORIGIN, UPGRADE},
        HeaderMap,
    },
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use super::error::ApiError;

/// Origins a local browser page may use: `http://localhost`,
/// `http://127.0.0.1` and `http://[::1]`, bare and with each given port.
pub fn local_origins(ports: &[u16]) -> Vec<String> {
    let hosts = ["localhost", "127.0.0.1", "[::1]"];
    let mut origins: Vec<String> = hosts.iter().map(|h| format!("http://{}", h)).collect();
    for port in ports {
        origins.extend(hosts.iter().map(|h| format!("http://{}:{}", h, port)));
    }
    origins
}

/// How the upgrade guard classifies a request.
#[derive(Debug, PartialEq, Eq)]
enum Admission {
    /// Plain HTTP; CORS already covers it.
    NotUpgrade,
    /// Upgrade without an `Origin` header, i.e. a script or agent.
    NoOrigin,
    Local,
    Foreign(String),
}

fn admission(headers: &HeaderMap, allowed: &[String]) -> Admission {
    let upgrading = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrading {
        return Admission::NotUpgrade;
    }
    let Some(value) = headers.get(ORIGIN) else {
        return Admission::NoOrigin;
    };
    // A non-ASCII origin never matches the allow-list.
    let origin = String::from_utf8_lossy(value.as_bytes());
    if allowed.iter().any(|a| *a == origin) {
        Admission::Local
    } else {
        Admission::Foreign(origin.into_owned())
    }
}

/// Middleware answering 403 to WebSocket upgrades from a browser page
/// outside `allowed`.
pub async fn check_ws_origin(
    allowed: Arc<[String]>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match admission(req.headers(), &allowed) {
        Admission::Foreign(origin) => {
            tracing::warn!(%origin, uri = %req.uri(), "refusing websocket upgrade");
            Err(ApiError::OriginNotAllowed(origin))
        }
        Admission::NoOrigin => {
            tracing::debug!("websocket upgrade without origin");
            Ok(next.run(req).await)
        }
        Admission::Local | Admission::NotUpgrade => Ok(next.run(req).await),
    }
}
