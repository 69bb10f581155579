//! Request gates that run before anything reaches the arbiter queue.

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// User-Agent fragments of link-preview crawlers and bots.
const BOT_MARKERS: &[&str] = &["bot", "Bot", "facebookexternalhit"];

/// Basic-auth credentials. A `None` half is not checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    fn accepts(&self, username: &str, password: &str) -> bool {
        let user_ok = self.username.as_deref().map_or(true, |u| u == username);
        let pass_ok = self.password.as_deref().map_or(true, |p| p == password);
        user_ok && pass_ok
    }
}

/// Splits `Authorization: Basic <base64(user:pass)>`.
fn basic_credentials(value: &HeaderValue) -> Option<(String, String)> {
    let value = value.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Rejects requests without matching credentials. They never reach the
/// arbiter, so they cannot use up the exchange.
pub async fn basic_auth(
    State(credentials): State<Credentials>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(basic_credentials)
        .is_some_and(|(user, pass)| credentials.accepts(&user, &pass));

    if !authorized {
        tracing::debug!(uri = %request.uri(), "rejected request without valid credentials");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"oneshot\"")],
            "Unauthorized\n",
        )
            .into_response();
    }

    next.run(request).await
}

pub fn is_bot(user_agent: &str) -> bool {
    BOT_MARKERS.iter().any(|marker| user_agent.contains(marker))
}

/// Answers link-preview bots with an empty 200 so chat apps that unfurl a
/// pasted URL do not consume the exchange.
pub async fn block_bots(request: Request, next: Next) -> Response {
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if is_bot(user_agent) {
        tracing::debug!(user_agent, "answered bot request");
        return StatusCode::OK.into_response();
    }

    next.run(request).await
}

pub async fn no_cache(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}
