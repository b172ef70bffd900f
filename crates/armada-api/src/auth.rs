//! HTTP basic authentication against the users table.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use tracing::debug;
use uuid::Uuid;

use armada_core::hex_digest;
use armada_state::UserRecord;

use crate::ApiState;

/// The authenticated username, inserted as a request extension.
#[derive(Clone)]
pub struct CurrentUser(pub String);

/// Salted password digest as stored on a user record.
pub fn digest_password(salt: &str, password: &str) -> String {
    hex_digest(format!("{salt}{password}").as_bytes())
}

/// Build a fresh user record from plaintext credentials.
pub fn new_user_record(username: &str, password: &str) -> UserRecord {
    let salt = Uuid::new_v4().to_string();
    let password_digest = digest_password(&salt, password);
    UserRecord {
        username: username.to_string(),
        salt,
        password_digest,
    }
}

pub async fn require_auth(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_basic)
        .and_then(|(username, password)| {
            match state.store.get_user(&username) {
                Ok(Some(user)) if verify(&user, &password) => Some(username),
                _ => None,
            }
        });

    match authorized {
        Some(username) => {
            request.extensions_mut().insert(CurrentUser(username));
            next.run(request).await
        }
        None => {
            debug!("request rejected: missing or wrong credentials");
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"armada\"")],
            )
                .into_response()
        }
    }
}

fn parse_basic(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn verify(user: &UserRecord, password: &str) -> bool {
    digest_password(&user.salt, password) == user.password_digest
}
