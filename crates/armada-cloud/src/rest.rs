//! Shared REST plumbing for the vSphere and ESX backends.
//!
//! Session-token auth: login once with basic credentials, attach the token
//! to every request, re-login and retry once on 401.

use std::path::Path;

use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{CloudError, CloudResult};

pub(crate) struct RestClient {
    http: reqwest::Client,
    base: String,
    username: String,
    password: String,
    session_path: String,
    session_header: &'static str,
    session: RwLock<Option<String>>,
}

impl RestClient {
    pub(crate) fn new(
        base: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        session_path: impl Into<String>,
        session_header: &'static str,
        insecure: bool,
    ) -> Self {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            session_path: session_path.into(),
            session_header,
            session: RwLock::new(None),
        }
    }

    async fn login(&self) -> CloudResult<String> {
        let url = format!("{}{}", self.base, self.session_path);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| CloudError(format!("session login failed: {e}")))?;
        if !response.status().is_success() {
            return Err(CloudError(format!(
                "session login rejected: {}",
                response.status()
            )));
        }
        let token: String = response
            .json()
            .await
            .map_err(|e| CloudError(format!("session token unreadable: {e}")))?;
        debug!(base = %self.base, "provider session established");
        *self.session.write().await = Some(token.clone());
        Ok(token)
    }

    async fn token(&self) -> CloudResult<String> {
        if let Some(token) = self.session.read().await.clone() {
            return Ok(token);
        }
        self.login().await
    }

    /// Issue a JSON request. Retries once through a fresh session on 401.
    pub(crate) async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> CloudResult<Value> {
        let url = format!("{}{}", self.base, path);
        for fresh_session in [false, true] {
            let token = if fresh_session {
                self.login().await?
            } else {
                self.token().await?
            };

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(self.session_header, &token);
            if let Some(json) = body {
                request = request.json(json);
            }
            let response = request
                .send()
                .await
                .map_err(|e| CloudError(format!("{method} {path}: {e}")))?;

            if response.status() == StatusCode::UNAUTHORIZED && !fresh_session {
                continue;
            }
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(CloudError(format!("{method} {path}: {status}: {text}")));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| CloudError(format!("{method} {path}: {e}")))?;
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_slice(&bytes)
                .map_err(|e| CloudError(format!("{method} {path}: bad response: {e}")));
        }
        unreachable!("second attempt always returns")
    }

    pub(crate) async fn get(&self, path: &str) -> CloudResult<Value> {
        self.request(Method::GET, path, None).await
    }

    pub(crate) async fn post(&self, path: &str, body: &Value) -> CloudResult<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub(crate) async fn delete(&self, path: &str) -> CloudResult<Value> {
        self.request(Method::DELETE, path, None).await
    }

    /// PUT a local file to a datastore upload path (basic auth, not the
    /// session token — datastore endpoints predate the session API).
    pub(crate) async fn upload_file(&self, path_and_query: &str, file: &Path) -> CloudResult<()> {
        let url = format!("{}{}", self.base, path_and_query);
        let content = tokio::fs::read(file)
            .await
            .map_err(|e| CloudError(format!("read {file:?}: {e}")))?;
        let response = self
            .http
            .put(&url)
            .basic_auth(&self.username, Some(&self.password))
            .body(content)
            .send()
            .await
            .map_err(|e| CloudError(format!("upload to {path_and_query}: {e}")))?;
        if !response.status().is_success() {
            return Err(CloudError(format!(
                "upload to {path_and_query}: {}",
                response.status()
            )));
        }
        Ok(())
    }
}
