//! HTTP transport for the Proxmox VE JSON API.
//!
//! The transport is a trait so the executor's retry protocol can be tested
//! without a live cluster. The real implementation authenticates with a
//! ticket cookie plus CSRF prevention token and classifies failures into the
//! crate error taxonomy.

use crate::config::PveSettings;
use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use serde_json::Value;

/// HTTP method subset used by the consumed API surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

/// An authenticated API session.
#[derive(Clone, Debug)]
pub struct Session {
    pub ticket: String,
    pub csrf_token: String,
}

/// Raw request/login surface of the control plane.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// Establish a fresh session.
    async fn login(&self) -> BridgeResult<Session>;

    /// Issue one API call. `path` is relative to the `/api2/json` base.
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        session: &Session,
    ) -> BridgeResult<Value>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    http: reqwest::Client,
    base: String,
    user: String,
    password: String,
}

impl HttpTransport {
    pub fn new(settings: &PveSettings) -> BridgeResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()
            .map_err(|e| BridgeError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base: settings.api_base(),
            user: settings.user.clone(),
            password: settings.password.clone(),
        })
    }

    fn classify_transport(err: reqwest::Error) -> BridgeError {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            BridgeError::Connection(err.to_string())
        } else {
            BridgeError::Api(err.to_string())
        }
    }

    async fn classify_response(path: &str, response: reqwest::Response) -> BridgeError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            401 => BridgeError::Auth(format!("{} rejected with 401: {}", path, body)),
            404 => BridgeError::NotFound(format!("{}: {}", path, body)),
            code => BridgeError::Api(format!("{} failed with {}: {}", path, code, body)),
        }
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn login(&self) -> BridgeResult<Session> {
        let url = format!("{}/access/ticket", self.base);
        let form = [("username", self.user.as_str()), ("password", self.password.as_str())];

        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Auth(format!(
                "ticket request failed with {}: {}",
                status, body
            )));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| BridgeError::Auth(format!("invalid ticket response: {}", e)))?;

        let data = &envelope["data"];
        let ticket = data["ticket"].as_str();
        let csrf = data["CSRFPreventionToken"].as_str();
        match (ticket, csrf) {
            (Some(ticket), Some(csrf)) => {
                tracing::debug!(user = %self.user, "established control-plane session");
                Ok(Session {
                    ticket: ticket.to_string(),
                    csrf_token: csrf.to_string(),
                })
            }
            _ => Err(BridgeError::Auth(
                "ticket response missing ticket or CSRF token".to_string(),
            )),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        session: &Session,
    ) -> BridgeResult<Value> {
        let url = format!("{}{}", self.base, path);

        let mut builder = match method {
            Method::Get => self.http.get(&url).query(params),
            Method::Post => self
                .http
                .post(&url)
                .header("CSRFPreventionToken", &session.csrf_token)
                .form(params),
            Method::Delete => self
                .http
                .delete(&url)
                .header("CSRFPreventionToken", &session.csrf_token),
        };
        builder = builder.header(
            reqwest::header::COOKIE,
            format!("PVEAuthCookie={}", session.ticket),
        );

        let response = builder.send().await.map_err(Self::classify_transport)?;

        if !response.status().is_success() {
            return Err(Self::classify_response(path, response).await);
        }

        response
            .json()
            .await
            .map_err(|e| BridgeError::Api(format!("{} returned invalid JSON: {}", path, e)))
    }
}
