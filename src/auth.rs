// src/auth.rs

use std::fmt;
use std::future::Future;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::{
    CONTENT_TYPE_JSON, Endpoint, TlsPolicy, Transport, TransportError, TransportRequest,
};

pub const CLIENT_ID: &str = "node-red-admin";
pub const BEARER: &str = "Bearer";

const TOKEN_PATH: &str = "/auth/token";
const REVOKE_PATH: &str = "/auth/revoke";

/// Admin credentials stored with a dispatcher node.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            password: Some(password.into()),
        }
    }

    /// Username with surrounding whitespace removed, empty when unset.
    pub fn username(&self) -> &str {
        self.user.as_deref().map(str::trim).unwrap_or_default()
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or_default()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("{message} (code: {status}, url: {url})")]
    Denied {
        status: u16,
        message: String,
        url: String,
    },
    #[error("Fail to parse token. (url: {url})")]
    Parse { url: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl AuthError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AuthError::Denied { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Headers handed to the privileged request while a token is live.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    token: String,
}

impl AuthHeaders {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn authorization(&self) -> String {
        format!("{} {}", BEARER, self.token)
    }

    pub fn to_vec(&self) -> Vec<(String, String)> {
        vec![
            ("Authorization".to_string(), self.authorization()),
            ("Content-type".to_string(), CONTENT_TYPE_JSON.to_string()),
        ]
    }
}

impl fmt::Debug for AuthHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthHeaders(Bearer ***)")
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Request-scoped bearer token against one runtime's admin API:
/// request, use once, revoke.
pub struct CredentialSession<'a, T: Transport + ?Sized> {
    transport: &'a T,
    endpoint: Endpoint,
    credentials: &'a Credentials,
    tls: TlsPolicy,
}

impl<'a, T: Transport + ?Sized> CredentialSession<'a, T> {
    pub fn new(
        transport: &'a T,
        endpoint: Endpoint,
        credentials: &'a Credentials,
        tls: TlsPolicy,
    ) -> Self {
        Self {
            transport,
            endpoint,
            credentials,
            tls,
        }
    }

    /// Obtain a token, run `on_granted` with it, then revoke it whatever
    /// `on_granted` produced. A denied or unparseable token request is
    /// returned as an error and nothing is revoked.
    pub async fn with_token<F, Fut, R>(&self, on_granted: F) -> Result<R, AuthError>
    where
        F: FnOnce(AuthHeaders) -> Fut,
        Fut: Future<Output = R>,
    {
        let headers = self.request_token().await?;
        debug!(endpoint = %self.endpoint, state = "token_granted", "access token granted");

        let token = headers.token.clone();
        let result = on_granted(headers).await;
        debug!(endpoint = %self.endpoint, state = "request_sent", "privileged request finished");

        self.revoke(&token).await;
        Ok(result)
    }

    async fn request_token(&self) -> Result<AuthHeaders, AuthError> {
        let url = self.endpoint.url(TOKEN_PATH);
        let body = json!({
            "client_id": CLIENT_ID,
            "grant_type": "password",
            "scope": "*",
            "username": self.credentials.username(),
            "password": self.credentials.password(),
        });
        debug!(url = %url, state = "token_requested", "requesting access token");

        let request = TransportRequest::post(&url, body.to_string()).tls(self.tls);
        let resp = self.transport.send(request).await?;

        if resp.status != 200 {
            warn!(url = %url, status = resp.status, state = "token_denied", "access token denied");
            return Err(AuthError::Denied {
                status: resp.status,
                message: resp.status_message,
                url,
            });
        }

        match serde_json::from_str::<TokenResponse>(&resp.body) {
            Ok(parsed) => Ok(AuthHeaders {
                token: parsed.access_token,
            }),
            Err(e) => {
                warn!(url = %url, error = %e, state = "token_denied", "could not parse access token");
                Err(AuthError::Parse { url })
            }
        }
    }

    async fn revoke(&self, token: &str) {
        let url = self.endpoint.url(REVOKE_PATH);
        let request = TransportRequest::post(&url, json!({ "token": token }).to_string())
            .header("Authorization", format!("{BEARER} {token}"))
            .tls(self.tls);

        match self.transport.send(request).await {
            Ok(resp) if resp.status == 200 => {
                info!(url = %url, state = "token_revoked", "revoked access token");
            }
            Ok(resp) => {
                warn!(
                    url = %url,
                    status = resp.status,
                    reason = %resp.status_message,
                    "fail to revoke access token"
                );
            }
            Err(e) => {
                warn!(url = %url, code = %e.code, "fail to revoke access token: {}", e.message);
            }
        }
    }
}
