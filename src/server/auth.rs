use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::ServerConfig;
use crate::protocol::AuthRequest;

const USER_AGENT: &str = concat!("caas/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid client id or secret")]
    InvalidCredentials,
    #[error("{0}")]
    Rejected(String),
    #[error("auth service request failed: {0}")]
    Service(#[from] reqwest::Error),
}

/// Validates client credentials. The policy is fixed at construction:
/// static comparison when the server carries credentials, delegation when
/// an auth service URL is configured, otherwise disabled.
pub enum Authenticator {
    Static { id: String, secret: String },
    Delegated { url: String, client: reqwest::Client },
    Disabled,
}

#[derive(Debug, Deserialize)]
struct ServiceVerdict {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl Authenticator {
    /// True when no auth policy applies; such sessions are
    /// pre-authenticated at connect. This is the one disablement
    /// predicate; callers must not re-derive it from the config.
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }

    pub fn from_config(cfg: &ServerConfig) -> Self {
        if !cfg.client_id.is_empty() && !cfg.client_secret.is_empty() {
            Self::Static {
                id: cfg.client_id.clone(),
                secret: cfg.client_secret.clone(),
            }
        } else if !cfg.auth_service.is_empty() {
            Self::Delegated {
                url: cfg.auth_service.clone(),
                client: reqwest::Client::new(),
            }
        } else {
            Self::Disabled
        }
    }

    pub async fn authenticate(&self, client_id: &str, client_secret: &str) -> Result<(), AuthError> {
        match self {
            Self::Static { id, secret } => {
                if client_id == id && client_secret == secret {
                    Ok(())
                } else {
                    Err(AuthError::InvalidCredentials)
                }
            }
            Self::Delegated { url, client } => {
                debug!("delegating auth for client {client_id} to {url}");
                let response = client
                    .post(url)
                    .header("X-Client-ID", client_id)
                    .header("X-Client-Secret", client_secret)
                    .header(reqwest::header::USER_AGENT, USER_AGENT)
                    .json(&AuthRequest {
                        client_id: client_id.to_string(),
                        client_secret: client_secret.to_string(),
                    })
                    .send()
                    .await?;

                let status = response.status();
                let verdict = response.json::<ServiceVerdict>().await.unwrap_or(ServiceVerdict {
                    code: 0,
                    message: format!("auth service returned status {status}"),
                });

                if status == reqwest::StatusCode::OK && verdict.code == 200 {
                    Ok(())
                } else if !verdict.message.is_empty() {
                    Err(AuthError::Rejected(verdict.message))
                } else {
                    Err(AuthError::Rejected(format!(
                        "auth service rejected client (status {status}, code {})",
                        verdict.code
                    )))
                }
            }
            Self::Disabled => Ok(()),
        }
    }
}
