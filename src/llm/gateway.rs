use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::db::models::CharacterTraits;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Request refused by the model ({reason}): {message}")]
    Refusal { reason: String, message: String },
    #[error("{0}")]
    EmptyResult(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
    #[error("Model API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Model request failed: {0}")]
    Transport(String),
    #[error("No API key configured; set GEMINI_API_KEY")]
    MissingCredential,
}

impl GatewayError {
    /// Refusals, empty results and a missing key fail the same way on every
    /// attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout { .. } | GatewayError::Api { .. } | GatewayError::Transport(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. })
    }
}

/// The two remote model operations a generation job chains together.
/// Images travel as base64 strings in both directions.
#[async_trait]
pub trait ModelGateway: Send + Sync + 'static {
    async fn synthesize_prompt(
        &self,
        source_image: &str,
        traits: &CharacterTraits,
    ) -> Result<String, GatewayError>;

    async fn synthesize_image(
        &self,
        prompt: &str,
        reference_image: Option<&str>,
    ) -> Result<String, GatewayError>;

    fn has_credential(&self) -> bool {
        true
    }
}

type KeyResolver = dyn Fn() -> Option<String> + Send + Sync;

/// API key looked up on every call, so a rotated key is picked up without a
/// restart.
#[derive(Clone)]
pub struct Credentials {
    resolver: Arc<KeyResolver>,
}

impl Credentials {
    pub fn from_env(var: &'static str, fallback: String) -> Self {
        Self::with_resolver(move || {
            std::env::var(var)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .or_else(|| Some(fallback.clone()))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
    }

    pub fn with_resolver<F>(resolver: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Credentials {
            resolver: Arc::new(resolver),
        }
    }

    pub fn resolve(&self) -> Option<String> {
        (self.resolver)()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}
