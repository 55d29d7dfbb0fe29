//! Bearer token acquisition.
//!
//! The client asks for a token on every request and never caches one itself. Refreshing an
//! expiring credential is the provider's job, which lets an external tool (for example a
//! `gcloud auth print-access-token` cron job) rotate a key file underneath a running mount.

use std::future::Future;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::AuthError;

/// Supplies a bearer token for each request.
pub trait TokenProvider: Send + Sync + 'static {
    /// Return a token that is valid right now.
    fn token(&self) -> impl Future<Output = Result<SecretString, AuthError>> + Send;
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: SecretString,
}

impl StaticTokenProvider {
    /// Wrap an already acquired token.
    #[must_use]
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<SecretString, AuthError> {
        Ok(self.token.clone())
    }
}

/// Reads the token from a file on every call.
///
/// The file holds either the raw token or a JSON object with an `access_token` field, which is
/// the shape OAuth token endpoints return.
#[derive(Debug, Clone)]
pub struct KeyFileTokenProvider {
    path: PathBuf,
}

#[derive(Deserialize)]
struct TokenFile {
    access_token: String,
}

impl KeyFileTokenProvider {
    /// Create a provider for the given key file. The file is not read until the first request.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The key file this provider reads.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, contents: &str) -> Result<SecretString, AuthError> {
        let trimmed = contents.trim();
        if trimmed.starts_with('{') {
            return serde_json::from_str::<TokenFile>(trimmed)
                .map(|f| SecretString::from(f.access_token))
                .map_err(|_| AuthError::MissingToken(self.path.clone()));
        }
        if trimmed.is_empty() {
            return Err(AuthError::MissingToken(self.path.clone()));
        }
        Ok(SecretString::from(trimmed.to_owned()))
    }
}

impl TokenProvider for KeyFileTokenProvider {
    async fn token(&self) -> Result<SecretString, AuthError> {
        let contents =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|source| AuthError::KeyFile {
                    path: self.path.clone(),
                    source,
                })?;
        self.parse(&contents)
    }
}

/// The credential sources a mount can be configured with.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Re-read a key file on every request.
    KeyFile(KeyFileTokenProvider),
    /// Use a fixed token.
    Static(StaticTokenProvider),
    /// Nothing configured; every request fails with [`AuthError::NoCredential`].
    Missing,
}

impl Credentials {
    /// Pick a source: the key file if one is given, otherwise the token in `env_var`.
    #[must_use]
    pub fn resolve(key_file: Option<&Path>, env_var: &str) -> Self {
        if let Some(path) = key_file {
            return Self::KeyFile(KeyFileTokenProvider::new(path));
        }
        match std::env::var(env_var) {
            Ok(token) if !token.trim().is_empty() => Self::Static(StaticTokenProvider::new(
                SecretString::from(token.trim().to_owned()),
            )),
            _ => Self::Missing,
        }
    }
}

impl TokenProvider for Credentials {
    async fn token(&self) -> Result<SecretString, AuthError> {
        match self {
            Self::KeyFile(p) => p.token().await,
            Self::Static(p) => p.token().await,
            Self::Missing => Err(AuthError::NoCredential),
        }
    }
}
