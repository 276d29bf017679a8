//! Bearer-token resolution.
//!
//! A token is resolved once, before any storage call, and then passed
//! explicitly to every client operation. Nothing refreshes it mid-run.

use crate::errors::CredentialError;
use serde::Deserialize;
use std::{
    env, fmt, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

pub const TOKEN_ENV_VAR: &str = "BUCKET_RECOVERY_TOKEN";
pub const DEFAULT_TOKEN_FILE: &str = ".bucket-recovery-token";

/// An opaque bearer token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Source of the run's bearer token.
pub trait TokenSource {
    fn token(&self) -> Result<AccessToken, CredentialError>;
}

impl TokenSource for AccessToken {
    fn token(&self) -> Result<AccessToken, CredentialError> {
        Ok(self.clone())
    }
}

/// Environment variable first, then a local cache file.
#[derive(Debug, Clone)]
pub struct EnvOrFileTokenSource {
    pub env_var: String,
    pub cache_path: PathBuf,
}

impl EnvOrFileTokenSource {
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            env_var: TOKEN_ENV_VAR.to_string(),
            cache_path: cache_path.into(),
        }
    }

    fn from_cache_file(&self) -> Result<Option<AccessToken>, CredentialError> {
        match fs::read_to_string(&self.cache_path) {
            Ok(contents) => Ok(parse_cached_token(&contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CredentialError::Unreadable {
                path: display(&self.cache_path),
                source,
            }),
        }
    }
}

impl TokenSource for EnvOrFileTokenSource {
    fn token(&self) -> Result<AccessToken, CredentialError> {
        if let Ok(value) = env::var(&self.env_var) {
            let value = value.trim();
            if !value.is_empty() {
                tracing::debug!("using access token from ${}", self.env_var);
                return Ok(AccessToken::new(value));
            }
        }

        if let Some(token) = self.from_cache_file()? {
            tracing::debug!("using access token from {}", self.cache_path.display());
            return Ok(token);
        }

        Err(CredentialError::Missing {
            env_var: self.env_var.clone(),
            cache_path: display(&self.cache_path),
        })
    }
}

#[derive(Deserialize)]
struct CachedToken {
    access_token: String,
}

/// The cache file holds either the raw token or `{"access_token": "..."}`.
fn parse_cached_token(contents: &str) -> Option<AccessToken> {
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') {
        return serde_json::from_str::<CachedToken>(trimmed)
            .ok()
            .map(|cached| cached.access_token.trim().to_string())
            .filter(|token| !token.is_empty())
            .map(AccessToken::new);
    }
    Some(AccessToken::new(trimmed))
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
