//! Access Token Cache
//!
//! The ledger authenticates every HTTP call and stream subscription with a
//! bearer token. Token issuance is an external concern; the engine only
//! caches the current token and re-reads it from its source when the ledger
//! reports it expired or when a stream reconnects.

use parking_lot::RwLock;
use std::path::PathBuf;

use super::LedgerError;

/// Where the operator token comes from
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// Fixed token from configuration
    Static(String),
    /// Re-readable token file, rotated by an external process
    File(PathBuf),
}

pub struct TokenProvider {
    source: TokenSource,
    cached: RwLock<Option<String>>,
}

impl TokenProvider {
    pub fn new(source: TokenSource) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
        }
    }

    /// Current token, loading from the source on first use
    pub fn token(&self) -> Result<String, LedgerError> {
        if let Some(token) = self.cached.read().clone() {
            return Ok(token);
        }
        self.refresh()
    }

    /// Drop the cached token so the next call re-reads the source
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    /// Re-read the token from its source and cache it
    pub fn refresh(&self) -> Result<String, LedgerError> {
        let token = match &self.source {
            TokenSource::Static(token) => token.clone(),
            TokenSource::File(path) => std::fs::read_to_string(path)
                .map_err(|e| {
                    LedgerError::Configuration(format!(
                        "Cannot read token file {}: {}",
                        path.display(),
                        e
                    ))
                })?
                .trim()
                .to_string(),
        };
        if token.is_empty() {
            return Err(LedgerError::Configuration("Empty ledger token".into()));
        }
        *self.cached.write() = Some(token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_token() {
        let provider = TokenProvider::new(TokenSource::Static("tok".into()));
        assert_eq!(provider.token().unwrap(), "tok");
        provider.invalidate();
        assert_eq!(provider.token().unwrap(), "tok");
    }

    #[test]
    fn test_empty_token_rejected() {
        let provider = TokenProvider::new(TokenSource::Static(String::new()));
        assert!(matches!(
            provider.token(),
            Err(LedgerError::Configuration(_))
        ));
    }
}
