//! Identity tokens accepted by the relay

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Who a token belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub display_id: i64,
    #[serde(default)]
    pub wallet_address: String,
}

impl Identity {
    pub fn new(display_id: i64, wallet_address: impl Into<String>) -> Self {
        Self {
            display_id,
            wallet_address: wallet_address.into(),
        }
    }
}

/// Resolves a bearer token presented during the handshake
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<Identity>;
}

/// Fixed token table, loaded from JSON:
///
/// ```json
/// { "token-a": { "display_id": 1234, "wallet_address": "0xabc" } }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Tokens(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| RelayError::Tokens(format!("{}: {}", path.display(), e)))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenVerifier for StaticTokens {
    fn verify(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_token_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"alpha": {{"display_id": 1234, "wallet_address": "0xabc"}}, "beta": {{"display_id": 7}}}}"#
        )
        .unwrap();

        let tokens = StaticTokens::load(file.path()).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens.verify("alpha"), Some(Identity::new(1234, "0xabc")));
        assert_eq!(tokens.verify("beta"), Some(Identity::new(7, "")));
        assert_eq!(tokens.verify("gamma"), None);
    }

    #[test]
    fn test_bad_token_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            StaticTokens::load(dir.path().join("missing.json")),
            Err(RelayError::Tokens(_))
        ));

        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(StaticTokens::load(&path).is_err());
    }
}
