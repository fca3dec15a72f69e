//! Access-token storage and identity decoding.
//!
//! The token is a JWT issued by the REST API at login. Only its payload is
//! read here (no signature check); the server authenticates the socket.

use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::config::ClientConfig;
use crate::envelope::de_string_or_number;
use crate::error::{ClientError, Result};

/// Where the connection manager reads the bearer token at connect time.
pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// Token held in memory. Cloning shares the slot, so a login elsewhere is
/// seen by the next connect.
#[derive(Debug, Clone, Default)]
pub struct MemoryToken {
    slot: Arc<RwLock<Option<String>>>,
}

impl MemoryToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self { slot: Arc::new(RwLock::new(Some(token.into()))) }
    }

    pub fn set(&self, token: Option<String>) {
        if let Ok(mut guard) = self.slot.write() {
            *guard = token;
        }
    }
}

impl TokenSource for MemoryToken {
    fn access_token(&self) -> Option<String> {
        self.slot.read().ok().and_then(|g| g.clone())
    }
}

/// Token persisted in a file, read fresh on every call.
#[derive(Debug, Clone)]
pub struct FileToken {
    path: PathBuf,
}

impl FileToken {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `token`, creating parent directories as needed.
    pub fn store(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, token.trim())?;
        Ok(())
    }

    /// Remove the stored token. Missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl TokenSource for FileToken {
    fn access_token(&self) -> Option<String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Build the token source the config points at: inline token first, then file.
pub fn token_source_from_config(config: &ClientConfig) -> Result<Arc<dyn TokenSource>> {
    if let Some(token) = &config.token {
        return Ok(Arc::new(MemoryToken::new(token.clone())));
    }
    if let Some(path) = &config.token_file {
        return Ok(Arc::new(FileToken::new(path.clone())));
    }
    Err(ClientError::MissingToken)
}

/// JWT payload fields issued by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(deserialize_with = "de_string_or_number")]
    pub user_id: String,
    #[serde(default)]
    pub user_email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl Claims {
    /// Decode the claims of `token` without checking its signature or expiry.
    pub fn decode(token: &str) -> Result<Self> {
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
            .map(|data| data.claims)
            .map_err(|e| ClientError::InvalidToken(e.to_string()))
    }

    /// True when `exp` is set and not after `now` (seconds since epoch).
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.exp.map(|exp| exp <= now).unwrap_or(false)
    }
}

/// The authenticated user a connection belongs to.
///
/// The logged-out state is represented by `Option::<Identity>::None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), username: username.into() }
    }

    pub fn from_token(token: &str) -> Result<Self> {
        let claims = Claims::decode(token)?;
        Ok(Self { user_id: claims.user_id, username: claims.username })
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.username, self.user_id)
    }
}

#[cfg(test)]
pub(crate) fn make_jwt(payload: &serde_json::Value) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    encode(&Header::default(), payload, &EncodingKey::from_secret(b"issuer-secret")).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_numeric_user_id() {
        let token = make_jwt(&json!({"user_id": 7, "user_email": "a@b.c", "username": "alice", "exp": 100}));
        let claims = Claims::decode(&token).unwrap();
        assert_eq!(claims.user_id, "7");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.exp, Some(100));
    }

    #[test]
    fn decode_string_user_id() {
        let token = make_jwt(&json!({"user_id": "01HXYZ", "username": "bob"}));
        let id = Identity::from_token(&token).unwrap();
        assert_eq!(id, Identity::new("01HXYZ", "bob"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Claims::decode("nodots"), Err(ClientError::InvalidToken(_))));
        assert!(matches!(Claims::decode("a.!!!.c"), Err(ClientError::InvalidToken(_))));
    }

    #[test]
    fn decode_rejects_payload_without_user_id() {
        let token = make_jwt(&json!({"username": "nobody"}));
        assert!(Claims::decode(&token).is_err());
    }

    #[test]
    fn decode_ignores_signature_and_expiry() {
        let mut token = make_jwt(&json!({"user_id": 9, "username": "erin", "exp": 1, "aud": "justjio"}));
        token.truncate(token.rfind('.').unwrap());
        token.push_str(".not-the-signature");
        let claims = Claims::decode(&token).unwrap();
        assert_eq!(claims.user_id, "9");
        assert!(claims.is_expired_at(2));
    }

    #[test]
    fn expiry() {
        let token = make_jwt(&json!({"user_id": 1, "exp": 1_000}));
        let claims = Claims::decode(&token).unwrap();
        assert!(!claims.is_expired_at(999));
        assert!(claims.is_expired_at(1_000));
        let forever = Claims::decode(&make_jwt(&json!({"user_id": 1}))).unwrap();
        assert!(!forever.is_expired_at(i64::MAX));
    }

    #[test]
    fn memory_token_is_shared_between_clones() {
        let a = MemoryToken::new("one");
        let b = a.clone();
        a.set(Some("two".into()));
        assert_eq!(b.access_token().as_deref(), Some("two"));
        a.set(None);
        assert!(b.access_token().is_none());
    }

    #[test]
    fn file_token_store_read_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileToken::new(dir.path().join("nested").join("token"));
        assert!(store.access_token().is_none());
        store.store("  tok-123\n").unwrap();
        assert_eq!(store.access_token().as_deref(), Some("tok-123"));
        store.clear().unwrap();
        assert!(store.access_token().is_none());
        // clearing twice is fine
        store.clear().unwrap();
    }

    #[test]
    fn source_from_config_prefers_inline_token() {
        let cfg = ClientConfig { token: Some("inline".into()), token_file: Some("/nope".into()), ..Default::default() };
        let src = token_source_from_config(&cfg).unwrap();
        assert_eq!(src.access_token().as_deref(), Some("inline"));
    }

    #[test]
    fn source_from_config_without_token_errors() {
        let cfg = ClientConfig::default();
        assert!(matches!(token_source_from_config(&cfg), Err(ClientError::MissingToken)));
    }

    #[test]
    fn identity_display() {
        assert_eq!(Identity::new("3", "carol").to_string(), "carol (3)");
    }
}
