//! Credentials for devices and operators
//!
//! - Passwords and device tokens are stored as argon2 hashes
//! - Browser sessions are stateless JWTs carrying username and group
//! - Devices authenticate with HTTP Basic (device id, token) on every request
//! - Access is decided by `Group::allows(Permission)`

use std::sync::OnceLock;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Group;

/// Session claims embedded in the cookie token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username)
    pub sub: String,
    /// Access group at login time
    pub group: Group,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    pub iat: u64,
}

/// Signed session token handed to the browser
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub token: String,
    pub expires_in: u64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token encoding failed: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Session has expired")]
    TokenExpired,

    #[error("Wrong credentials")]
    InvalidCredentials,

    #[error("Malformed authorization header")]
    MalformedHeader,

    #[error("Hashing failed: {0}")]
    Hash(String),
}

/// Things an operator may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ViewData,
    EditSettings,
    ChangeOwnPassword,
    ManageUsers,
    ManageDevices,
    ManageFirmware,
    DeleteData,
}

impl Group {
    pub fn allows(&self, permission: Permission) -> bool {
        match self {
            Group::Admin => true,
            Group::User => matches!(
                permission,
                Permission::ViewData | Permission::EditSettings | Permission::ChangeOwnPassword
            ),
        }
    }
}

/// Issues and verifies browser session tokens
pub struct SessionAuth {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: u64, // seconds
}

impl SessionAuth {
    /// Create a new session handler
    ///
    /// # Arguments
    /// * `secret` - HMAC secret for signing tokens (should be >= 32 bytes)
    /// * `ttl` - Session lifetime in seconds
    pub fn new(secret: &[u8], ttl: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Issue a session for a logged-in user
    pub fn issue(&self, username: &str, group: Group) -> Result<SessionToken, AuthError> {
        let now = unix_now();
        let claims = Claims {
            sub: username.to_string(),
            group,
            exp: now + self.ttl,
            iat: now,
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)?;
        Ok(SessionToken {
            token,
            expires_in: self.ttl,
        })
    }

    /// Verify and decode a session token
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::default();
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidCredentials,
            }
        })?;

        if data.claims.exp < unix_now() {
            return Err(AuthError::TokenExpired);
        }

        Ok(data.claims)
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Hash a password or device token for storage
pub fn hash_secret(secret: &str) -> Result<String, AuthError> {
    use rand::Rng;
    let salt_bytes: [u8; 16] = rand::thread_rng().r#gen();
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| AuthError::Hash(e.to_string()))?;

    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

/// Check a plaintext secret against a stored hash
///
/// A stored value that is not a valid PHC string never matches.
pub fn verify_secret(secret: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Burn the same time as a real verification for an unknown principal
pub fn verify_unknown(secret: &str) -> bool {
    static DUMMY: OnceLock<String> = OnceLock::new();
    let dummy = DUMMY.get_or_init(|| hash_secret(&generate_token()).unwrap_or_default());
    verify_secret(secret, dummy);
    false
}

/// [`hash_secret`] on the blocking thread pool
pub async fn hash_secret_blocking(secret: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || hash_secret(&secret))
        .await
        .map_err(|e| AuthError::Hash(e.to_string()))?
}

/// Check `secret` against `stored` on the blocking thread pool
///
/// Without a stored hash the same work is done against a dummy, so
/// unknown principals take as long as wrong secrets.
pub async fn check_secret(secret: String, stored: Option<String>) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || match stored {
        Some(hash) => verify_secret(&secret, &hash),
        None => verify_unknown(&secret),
    })
    .await
    .map_err(|e| AuthError::Hash(e.to_string()))
}

/// Decode an `Authorization: Basic ...` header value into (id, secret)
pub fn parse_basic(header: &str) -> Result<(String, String), AuthError> {
    let encoded = header
        .strip_prefix("Basic ")
        .or_else(|| header.strip_prefix("basic "))
        .ok_or(AuthError::MalformedHeader)?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::MalformedHeader)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::MalformedHeader)?;

    let (id, secret) = decoded.split_once(':').ok_or(AuthError::MalformedHeader)?;
    if id.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    Ok((id.to_string(), secret.to_string()))
}

/// Generate a secure random secret for session signing
pub fn generate_secret() -> [u8; 32] {
    use rand::Rng;
    rand::thread_rng().r#gen()
}

/// Generate a printable device token
pub fn generate_token() -> String {
    use rand::Rng;
    let bytes: [u8; 24] = rand::thread_rng().r#gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_issue_and_verify() {
        let secret = generate_secret();
        let auth = SessionAuth::new(&secret, 60);

        let session = auth.issue("operator", Group::Admin).unwrap();
        assert_eq!(session.expires_in, 60);

        let claims = auth.verify(&session.token).unwrap();
        assert_eq!(claims.sub, "operator");
        assert_eq!(claims.group, Group::Admin);
    }

    #[test]
    fn test_session_signed_with_other_key_is_rejected() {
        let auth = SessionAuth::new(&generate_secret(), 60);
        let other = SessionAuth::new(&generate_secret(), 60);

        let session = other.issue("operator", Group::User).unwrap();
        assert!(matches!(
            auth.verify(&session.token),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(auth.verify("not-a-jwt"), Err(AuthError::InvalidCredentials)));
    }

    #[test]
    fn test_expired_session() {
        let auth = SessionAuth::new(&generate_secret(), 0);
        let session = auth.issue("operator", Group::User).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(matches!(auth.verify(&session.token), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn test_hash_and_verify_secret() {
        let hash = hash_secret("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_secret("hunter2", &hash));
        assert!(!verify_secret("hunter3", &hash));
        assert!(!verify_secret("hunter2", "plaintext"));
        assert!(!verify_unknown("hunter2"));
    }

    #[tokio::test]
    async fn test_blocking_pool_helpers() {
        let hash = hash_secret_blocking("hunter2".to_string()).await.unwrap();
        assert!(check_secret("hunter2".to_string(), Some(hash.clone())).await.unwrap());
        assert!(!check_secret("hunter3".to_string(), Some(hash)).await.unwrap());
        assert!(!check_secret("hunter2".to_string(), None).await.unwrap());
    }

    #[test]
    fn test_permissions() {
        assert!(Group::User.allows(Permission::ViewData));
        assert!(Group::User.allows(Permission::EditSettings));
        assert!(!Group::User.allows(Permission::ManageUsers));
        assert!(!Group::User.allows(Permission::DeleteData));
        assert!(Group::Admin.allows(Permission::ManageUsers));
        assert!(Group::Admin.allows(Permission::ManageFirmware));
    }

    #[test]
    fn test_parse_basic() {
        let header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("well-1:s3cr:et")
        );
        let (id, secret) = parse_basic(&header).unwrap();
        assert_eq!(id, "well-1");
        assert_eq!(secret, "s3cr:et");

        assert!(parse_basic("Bearer abc").is_err());
        assert!(parse_basic("Basic !!!").is_err());
        let no_colon = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("well-1")
        );
        assert!(parse_basic(&no_colon).is_err());
    }

    #[test]
    fn test_generated_tokens_differ() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}
