//! Bearer-token authentication for HTTP transports.
//!
//! RS256 JWTs signed with a local RSA keypair. Authentication is enabled
//! exactly when a private key is available (file or `MAGG_PRIVATE_KEY`);
//! without one, every request is considered authenticated. The core only
//! ever consumes the resulting yes/no — scopes are informational.

use std::path::{Path, PathBuf};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use magg_core::MaggError;

/// Key file names inside the key directory.
const PRIVATE_KEY_FILE: &str = "magg.key";
const PUBLIC_KEY_FILE: &str = "magg.key.pub";

/// Default token lifetime in hours.
pub const DEFAULT_TOKEN_HOURS: i64 = 24;

/// Claims carried by magg bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    /// Space-separated scopes, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Manages the RSA keypair and token issue/validation.
pub struct BearerAuth {
    issuer: String,
    audience: String,
    key_dir: PathBuf,
    /// PEM private key material, when loaded.
    private_pem: Option<String>,
}

impl BearerAuth {
    /// Build the manager. `private_key_override` (from `MAGG_PRIVATE_KEY`)
    /// wins over the key file; absence of both disables auth.
    #[must_use]
    pub fn new(key_dir: PathBuf, private_key_override: Option<String>) -> Self {
        let private_pem = private_key_override
            .filter(|pem| !pem.is_empty())
            .or_else(|| std::fs::read_to_string(key_dir.join(PRIVATE_KEY_FILE)).ok());

        Self {
            issuer: "magg".to_string(),
            audience: "magg-client".to_string(),
            key_dir,
            private_pem,
        }
    }

    /// Authentication is enabled iff a private key is present.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.private_pem.is_some()
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Generate a fresh RSA keypair on disk. Refuses to overwrite.
    ///
    /// The key directory is owner-only; the private key file is owner
    /// read/write only.
    pub fn init_keys(&mut self) -> Result<(), MaggError> {
        use rsa::pkcs1::EncodeRsaPrivateKey;
        use rsa::pkcs8::EncodePublicKey;

        let private_path = self.key_dir.join(PRIVATE_KEY_FILE);
        if private_path.exists() {
            return Err(MaggError::Validation(format!(
                "private key already exists at {}; remove it to regenerate",
                private_path.display()
            )));
        }

        std::fs::create_dir_all(&self.key_dir)
            .map_err(|e| MaggError::Auth(format!("cannot create key dir: {e}")))?;
        set_mode(&self.key_dir, 0o700)?;

        let mut rng = rand::thread_rng();
        let private_key = rsa::RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| MaggError::Auth(format!("keypair generation failed: {e}")))?;

        let private_pem = private_key
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| MaggError::Auth(format!("private key encoding failed: {e}")))?
            .to_string();
        let public_pem = private_key
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| MaggError::Auth(format!("public key encoding failed: {e}")))?;

        std::fs::write(&private_path, &private_pem)
            .map_err(|e| MaggError::Auth(format!("cannot write private key: {e}")))?;
        set_mode(&private_path, 0o600)?;

        std::fs::write(self.key_dir.join(PUBLIC_KEY_FILE), public_pem)
            .map_err(|e| MaggError::Auth(format!("cannot write public key: {e}")))?;

        self.private_pem = Some(private_pem);
        tracing::info!(dir = %self.key_dir.display(), "generated RSA keypair");
        Ok(())
    }

    /// Issue a token for `subject`, valid for `hours`.
    pub fn create_token(
        &self,
        subject: &str,
        hours: i64,
        scopes: Option<&[String]>,
    ) -> Result<String, MaggError> {
        let pem = self.require_key()?;
        let key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| MaggError::Auth(format!("invalid private key: {e}")))?;

        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: subject.to_string(),
            iat: now,
            exp: now + hours * 3600,
            scope: scopes.map(|s| s.join(" ")),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| MaggError::Auth(format!("token signing failed: {e}")))
    }

    /// Validate a token: signature, expiry, issuer, audience.
    pub fn validate(&self, token: &str) -> Result<Claims, MaggError> {
        let pem = self.require_key()?;
        let private_key = rsa::RsaPrivateKey::from_pkcs1_or_pkcs8(pem)
            .map_err(|e| MaggError::Auth(format!("invalid private key: {e}")))?;

        use rsa::pkcs8::EncodePublicKey;
        let public_pem = private_key
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| MaggError::Auth(format!("public key derivation failed: {e}")))?;

        let key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| MaggError::Auth(format!("invalid public key: {e}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        jsonwebtoken::decode::<Claims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| MaggError::Auth(e.to_string()))
    }

    /// PEM public key, for `auth public-key`.
    pub fn public_key_pem(&self) -> Result<String, MaggError> {
        use rsa::pkcs8::EncodePublicKey;
        let pem = self.require_key()?;
        let private_key = rsa::RsaPrivateKey::from_pkcs1_or_pkcs8(pem)
            .map_err(|e| MaggError::Auth(format!("invalid private key: {e}")))?;
        private_key
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| MaggError::Auth(format!("public key derivation failed: {e}")))
    }

    /// PEM private key, for `auth private-key`.
    pub fn private_key_pem(&self) -> Result<&str, MaggError> {
        self.require_key()
    }

    fn require_key(&self) -> Result<&str, MaggError> {
        self.private_pem
            .as_deref()
            .ok_or_else(|| MaggError::Auth("authentication is not enabled".into()))
    }
}

/// Parse a private key that may be PKCS#1 or PKCS#8 PEM.
trait FromEitherPem: Sized {
    fn from_pkcs1_or_pkcs8(pem: &str) -> Result<Self, String>;
}

impl FromEitherPem for rsa::RsaPrivateKey {
    fn from_pkcs1_or_pkcs8(pem: &str) -> Result<Self, String> {
        use rsa::pkcs1::DecodeRsaPrivateKey;
        use rsa::pkcs8::DecodePrivateKey;
        Self::from_pkcs1_pem(pem)
            .or_else(|_| Self::from_pkcs8_pem(pem))
            .map_err(|e| e.to_string())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), MaggError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| MaggError::Auth(format!("cannot set permissions on {}: {e}", path.display())))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), MaggError> {
    Ok(())
}

/// Extract the bearer token from an `Authorization` header value.
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").map(str::trim).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_with_keys() -> (tempfile::TempDir, BearerAuth) {
        let dir = tempfile::tempdir().unwrap();
        let mut auth = BearerAuth::new(dir.path().join("keys"), None);
        assert!(!auth.enabled());
        auth.init_keys().unwrap();
        assert!(auth.enabled());
        (dir, auth)
    }

    #[test]
    fn token_roundtrip() {
        let (_dir, auth) = auth_with_keys();
        let token = auth
            .create_token("alice", 1, Some(&["read".into(), "call".into()]))
            .unwrap();

        let claims = auth.validate(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.iss, "magg");
        assert_eq!(claims.scope.as_deref(), Some("read call"));
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn expired_token_is_rejected() {
        let (_dir, auth) = auth_with_keys();
        let token = auth.create_token("alice", -1, None).unwrap();
        assert!(matches!(auth.validate(&token), Err(MaggError::Auth(_))));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let (_dir, auth) = auth_with_keys();
        assert!(matches!(
            auth.validate("not.a.token"),
            Err(MaggError::Auth(_))
        ));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let (_dir, mut auth) = auth_with_keys();
        assert!(matches!(
            auth.init_keys(),
            Err(MaggError::Validation(_))
        ));
    }

    #[test]
    fn disabled_without_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let auth = BearerAuth::new(dir.path().join("keys"), None);
        assert!(!auth.enabled());
        assert!(matches!(
            auth.create_token("x", 1, None),
            Err(MaggError::Auth(_))
        ));
    }

    #[test]
    fn env_override_wins_over_file() {
        let (_dir, auth) = auth_with_keys();
        let pem = auth.private_key_pem().unwrap().to_string();

        let other_dir = tempfile::tempdir().unwrap();
        let from_env = BearerAuth::new(other_dir.path().join("keys"), Some(pem));
        assert!(from_env.enabled());
        let token = from_env.create_token("bob", 1, None).unwrap();
        assert_eq!(from_env.validate(&token).unwrap().sub, "bob");
    }

    #[cfg(unix)]
    #[test]
    fn private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, _auth) = auth_with_keys();
        let mode = std::fs::metadata(dir.path().join("keys").join(PRIVATE_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
