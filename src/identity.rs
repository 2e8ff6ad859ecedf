//! Actor identity management
//!
//! Key-pair generation, actor provisioning, and the server's own
//! (system) identity used to sign server-originated requests.

use chrono::Utc;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::config::AppConfig;
use crate::data::{Actor, ActorKind, Database};
use crate::error::AppError;

/// The system actor's signing identity.
///
/// Loaded once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    pub username: String,
    pub actor_id: String,
    pub key_id: String,
    pub private_key_pem: String,
}

/// Generate a fresh RSA-2048 key pair.
///
/// # Returns
/// `(private_key_pem, public_key_pem)` in PKCS#8 / SPKI PEM form.
pub fn generate_rsa_keypair() -> Result<(String, String), AppError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("RSA key generation failed: {e}")))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("private key encoding failed: {e}")))?
        .to_string();
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("public key encoding failed: {e}")))?;

    Ok((private_pem, public_pem))
}

/// Check whether a username is acceptable for a local actor.
///
/// Usernames must be URL-safe: ASCII alphanumerics, `_`, `-`, `.`,
/// 1 to 64 characters.
pub fn validate_username(username: &str) -> Result<(), AppError> {
    if username.is_empty() || username.len() > 64 {
        return Err(AppError::Unprocessable(
            "username must be 1-64 characters".to_string(),
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(AppError::Unprocessable(format!(
            "username contains invalid characters: {username}"
        )));
    }
    Ok(())
}

/// Build a new local actor with endpoints rooted at the configured
/// base URL and a fresh RSA-2048 key pair.
pub fn build_local_actor(
    config: &AppConfig,
    username: &str,
    kind: ActorKind,
    display_name: Option<String>,
    summary: Option<String>,
    extensions: serde_json::Map<String, serde_json::Value>,
) -> Result<Actor, AppError> {
    validate_username(username)?;

    let base = config.server.prefixed_base_url();
    let actor_id = format!("{base}/users/{username}");
    let (private_pem, public_pem) = generate_rsa_keypair()?;
    let now = Utc::now();

    Ok(Actor {
        id: actor_id.clone(),
        username: username.to_string(),
        kind,
        display_name,
        summary,
        inbox: format!("{actor_id}/inbox"),
        outbox: format!("{actor_id}/outbox"),
        followers_url: format!("{actor_id}/followers"),
        following_url: format!("{actor_id}/following"),
        shared_inbox: None,
        public_key_pem: public_pem,
        private_key_pem: Some(private_pem),
        extensions,
        created_at: now,
        updated_at: now,
    })
}

/// Ensure the system actor exists, creating it on first startup.
///
/// # Returns
/// The system signing identity, held for the process lifetime.
pub async fn ensure_system_actor(
    db: &Database,
    config: &AppConfig,
) -> Result<SystemIdentity, AppError> {
    let username = config.federation.system_actor_username.clone();

    let actor = match db.get_actor_by_username(&username).await? {
        Some(actor) => actor,
        None => {
            tracing::info!(username = %username, "Provisioning system actor");
            let actor = build_local_actor(
                config,
                &username,
                ActorKind::Application,
                Some(config.server.server_name.clone()),
                Some("Server actor".to_string()),
                serde_json::Map::new(),
            )?;
            db.insert_actor(&actor).await?;
            actor
        }
    };

    let private_key_pem = actor.private_key_pem.clone().ok_or_else(|| {
        AppError::Config(format!("system actor {username} has no private key"))
    })?;

    Ok(SystemIdentity {
        username: actor.username.clone(),
        actor_id: actor.id.clone(),
        key_id: actor.key_id(),
        private_key_pem,
    })
}

/// Extract a bearer token from the Authorization header
pub fn bearer_token(headers: &http::HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Constant-time admin token comparison.
///
/// Both sides are hashed first so neither length nor prefix leaks
/// through timing.
pub fn admin_token_matches(expected: Option<&str>, presented: Option<&str>) -> bool {
    let (Some(expected), Some(presented)) = (expected, presented) else {
        return false;
    };

    let expected_digest = Sha256::digest(expected.as_bytes());
    let presented_digest = Sha256::digest(presented.as_bytes());

    let mut diff = 0u8;
    for (a, b) in expected_digest.iter().zip(presented_digest.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_token_matches_requires_exact_token() {
        assert!(admin_token_matches(Some("secret"), Some("secret")));
        assert!(!admin_token_matches(Some("secret"), Some("Secret")));
        assert!(!admin_token_matches(Some("secret"), Some("secret2")));
    }

    #[test]
    fn admin_token_matches_rejects_missing_sides() {
        assert!(!admin_token_matches(None, Some("secret")));
        assert!(!admin_token_matches(Some("secret"), None));
        assert!(!admin_token_matches(None, None));
    }

    #[test]
    fn validate_username_accepts_url_safe_names() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("bot-7_x.y").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username("ünïcode").is_err());
    }

    #[test]
    fn bearer_token_strips_scheme() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            http::HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(
            http::header::AUTHORIZATION,
            http::HeaderValue::from_static("Basic abc123"),
        );
        assert_eq!(bearer_token(&headers), None);
    }
}
