//! HS512 session and invite tokens.
//!
//! The signing key rotates on a TTL; the previous key stays accepted for
//! verification so tokens signed before a rotation remain valid within
//! their own `exp`.

use std::{
    sync::RwLock,
    time::{Duration, Instant},
};

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub type Result<T, E = TokenError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum TokenError {
    #[snafu(display("token is invalid or expired"))]
    Invalid,

    #[snafu(display("failed to sign token"))]
    Signing { source: jsonwebtoken::errors::Error },
}

/// Claims of a login session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims of an invite token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteClaims {
    /// The invited username, when the inviter pinned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub iss: String,
    pub roles: Vec<String>,
    pub exp: i64,
    /// Token id; revocation and redemption are keyed by it.
    pub jti: String,
}

struct KeyState {
    current: Vec<u8>,
    previous: Option<Vec<u8>>,
    rotated_at: Instant,
}

pub struct TokenSigner {
    keys: RwLock<KeyState>,
    rotation_interval: Duration,
    session_ttl: Duration,
}

fn random_key() -> Vec<u8> {
    let mut key = vec![0u8; 64];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// A random token id.
pub fn new_token_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.next_u64(), rng.next_u64())
}

impl TokenSigner {
    /// Creates a signer with a freshly generated key.
    ///
    /// The initial key is random entropy, never a human-supplied secret:
    /// tokens must not be forgeable by anyone who knows an operator
    /// credential.
    pub fn new(rotation_interval: Duration, session_ttl: Duration) -> Self {
        TokenSigner {
            keys: RwLock::new(KeyState {
                current: random_key(),
                previous: None,
                rotated_at: Instant::now(),
            }),
            rotation_interval,
            session_ttl,
        }
    }

    /// Rotates the signing key when its TTL elapsed. Called on every sign.
    fn maybe_rotate(&self) {
        let needs_rotation = self
            .keys
            .read()
            .map(|keys| keys.rotated_at.elapsed() >= self.rotation_interval)
            .unwrap_or(false);
        if !needs_rotation {
            return;
        }
        if let Ok(mut keys) = self.keys.write() {
            if keys.rotated_at.elapsed() >= self.rotation_interval {
                keys.previous = Some(std::mem::replace(&mut keys.current, random_key()));
                keys.rotated_at = Instant::now();
            }
        }
    }

    fn sign<C: Serialize>(&self, claims: &C) -> Result<String> {
        self.maybe_rotate();
        let keys = match self.keys.read() {
            Ok(keys) => keys,
            Err(poisoned) => poisoned.into_inner(),
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS512),
            claims,
            &EncodingKey::from_secret(&keys.current),
        )
        .map_err(|source| TokenError::Signing { source })
    }

    fn verify<C: serde::de::DeserializeOwned>(&self, token: &str) -> Result<C> {
        let validation = Validation::new(Algorithm::HS512);
        let keys = match self.keys.read() {
            Ok(keys) => keys,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut secrets = vec![&keys.current];
        if let Some(previous) = &keys.previous {
            secrets.push(previous);
        }
        for secret in secrets {
            if let Ok(data) =
                jsonwebtoken::decode::<C>(token, &DecodingKey::from_secret(secret), &validation)
            {
                return Ok(data.claims);
            }
        }
        Err(TokenError::Invalid)
    }

    pub fn sign_session(&self, username: &str) -> Result<(String, i64)> {
        let now = Utc::now().timestamp();
        let exp = now + self.session_ttl.as_secs() as i64;
        let token = self.sign(&SessionClaims {
            sub: username.to_string(),
            iat: now,
            exp,
        })?;
        Ok((token, exp))
    }

    pub fn verify_session(&self, token: &str) -> Result<SessionClaims> {
        self.verify(token)
    }

    pub fn sign_invite(
        &self,
        issuer: &str,
        subject: Option<String>,
        roles: Vec<String>,
        ttl: Duration,
    ) -> Result<(String, InviteClaims)> {
        let claims = InviteClaims {
            sub: subject,
            iss: issuer.to_string(),
            roles,
            exp: Utc::now().timestamp() + ttl.as_secs() as i64,
            jti: new_token_id(),
        };
        let token = self.sign(&claims)?;
        Ok((token, claims))
    }

    pub fn verify_invite(&self, token: &str) -> Result<InviteClaims> {
        self.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(Duration::from_secs(3600), Duration::from_secs(600))
    }

    #[test]
    fn session_tokens_round_trip() {
        let signer = signer();
        let (token, exp) = signer.sign_session("alice").expect("signing works");
        let claims = signer.verify_session(&token).expect("verification works");
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.exp, exp);
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let signer = signer();
        assert!(signer.verify_session("not.a.token").is_err());
    }

    #[test]
    fn tokens_survive_one_rotation() {
        let signer = TokenSigner::new(Duration::from_millis(0), Duration::from_secs(600));
        let (token, _) = signer.sign_session("alice").expect("signing works");

        // The next sign triggers a rotation; the old token must still
        // verify against the previous key.
        let (newer, _) = signer.sign_session("bob").expect("signing works");
        assert!(signer.verify_session(&token).is_ok());
        assert!(signer.verify_session(&newer).is_ok());
    }

    #[test]
    fn keys_are_instance_specific() {
        let ours = signer();
        let theirs = signer();
        let (token, _) = ours.sign_session("alice").expect("signing works");
        assert!(theirs.verify_session(&token).is_err());
    }

    #[test]
    fn invite_tokens_carry_roles_and_jti() {
        let signer = signer();
        let (token, issued) = signer
            .sign_invite(
                "admin",
                None,
                vec!["dev-role".to_string()],
                Duration::from_secs(3600),
            )
            .expect("signing works");
        let claims = signer.verify_invite(&token).expect("verification works");
        assert_eq!(claims.iss, "admin");
        assert_eq!(claims.roles, vec!["dev-role"]);
        assert_eq!(claims.jti, issued.jti);
        assert!(!claims.jti.is_empty());
    }
}
