use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::unread::UserId;

const DEV_JWT_SECRET: &str = "dev_secret_change_in_production_use_openssl_rand_base64_32";

/// Claims issued by the identity provider. Extra claims are ignored.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Subject: user id
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl Claims {
    pub fn user_id(&self) -> UserId {
        UserId::new(self.sub.clone())
    }
}

/// Verifies session tokens from the identity provider (HS256 shared secret).
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, audience: Option<&str>) -> Self {
        let mut validation = Validation::default();
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }

    /// Validate a token and return the claims.
    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.key, &self.validation).map(|data| data.claims)
    }
}

/// The configured secret, or the development default with a warning.
pub fn resolve_jwt_secret(configured: Option<&str>) -> String {
    match configured {
        Some(secret) => secret.to_string(),
        None => {
            warn!("JWT_SECRET not set, using development default");
            DEV_JWT_SECRET.to_string()
        }
    }
}

/// Issue a token with 24-hour expiry. Used for local runs and tests.
pub fn generate_token(
    user_id: &UserId,
    secret: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let claims = Claims {
        sub: user_id.to_string(),
        exp: now + 24 * 60 * 60,
        iat: now,
        email: None,
        aud: None,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )
}
