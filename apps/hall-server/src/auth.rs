//! Caller identity.
//!
//! Tokens are issued by the venue's identity provider; the hall server only
//! validates them and reads the role claim. [`Caller`] is the axum extractor
//! every protected handler takes.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::header::AUTHORIZATION;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use cue_core::access::permissions;
use cue_core::{CoreError, Role};

use crate::error::ApiError;
use crate::AppState;

/// Header naming the terminal a request came from, for log correlation.
pub const TERMINAL_HEADER: &str = "x-terminal-id";

/// JWT claims structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (staff member id)
    pub sub: String,

    /// Role granted by the identity provider
    pub role: Role,

    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,

    /// JWT ID
    pub jti: String,
}

/// JWT validator.
#[derive(Clone)]
pub struct JwtManager {
    secret: String,
    issuer: Option<String>,
}

impl JwtManager {
    pub fn new(secret: impl Into<String>, issuer: Option<String>) -> Self {
        JwtManager {
            secret: secret.into(),
            issuer,
        }
    }

    /// Signs a token. The identity provider does this in production; the
    /// server uses it for tests and local tooling.
    pub fn issue(&self, subject: &str, role: Role, lifetime_secs: i64) -> Result<String, ApiError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            role,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(lifetime_secs)).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ApiError::Internal(format!("Failed to sign token: {e}")))
    }

    /// Validate and decode a token.
    pub fn validate_token(&self, token: &str) -> Result<Claims, ApiError> {
        let mut validation = Validation::default();
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        decode::<Claims>(token, &DecodingKey::from_secret(self.secret.as_bytes()), &validation)
            .map(|data| data.claims)
            .map_err(|e| ApiError::Unauthenticated(format!("Invalid token: {e}")))
    }
}

/// Extract bearer token from authorization header.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// =============================================================================
// Caller Extractor
// =============================================================================

/// The authenticated staff member behind a request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub subject: String,
    pub role: Role,
    pub terminal_id: Option<String>,
}

impl Caller {
    /// Rejects the request unless the role grants `permission`.
    pub fn require(&self, permission: &str) -> Result<(), ApiError> {
        if self.role.has_permission(permission) {
            Ok(())
        } else {
            debug!(subject = %self.subject, role = %self.role, permission, "Permission denied");
            Err(CoreError::unauthorized(permission).into())
        }
    }

    pub fn require_manager(&self) -> Result<(), ApiError> {
        self.require(permissions::TABLES_MANAGE)
    }
}

impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        if let Some(caller) = parts.extensions.get::<Caller>() {
            return Ok(caller.clone());
        }

        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(extract_bearer_token)
            .ok_or_else(|| {
                warn!(uri = %parts.uri, "Missing bearer token");
                ApiError::Unauthenticated("Missing bearer token".into())
            })?;

        let claims = state.jwt.validate_token(token).map_err(|e| {
            warn!(uri = %parts.uri, error = %e, "Token rejected");
            e
        })?;

        let terminal_id = parts
            .headers
            .get(TERMINAL_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);

        let caller = Caller {
            subject: claims.sub,
            role: claims.role,
            terminal_id,
        };
        parts.extensions.insert(caller.clone());
        Ok(caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwt_roundtrip() {
        let manager = JwtManager::new("test-secret", None);
        let token = manager.issue("staff-7", Role::Staff, 3600).unwrap();

        let claims = manager.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "staff-7");
        assert_eq!(claims.role, Role::Staff);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = JwtManager::new("one-secret", None);
        let verifier = JwtManager::new("other-secret", None);
        let token = issuer.issue("staff-7", Role::Manager, 3600).unwrap();

        assert!(matches!(
            verifier.validate_token(&token),
            Err(ApiError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_issuer_checked_when_configured() {
        let foreign = JwtManager::new("secret", Some("elsewhere".into()));
        let ours = JwtManager::new("secret", Some("cue-identity".into()));
        let token = foreign.issue("staff-7", Role::Admin, 3600).unwrap();

        assert!(ours.validate_token(&token).is_err());
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Bearer "), None);
        assert_eq!(extract_bearer_token("Basic abc"), None);
    }

    #[test]
    fn test_caller_permissions() {
        let staff = Caller {
            subject: "s1".into(),
            role: Role::Staff,
            terminal_id: Some("bar-1".into()),
        };
        assert!(staff.require(permissions::SESSIONS_OPERATE).is_ok());
        assert!(staff.require_manager().is_err());
    }
}
