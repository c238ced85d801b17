//! JWT issuance and validation.
//!
//! Tokens carry the user id, roles and a unique id (`jti`) that downstream
//! logging can correlate against. Role → permission expansion happens here
//! so route handlers only ever ask "does this caller hold permission X",
//! never "what role is this".

use std::collections::HashSet;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::User;

/// Claim set embedded in every token this service issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id.
    pub sub: String,
    pub username: String,
    pub roles: Vec<String>,
    /// Expiry, issued-at: seconds since epoch.
    pub exp: i64,
    pub iat: i64,
    /// Unique token id, usable for audit trails.
    pub jti: String,
    pub iss: String,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Expand this token's roles into the fixed permission set and check
    /// membership. `admin` holds everything; `operator` holds everything but
    /// create/delete; `viewer` holds read only.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.roles.iter().any(|role| role_permissions(role).contains(permission))
    }
}

/// The fixed role → permission table. Unknown roles grant nothing.
fn role_permissions(role: &str) -> HashSet<&'static str> {
    match role {
        "admin" => ["create", "read", "update", "delete", "start", "stop", "export"]
            .into_iter()
            .collect(),
        "operator" => ["read", "update", "start", "stop", "export"].into_iter().collect(),
        "viewer" => ["read"].into_iter().collect(),
        _ => HashSet::new(),
    }
}

fn parse_algorithm(name: &str) -> Result<Algorithm> {
    match name {
        "HS256" => Ok(Algorithm::HS256),
        "RS256" => Ok(Algorithm::RS256),
        "ES256" => Ok(Algorithm::ES256),
        other => Err(Error::InvalidParameter(format!("unsupported jwt algorithm '{other}'"))),
    }
}

/// Issues tokens on successful login.
#[derive(Clone)]
pub struct JwtIssuer {
    encoding_key: EncodingKey,
    algorithm: Algorithm,
    issuer: String,
    ttl_secs: i64,
}

impl JwtIssuer {
    pub fn new(secret: &str, algorithm: &str, issuer: &str, ttl_secs: i64) -> Result<Self> {
        let algorithm = parse_algorithm(algorithm)?;
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            algorithm,
            issuer: issuer.to_string(),
            ttl_secs,
        })
    }

    /// Mint a fresh token for `user`, returning the encoded JWT and the
    /// claims it carries (the caller typically wants `exp` for the
    /// response body).
    pub fn issue(&self, user: &User) -> Result<(String, Claims)> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user.id.clone(),
            username: user.username.clone(),
            roles: user.roles.clone(),
            exp: now + self.ttl_secs,
            iat: now,
            jti: uuid::Uuid::new_v4().to_string(),
            iss: self.issuer.clone(),
        };
        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key)?;
        Ok((token, claims))
    }
}

/// Validates tokens on every authenticated request.
#[derive(Clone)]
pub struct JwtAuth {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(secret: &str, algorithm: &str, issuer: &str) -> Result<Self> {
        let algorithm = parse_algorithm(algorithm)?;
        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[issuer]);
        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }

    /// Parse the `Authorization: Bearer <token>` header value.
    pub fn extract_token(header: &str) -> Result<&str> {
        header
            .strip_prefix("Bearer ")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Unauthorized("missing or malformed Authorization header".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User {
            id: "u-1".into(),
            username: "alice".into(),
            email: "alice@example.com".into(),
            roles: vec!["operator".into()],
            active: true,
            password_hash: String::new(),
        }
    }

    #[test]
    fn issued_token_round_trips() {
        let issuer = JwtIssuer::new("secret", "HS256", "vmux", 3600).unwrap();
        let auth = JwtAuth::new("secret", "HS256", "vmux").unwrap();
        let (token, claims) = issuer.issue(&user()).unwrap();
        let decoded = auth.validate_token(&token).unwrap();
        assert_eq!(decoded.sub, claims.sub);
        assert_eq!(decoded.roles, vec!["operator"]);
    }

    #[test]
    fn operator_cannot_create_but_can_start() {
        let claims = Claims {
            sub: "u-1".into(),
            username: "alice".into(),
            roles: vec!["operator".into()],
            exp: 0,
            iat: 0,
            jti: "x".into(),
            iss: "vmux".into(),
        };
        assert!(!claims.has_permission("create"));
        assert!(claims.has_permission("start"));
        assert!(claims.has_permission("read"));
    }

    #[test]
    fn viewer_is_read_only() {
        let claims = Claims {
            sub: "u-1".into(),
            username: "bob".into(),
            roles: vec!["viewer".into()],
            exp: 0,
            iat: 0,
            jti: "x".into(),
            iss: "vmux".into(),
        };
        assert!(claims.has_permission("read"));
        assert!(!claims.has_permission("update"));
        assert!(!claims.has_permission("start"));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let issuer = JwtIssuer::new("secret-a", "HS256", "vmux", 3600).unwrap();
        let auth = JwtAuth::new("secret-b", "HS256", "vmux").unwrap();
        let (token, _) = issuer.issue(&user()).unwrap();
        assert!(auth.validate_token(&token).is_err());
    }

    #[test]
    fn extract_token_requires_bearer_prefix() {
        assert!(JwtAuth::extract_token("Bearer abc.def.ghi").is_ok());
        assert!(JwtAuth::extract_token("abc.def.ghi").is_err());
        assert!(JwtAuth::extract_token("Bearer ").is_err());
    }
}
