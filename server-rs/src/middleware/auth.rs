use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::JwtConfig;
use crate::error::{AppError, AppResult};
use crate::models::{Principal, UserId};
use crate::services::CredentialVerifier;
use crate::AppState;

/// Identity token claims. Tokens name the user only; tenant and role are
/// looked up per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// HS256 verifier for identity tokens issued by the identity provider.
#[derive(Clone)]
pub struct JwtVerifier {
    secret: String,
    leeway_secs: u64,
    issuer: Option<String>,
}

impl JwtVerifier {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            secret: config.secret.clone(),
            leeway_secs: config.leeway_secs,
            issuer: config.issuer.clone(),
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway_secs;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, credential: &str) -> AppResult<Principal> {
        let data = decode::<Claims>(
            credential,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &self.validation(),
        )?;
        let user_id = data
            .claims
            .sub
            .parse::<UserId>()
            .map_err(|_| AppError::Unauthenticated("Invalid token subject".into()))?;
        Ok(Principal { user_id })
    }
}

/// Signs an identity token for `user_id`. Used by local tooling and tests.
pub fn issue_token(
    config: &JwtConfig,
    user_id: UserId,
    now: DateTime<Utc>,
    ttl_secs: i64,
) -> AppResult<String> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: now.timestamp() + ttl_secs,
        iat: now.timestamp(),
        iss: config.issuer.clone(),
    };
    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )?)
}

pub fn extract_bearer(req: &Request) -> Option<String> {
    req.headers()
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

/// Middleware: requires a valid identity token. Sets `Principal` in extensions.
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer(&req);
    let principal = state.engine.resolver.authenticate(token.as_deref())?;
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}
