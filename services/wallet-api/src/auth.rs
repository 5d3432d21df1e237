//! Bearer JWT authentication
//!
//! The identity layer issues HS256 tokens; `sub` is the wallet owner and
//! `scopes` may grant admin access. The middleware validates the token once
//! and leaves an [`AuthUser`] in the request extensions for the extractors.

use crate::errors::ApiError;
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    Error, FromRequest, HttpMessage, HttpRequest,
};
use futures_util::future::LocalBoxFuture;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::future::{ready, Ready};
use std::rc::Rc;
use wallet_core::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub exp: usize,
}

/// Authenticated caller
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub is_admin: bool,
}

/// Authenticated caller holding the admin scope
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

/// Paths served without a bearer token
fn is_public(path: &str) -> bool {
    path == "/health" || path == "/metrics" || path.starts_with("/payments/webhook/")
}

/// Sign a token (local tooling and tests)
pub fn issue_token(
    secret: &str,
    sub: &str,
    scopes: &[&str],
    ttl: chrono::Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: sub.to_string(),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        exp: (chrono::Utc::now() + ttl).timestamp().max(0) as usize,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

fn authenticate(req: &ServiceRequest, secret: &str, admin_scope: &str) -> Result<AuthUser, ApiError> {
    let header = req
        .headers()
        .get("Authorization")
        .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".into()))?
        .to_str()
        .map_err(|_| ApiError::Unauthorized("invalid Authorization header".into()))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("invalid auth header format".into()))?;

    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|err| {
        tracing::warn!("JWT validation failed: {:?}", err);
        ApiError::Unauthorized("invalid or expired token".into())
    })?
    .claims;

    if claims.sub.is_empty() {
        return Err(ApiError::Unauthorized("token has no subject".into()));
    }

    Ok(AuthUser {
        is_admin: claims.scopes.iter().any(|s| s == admin_scope),
        user_id: UserId::new(claims.sub),
    })
}

pub struct JwtAuth {
    secret: Rc<str>,
    admin_scope: Rc<str>,
}

impl JwtAuth {
    pub fn new(secret: &str, admin_scope: &str) -> Self {
        Self {
            secret: secret.into(),
            admin_scope: admin_scope.into(),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for JwtAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = JwtAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(JwtAuthMiddleware {
            service: Rc::new(service),
            secret: self.secret.clone(),
            admin_scope: self.admin_scope.clone(),
        }))
    }
}

pub struct JwtAuthMiddleware<S> {
    service: Rc<S>,
    secret: Rc<str>,
    admin_scope: Rc<str>,
}

impl<S, B> Service<ServiceRequest> for JwtAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if !is_public(req.path()) {
            match authenticate(&req, &self.secret, &self.admin_scope) {
                Ok(user) => {
                    req.extensions_mut().insert(user);
                }
                Err(err) => {
                    let response = req.error_response(err).map_into_right_body();
                    return Box::pin(async move { Ok(response) });
                }
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move { Ok(fut.await?.map_into_left_body()) })
    }
}

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<AuthUser>()
                .cloned()
                .ok_or_else(|| ApiError::Unauthorized("not authenticated".into())),
        )
    }
}

impl FromRequest for AdminUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(match req.extensions().get::<AuthUser>() {
            Some(user) if user.is_admin => Ok(AdminUser(user.clone())),
            Some(_) => Err(ApiError::Forbidden),
            None => Err(ApiError::Unauthorized("not authenticated".into())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_public_paths() {
        assert!(is_public("/health"));
        assert!(is_public("/payments/webhook/razorpay"));
        assert!(!is_public("/wallet/me"));
    }

    #[test]
    fn test_token_round_trip_and_admin_scope() {
        let token = issue_token(SECRET, "u1", &["wallet:admin"], chrono::Duration::minutes(5)).unwrap();
        let req = TestRequest::default()
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_srv_request();
        let user = authenticate(&req, SECRET, "wallet:admin").unwrap();
        assert_eq!(user.user_id.as_str(), "u1");
        assert!(user.is_admin);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_token("another-secret-another-secret-xx", "u1", &[], chrono::Duration::minutes(5))
            .unwrap();
        let req = TestRequest::default()
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_srv_request();
        assert!(matches!(
            authenticate(&req, SECRET, "wallet:admin"),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_missing_header_rejected() {
        let req = TestRequest::default().to_srv_request();
        assert!(authenticate(&req, SECRET, "wallet:admin").is_err());
    }
}
