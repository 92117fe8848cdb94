//! Actix-web extractor resolving a request to an authenticated principal.
//!
//! # Authentication methods (checked in order)
//! 1. `X-API-Key` header - API token resolved against the users table
//! 2. `Authorization: Bearer <token>` - Ed25519-signed JWT
//!
//! # Security
//! - Secret header values are wrapped in `SecretString` immediately
//! - Only the sha256 of an API token ever touches the database
//! - The core only ever sees the resulting `AuthenticatedUser`

use actix_web::dev::Payload;
use actix_web::http::StatusCode;
use actix_web::{FromRequest, HttpRequest, HttpResponse, ResponseError, web};
use secrecy::{ExposeSecret, SecretString};
use std::future::Future;
use std::pin::Pin;

use crate::config::{API_KEY_HEADER, Config};
use crate::db::DbPool;
use crate::db::users::{parse_projects, parse_roles};
use crate::error::ErrorResponse;
use crate::models::AuthenticatedUser;

use super::{hash_token, verify_jwt};

/// Extract a secret header value, wrapping it in SecretString.
fn extract_secret_header(req: &HttpRequest, header_name: &str) -> Option<SecretString> {
    req.headers()
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .map(|s| SecretString::from(s.to_string()))
}

/// Extract Bearer token from Authorization header, wrapped in SecretString.
fn extract_bearer_token(req: &HttpRequest) -> Option<SecretString> {
    req.headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| SecretString::from(s.to_string()))
}

/// Authentication error for extractors.
#[derive(Debug)]
pub struct AuthError {
    message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ResponseError for AuthError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(StatusCode::UNAUTHORIZED).json(ErrorResponse {
            error: "UNAUTHORIZED".to_string(),
            message: self.message.clone(),
        })
    }
}

/// Extractor that requires a valid API token or bearer JWT.
///
/// Use this in handlers that require authentication:
/// ```ignore
/// async fn protected_handler(auth: ApiAuth) -> impl Responder {
///     auth.user.require_role(Role::Api)?;
/// }
/// ```
pub struct ApiAuth {
    pub user: AuthenticatedUser,
}

impl FromRequest for ApiAuth {
    type Error = AuthError;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let pool = match req.app_data::<web::Data<DbPool>>() {
            Some(pool) => pool.clone(),
            None => {
                return Box::pin(async {
                    Err(AuthError {
                        message: "Internal configuration error".to_string(),
                    })
                });
            }
        };

        let config = req.app_data::<web::Data<Config>>().cloned();

        // Extract secrets from headers - immediately wrapped in SecretString
        let api_token: Option<SecretString> = extract_secret_header(req, API_KEY_HEADER);
        let bearer_token: Option<SecretString> = extract_bearer_token(req);

        Box::pin(async move {
            // 1. API token resolved against the users table by its hash
            if let Some(ref token) = api_token {
                let hash = hash_token(token.expose_secret());
                let row = pool.find_user_by_token_hash(&hash).await.map_err(|e| {
                    AuthError {
                        message: e.to_string(),
                    }
                })?;

                return match row {
                    Some(row) => Ok(ApiAuth {
                        user: AuthenticatedUser {
                            username: row.username,
                            roles: parse_roles(&row.roles).into_iter().collect(),
                            projects: parse_projects(&row.projects),
                        },
                    }),
                    None => Err(AuthError {
                        message: "Invalid API token".to_string(),
                    }),
                };
            }

            // 2. Bearer JWT verified with the configured public key
            if let Some(ref token) = bearer_token {
                let public_key = config
                    .as_ref()
                    .and_then(|c| c.jwt_public_key.clone())
                    .ok_or_else(|| AuthError {
                        message: "Bearer token provided but JWT_PUBLIC_KEY is not configured"
                            .to_string(),
                    })?;

                let claims =
                    verify_jwt(&public_key, token.expose_secret()).map_err(|e| AuthError {
                        message: e.to_string(),
                    })?;

                // Projects come from the catalog row when the subject exists.
                let projects = match pool.get_user(&claims.sub).await {
                    Ok(Some(row)) => parse_projects(&row.projects),
                    _ => Vec::new(),
                };

                return Ok(ApiAuth {
                    user: AuthenticatedUser {
                        username: claims.sub.clone(),
                        roles: claims.roles().into_iter().collect(),
                        projects,
                    },
                });
            }

            Err(AuthError {
                message: "Missing credentials. Provide X-API-Key or Authorization: Bearer header."
                    .to_string(),
            })
        })
    }
}
