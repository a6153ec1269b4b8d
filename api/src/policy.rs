/// Policy seam
/// Authentication and policy decisions are external; the handlers only see
/// an opaque token with `check(permission)`. This implementation trusts the
/// identity headers set by the auth proxy in front of the service.

use std::collections::HashSet;

use axum::{extract::FromRequestParts, http::request::Parts};
use shared::commitment::Principal;
use uuid::Uuid;

use crate::error::ApiError;

pub const PERMISSION_COMMIT: &str = "commit";
pub const PERMISSION_UNCOMMIT: &str = "uncommit";
pub const PERMISSION_ADMIN: &str = "admin";

#[derive(Debug, Clone)]
pub struct Token {
    pub user_uuid: Uuid,
    pub user_name: String,
    roles: HashSet<String>,
}

impl Token {
    pub fn new(user_uuid: Uuid, user_name: impl Into<String>, roles: &[&str]) -> Self {
        Token {
            user_uuid,
            user_name: user_name.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    pub fn check(&self, permission: &str) -> bool {
        self.roles.contains(permission) || self.roles.contains(PERMISSION_ADMIN)
    }

    pub fn require(&self, permission: &str) -> Result<(), ApiError> {
        if self.check(permission) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "missing permission: {}",
                permission
            )))
        }
    }

    pub fn principal(&self) -> Principal {
        Principal {
            uuid: self.user_uuid,
            name: self.user_name.clone(),
        }
    }
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Token {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        let user_uuid = header("x-auth-user-id")
            .and_then(|raw| Uuid::parse_str(&raw).ok())
            .ok_or_else(|| ApiError::forbidden("missing or malformed x-auth-user-id header"))?;
        let user_name = header("x-auth-user-name")
            .ok_or_else(|| ApiError::forbidden("missing x-auth-user-name header"))?;
        let roles: HashSet<String> = header("x-auth-roles")
            .unwrap_or_default()
            .split(',')
            .map(|role| role.trim().to_string())
            .filter(|role| !role.is_empty())
            .collect();

        Ok(Token {
            user_uuid,
            user_name,
            roles,
        })
    }
}
