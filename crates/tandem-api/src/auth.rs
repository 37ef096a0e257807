use std::collections::HashMap;

use axum::http::HeaderMap;

use crate::config::AppConfig;
use crate::error::AppError;

/// Account a request is scoped to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedAccount {
    pub account_id: String,
}

/// Resolves static bearer tokens to accounts
#[derive(Clone)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl TokenAuthenticator {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            tokens: config.api_tokens.clone(),
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedAccount, AppError> {
        let token = extract_bearer_token(headers)?;
        self.tokens
            .get(token)
            .map(|account_id| AuthenticatedAccount {
                account_id: account_id.clone(),
            })
            .ok_or_else(|| AppError::unauthorized("Bearer token is not recognized"))
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}
