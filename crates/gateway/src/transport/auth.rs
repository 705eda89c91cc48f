// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::error::ErrorCode;

/// Validates the opaque token presented in `hello` and resolves the user
/// identity behind it. Token issuance lives outside the core; deployments
/// inject their own implementation.
#[async_trait::async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<String, ErrorCode>;
}

/// Compare a presented token against the expected one without
/// short-circuiting on the first mismatched byte, so comparison time
/// reveals nothing about where the two diverge.
fn constant_time_eq(presented: &str, expected: &str) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |diff, (p, e)| diff | (p ^ e))
        == 0
}

/// Shared-token validator: every holder of the token maps to one user id.
/// With no expected token configured, auth is disabled and any token is
/// accepted.
pub struct StaticTokenValidator {
    expected: Option<String>,
    user_id: String,
}

impl StaticTokenValidator {
    pub fn new(expected: Option<String>, user_id: impl Into<String>) -> Self {
        Self { expected, user_id: user_id.into() }
    }
}

#[async_trait::async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<String, ErrorCode> {
        match self.expected {
            None => Ok(self.user_id.clone()),
            Some(ref expected) if constant_time_eq(token, expected) => Ok(self.user_id.clone()),
            Some(_) => Err(ErrorCode::AuthFailed),
        }
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
