// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[tokio::test]
async fn disabled_auth_accepts_anything() -> anyhow::Result<()> {
    let validator = StaticTokenValidator::new(None, "u1");
    assert_eq!(validator.validate("whatever").await?, "u1");
    assert_eq!(validator.validate("").await?, "u1");
    Ok(())
}

#[tokio::test]
async fn matching_token_resolves_user() -> anyhow::Result<()> {
    let validator = StaticTokenValidator::new(Some("sekrit".into()), "u1");
    assert_eq!(validator.validate("sekrit").await?, "u1");
    Ok(())
}

#[tokio::test]
async fn bad_tokens_fail() {
    let validator = StaticTokenValidator::new(Some("sekrit".into()), "u1");
    for token in ["wrong", "", "sekri", "sekrit0", "Sekrit"] {
        assert_eq!(
            validator.validate(token).await,
            Err(crate::error::ErrorCode::AuthFailed),
            "token {token:?} must fail"
        );
    }
}
