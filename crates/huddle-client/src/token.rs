//! Room access tokens
//!
//! Tokens are JWTs minted by the application server. The client only reads
//! the claims; the signaling server verifies the signature.

use huddle_protocol::TokenClaims;
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Read the claims of `token` without verifying its signature
pub fn decode_claims(token: &str) -> Result<TokenClaims> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = jsonwebtoken::decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| EngineError::Token(e.to_string()))?;

    if data.claims.user.is_empty() || data.claims.room.is_empty() {
        return Err(EngineError::Token("token has no user or room".to_string()));
    }

    Ok(data.claims)
}

#[derive(Serialize)]
struct TestTokenRequest<'a> {
    secret: &'a str,
    room: &'a str,
    user: &'a str,
}

#[derive(Deserialize)]
struct TestTokenResponse {
    s: i64,
    e: Option<String>,
    d: Option<TestTokenData>,
}

#[derive(Deserialize)]
struct TestTokenData {
    token: String,
}

/// Status codes above this are errors
const TEST_TOKEN_MAX_OK_STATUS: i64 = 10_000;

/// Ask a development token endpoint for a room token
pub async fn fetch_test_token(url: &str, secret: &str, room: &str, user: &str) -> Result<String> {
    let client = reqwest::Client::new();
    let response = client
        .post(url)
        .json(&TestTokenRequest { secret, room, user })
        .send()
        .await
        .map_err(|e| EngineError::Token(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(EngineError::Token(format!(
            "token request failed with status {}: {}",
            status, text
        )));
    }

    let body: TestTokenResponse = response
        .json()
        .await
        .map_err(|e| EngineError::Token(e.to_string()))?;

    parse_test_token(body)
}

fn parse_test_token(body: TestTokenResponse) -> Result<String> {
    if body.s > TEST_TOKEN_MAX_OK_STATUS {
        return Err(EngineError::Token(
            body.e.unwrap_or_else(|| format!("token server status {}", body.s)),
        ));
    }

    body.d
        .map(|d| d.token)
        .ok_or_else(|| EngineError::Token("token server returned no token".to_string()))
}
