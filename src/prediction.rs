use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::config::Config;

pub const TOKEN_ISSUER: &str = "learning-analytics-api";
const TOKEN_TTL_SECS: i64 = 30 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    exp: i64,
}

fn sign_token(secret: &str) -> Result<String> {
    let claims = Claims {
        iss: TOKEN_ISSUER.to_string(),
        exp: Utc::now().timestamp() + TOKEN_TTL_SECS,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("failed to sign prediction-host token")
}

async fn request_refresh(
    base_url: &str,
    secret: &str,
    timeout_secs: u64,
    course_id: &str,
) -> Result<()> {
    let token = sign_token(secret)?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("failed to build prediction-host client")?;

    let response = client
        .post(format!(
            "{base_url}/model/{course_id}/batch-predict?force_refresh=true"
        ))
        .bearer_auth(token)
        .send()
        .await
        .context("prediction refresh request failed")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("prediction host returned {status}: {body}");
    }
    Ok(())
}

/// Best-effort cache warm. The refresh is dispatched on its own task with its
/// own log sink; the pipeline's success signal never depends on it. Results
/// arrive later through the prediction webhook.
pub fn spawn_refresh(config: &Config, course_id: String) {
    let base_url = config.prediction_api_url.trim_end_matches('/').to_string();
    let secret = config.prediction_api_secret.clone();
    let timeout_secs = config.request_timeout_secs;

    tokio::spawn(async move {
        match request_refresh(&base_url, &secret, timeout_secs, &course_id).await {
            Ok(()) => tracing::debug!(course_id = %course_id, "prediction refresh dispatched"),
            Err(err) => {
                tracing::warn!(course_id = %course_id, error = %err, "prediction refresh failed")
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    #[test]
    fn signed_token_carries_issuer_and_expiry() {
        let token = sign_token("shared-secret").unwrap();

        let mut validation = Validation::default();
        validation.set_issuer(&[TOKEN_ISSUER]);
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"shared-secret"),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.claims.iss, TOKEN_ISSUER);
        let remaining = decoded.claims.exp - Utc::now().timestamp();
        assert!(remaining > TOKEN_TTL_SECS - 60 && remaining <= TOKEN_TTL_SECS);
    }

    #[test]
    fn wrong_secret_fails_validation() {
        let token = sign_token("shared-secret").unwrap();
        let mut validation = Validation::default();
        validation.set_issuer(&[TOKEN_ISSUER]);
        assert!(decode::<Claims>(&token, &DecodingKey::from_secret(b"other"), &validation).is_err());
    }
}
