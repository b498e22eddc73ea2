//! OAuth access tokens for the Firestore REST API.

use std::time::Duration;

use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::StoreError;
use crate::config::AdminCredentials;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
// Tokens live an hour; refresh well before that.
const TOKEN_TTL: Duration = Duration::from_secs(50 * 60);

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Clone)]
pub(crate) enum TokenSource {
    ServiceAccount {
        client_email: String,
        key: EncodingKey,
        http_client: reqwest::Client,
        cache: moka::future::Cache<(), String>,
    },
    /// The Firestore emulator accepts this fixed token.
    Emulator,
}

impl TokenSource {
    pub fn service_account(
        credentials: &AdminCredentials,
        http_client: reqwest::Client,
    ) -> Result<Self, StoreError> {
        let key = EncodingKey::from_rsa_pem(credentials.private_key.as_bytes())
            .map_err(|e| StoreError::Auth(format!("invalid service account private key: {}", e)))?;
        Ok(Self::ServiceAccount {
            client_email: credentials.client_email.clone(),
            key,
            http_client,
            cache: moka::future::Cache::builder()
                .max_capacity(1)
                .time_to_live(TOKEN_TTL)
                .build(),
        })
    }

    pub async fn bearer_token(&self) -> Result<String, StoreError> {
        match self {
            Self::Emulator => Ok("owner".to_string()),
            Self::ServiceAccount {
                client_email,
                key,
                http_client,
                cache,
            } => cache
                .try_get_with((), fetch_token(http_client, client_email, key))
                .await
                .map_err(|e| StoreError::Auth(e.to_string())),
        }
    }
}

fn sign_assertion(client_email: &str, key: &EncodingKey) -> Result<String, StoreError> {
    let iat = chrono::Utc::now().timestamp();
    let claims = Claims {
        iss: client_email,
        scope: DATASTORE_SCOPE,
        aud: TOKEN_URL,
        iat,
        exp: iat + ASSERTION_LIFETIME_SECS,
    };
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, key)
        .map_err(|e| StoreError::Auth(format!("failed to sign assertion: {}", e)))
}

async fn fetch_token(
    http_client: &reqwest::Client,
    client_email: &str,
    key: &EncodingKey,
) -> Result<String, StoreError> {
    let assertion = sign_assertion(client_email, key)?;
    debug!("requesting Firestore access token for {}", client_email);

    let token: TokenResponse = retry(
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(Some(Duration::from_secs(6)))
            .build(),
        || async {
            let resp = http_client
                .post(TOKEN_URL)
                .form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ])
                .send()
                .await
                .map_err(|e| backoff::Error::transient(StoreError::Transport(e)))?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                let err = StoreError::Auth(format!("token endpoint returned {}: {}", status, text));
                // 5xx transient, others permanent
                return Err(if status.is_server_error() {
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                });
            }
            resp.json::<TokenResponse>()
                .await
                .map_err(|e| backoff::Error::permanent(StoreError::Decode(e.to_string())))
        },
    )
    .await?;

    info!("obtained Firestore access token");
    Ok(token.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emulator_token_is_fixed() {
        assert_eq!(TokenSource::Emulator.bearer_token().await.unwrap(), "owner");
    }

    #[test]
    fn test_rejects_malformed_private_key() {
        let creds = AdminCredentials {
            project_id: "proj".into(),
            client_email: "svc@proj.iam.gserviceaccount.com".into(),
            private_key: "not a pem".into(),
        };
        let err = TokenSource::service_account(&creds, reqwest::Client::new())
            .err()
            .expect("malformed key must be rejected");
        assert!(matches!(err, StoreError::Auth(_)));
    }
}
