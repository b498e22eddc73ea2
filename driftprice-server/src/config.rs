use std::env;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::api_url::UrlEnv;

pub const DEFAULT_SEARCH_SERVICE_URL: &str = "http://localhost:8000";
pub const DEFAULT_PORT: u16 = 3001;

const ADMIN_PROJECT_ID: &str = "FIREBASE_ADMIN_PROJECT_ID";
const ADMIN_CLIENT_EMAIL: &str = "FIREBASE_ADMIN_CLIENT_EMAIL";
const ADMIN_PRIVATE_KEY: &str = "FIREBASE_ADMIN_PRIVATE_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required Firebase Admin environment variables: {}", .0.join(", "))]
    MissingAdminCredentials(Vec<&'static str>),

    #[error("Invalid {key} value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Which store backs the recent-scrapes collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Firestore,
    Memory,
}

/// Service-account credentials for privileged Firestore access.
#[derive(Clone)]
pub struct AdminCredentials {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("project_id", &self.project_id)
            .field("client_email", &redact_email(&self.client_email))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Browser-side Firebase configuration. These values are public by design of
/// the Firebase web SDK and are handed to the dashboard as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicFirebaseConfig {
    pub api_key: Option<String>,
    pub auth_domain: Option<String>,
    pub project_id: Option<String>,
    pub storage_bucket: Option<String>,
    pub messaging_sender_id: Option<String>,
    pub app_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub search_service_url: String,
    pub log_dir: PathBuf,
    pub request_logs: bool,
    pub store: StoreKind,
    pub admin: Option<AdminCredentials>,
    pub firestore_emulator_host: Option<String>,
    pub public_firebase: PublicFirebaseConfig,
    pub url_env: UrlEnv,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source. Empty
    /// values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let url_env = UrlEnv {
            vercel_url: var("VERCEL_URL"),
            port: var("PORT"),
            public_port: var("NEXT_PUBLIC_PORT"),
        };

        let port = match url_env.port.as_deref() {
            Some(raw) => raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Invalid {
                    key: "PORT",
                    value: raw.to_string(),
                    reason: e.to_string(),
                }
            })?,
            None => {
                info!("PORT not set, using default: {}", DEFAULT_PORT);
                DEFAULT_PORT
            }
        };

        let store = match var("DRIFTPRICE_STORE").as_deref() {
            None | Some("firestore") => StoreKind::Firestore,
            Some("memory") => StoreKind::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "DRIFTPRICE_STORE",
                    value: other.to_string(),
                    reason: "expected 'firestore' or 'memory'".to_string(),
                })
            }
        };

        let admin = match store {
            StoreKind::Firestore => Some(load_admin_credentials(&var)?),
            StoreKind::Memory => {
                warn!("DRIFTPRICE_STORE=memory: recent scrapes will not be persisted");
                None
            }
        };

        let request_logs = match var("DRIFTPRICE_REQUEST_LOGS").as_deref() {
            None => false,
            Some(raw) => parse_bool(raw).ok_or_else(|| ConfigError::Invalid {
                key: "DRIFTPRICE_REQUEST_LOGS",
                value: raw.to_string(),
                reason: "expected a boolean".to_string(),
            })?,
        };

        let log_dir = var("DRIFTPRICE_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_log_dir);

        let public_firebase = PublicFirebaseConfig {
            api_key: var("NEXT_PUBLIC_FIREBASE_API_KEY"),
            auth_domain: var("NEXT_PUBLIC_FIREBASE_AUTH_DOMAIN"),
            project_id: var("NEXT_PUBLIC_FIREBASE_PROJECT_ID"),
            storage_bucket: var("NEXT_PUBLIC_FIREBASE_STORAGE_BUCKET"),
            messaging_sender_id: var("NEXT_PUBLIC_FIREBASE_MESSAGING_SENDER_ID"),
            app_id: var("NEXT_PUBLIC_FIREBASE_APP_ID"),
        };

        Ok(Self {
            port,
            search_service_url: var("SEARCH_SERVICE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_SEARCH_SERVICE_URL.to_string()),
            log_dir,
            request_logs,
            store,
            admin,
            firestore_emulator_host: var("FIRESTORE_EMULATOR_HOST"),
            public_firebase,
            url_env,
        })
    }
}

/// Console log filter from `RUST_LOG`-style directives. Without any, `info`
/// is shown so operation logs reach the console.
pub fn log_filter(directives: Option<&str>) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(directives.unwrap_or_default())
}

fn load_admin_credentials<F>(var: &F) -> Result<AdminCredentials, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let project_id = var(ADMIN_PROJECT_ID);
    let client_email = var(ADMIN_CLIENT_EMAIL);
    let private_key = var(ADMIN_PRIVATE_KEY);

    match (project_id, client_email, private_key) {
        (Some(project_id), Some(client_email), Some(private_key)) => {
            let credentials = AdminCredentials {
                project_id,
                client_email,
                // Keys pasted into env files usually carry literal "\n" escapes.
                private_key: private_key.replace("\\n", "\n"),
            };
            info!("Admin config: {:?}", credentials);
            Ok(credentials)
        }
        (project_id, client_email, private_key) => {
            let missing = [
                (ADMIN_PROJECT_ID, project_id.is_none()),
                (ADMIN_CLIENT_EMAIL, client_email.is_none()),
                (ADMIN_PRIVATE_KEY, private_key.is_none()),
            ]
            .into_iter()
            .filter_map(|(key, absent)| absent.then_some(key))
            .collect();
            Err(ConfigError::MissingAdminCredentials(missing))
        }
    }
}

fn default_log_dir() -> PathBuf {
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("logs")
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn redact_email(email: &str) -> String {
    let prefix: String = email.chars().take(10).collect();
    format!("{}...", prefix)
}
