//! Credentials for the Realtime Database REST API.
//!
//! A service account is exchanged for a short-lived OAuth access token via a
//! signed JWT grant. The legacy database secret is passed through as `auth=`.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use orion_common::FirebaseConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::SinkError;

const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const SCOPES: &str =
    "https://www.googleapis.com/auth/firebase.database https://www.googleapis.com/auth/userinfo.email";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 60;

/// The fields of a Google service-account key file that matter here.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.into()
}

#[derive(Debug, Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Service-account credentials with a cached access token.
pub struct ServiceAccountAuth {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for ServiceAccountAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountAuth")
            .field("client_email", &self.key.client_email)
            .field("token_uri", &self.key.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountAuth {
    pub fn new(key: ServiceAccountKey, client: reqwest::Client) -> Result<Self, SinkError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| SinkError::Auth(format!("invalid service account private key: {e}")))?;

        Ok(Self {
            key,
            encoding_key,
            client,
            cached: Mutex::new(None),
        })
    }

    /// Parse the key file contents (the `FIREBASE_KEY_JSON` secret).
    pub fn from_json(raw: &str, client: reqwest::Client) -> Result<Self, SinkError> {
        let key: ServiceAccountKey = serde_json::from_str(raw)
            .map_err(|e| SinkError::Auth(format!("invalid service account JSON: {e}")))?;
        Self::new(key, client)
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    /// RS256-signed grant assertion.
    fn assertion(&self, now: DateTime<Utc>) -> Result<String, SinkError> {
        let claims = GrantClaims {
            iss: &self.key.client_email,
            scope: SCOPES,
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };

        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| SinkError::Auth(format!("failed to sign grant: {e}")))
    }

    /// Current access token, fetching a new one when missing or about to
    /// expire.
    pub async fn access_token(&self) -> Result<String, SinkError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();

        if let Some(token) = cached.as_ref() {
            if now + Duration::seconds(REFRESH_MARGIN_SECS) < token.expires_at {
                return Ok(token.token.clone());
            }
        }

        let fresh = self.request_token(now).await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn request_token(&self, now: DateTime<Utc>) -> Result<CachedToken, SinkError> {
        let assertion = self.assertion(now)?;

        tracing::debug!(client_email = %self.key.client_email, "Requesting OAuth access token");

        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| SinkError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Auth(format!("token endpoint returned {status}: {body}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SinkError::InvalidResponse(format!("token response: {e}")))?;

        Ok(CachedToken {
            token: token.access_token,
            expires_at: now + Duration::seconds(token.expires_in),
        })
    }
}

/// How requests to the database authenticate.
#[derive(Debug)]
pub enum FirebaseAuth {
    None,
    DatabaseSecret(String),
    ServiceAccount(ServiceAccountAuth),
}

impl FirebaseAuth {
    /// Service account wins over a database secret; neither means
    /// unauthenticated requests.
    pub fn from_config(config: &FirebaseConfig, client: reqwest::Client) -> Result<Self, SinkError> {
        let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

        if let Some(json) = non_empty(&config.credentials_json) {
            return Ok(Self::ServiceAccount(ServiceAccountAuth::from_json(&json, client)?));
        }
        if let Some(secret) = non_empty(&config.database_secret) {
            return Ok(Self::DatabaseSecret(secret));
        }
        Ok(Self::None)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::DatabaseSecret(_) => "database_secret",
            Self::ServiceAccount(_) => "service_account",
        }
    }

    /// Account the requests act as, when it is known.
    pub fn principal(&self) -> Option<&str> {
        match self {
            Self::ServiceAccount(sa) => Some(sa.client_email()),
            Self::None | Self::DatabaseSecret(_) => None,
        }
    }

    /// Query parameter carrying the credential, if any.
    pub async fn query_param(&self) -> Result<Option<(&'static str, String)>, SinkError> {
        Ok(match self {
            Self::None => None,
            Self::DatabaseSecret(secret) => Some(("auth", secret.clone())),
            Self::ServiceAccount(sa) => Some(("access_token", sa.access_token().await?)),
        })
    }
}
