//! Realtime Database REST client.
//!
//! Every node is addressable as `{database_url}/{path}.json`; PUT replaces,
//! PATCH merges children, DELETE removes, and `shallow=true` lists keys.

use async_trait::async_trait;
use orion_common::util::truncate_with_ellipsis;
use orion_common::FirebaseConfig;
use reqwest::Method;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use super::auth::FirebaseAuth;
use super::{DocumentStore, SinkError};

const MAX_ERROR_BODY_CHARS: usize = 300;

pub struct FirebaseStore {
    client: reqwest::Client,
    base_url: String,
    auth: FirebaseAuth,
}

impl FirebaseStore {
    pub fn new(base_url: impl Into<String>, auth: FirebaseAuth, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    pub fn from_config(config: &FirebaseConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let auth = FirebaseAuth::from_config(config, client.clone())?;
        tracing::info!(
            auth = auth.kind(),
            principal = auth.principal().unwrap_or("-"),
            "Firebase store configured"
        );

        Ok(Self::new(config.database_url.clone(), auth, client))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path.trim_matches('/'))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, SinkError> {
        let mut request = self.client.request(method.clone(), self.url(path)).query(query);

        if let Some((name, credential)) = self.auth.query_param().await? {
            request = request.query(&[(name, credential)]);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(method = %method, path = %path, "Firebase request");

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Http {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body: truncate_with_ellipsis(body.trim(), MAX_ERROR_BODY_CHARS),
            });
        }

        Ok(response)
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, SinkError> {
        let text = response
            .text()
            .await
            .map_err(|e| SinkError::Network(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| SinkError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl DocumentStore for FirebaseStore {
    fn name(&self) -> &'static str {
        "firebase"
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, SinkError> {
        let response = self.send(Method::GET, path, None, &[]).await?;
        let value = Self::read_json(response).await?;
        Ok((!value.is_null()).then_some(value))
    }

    async fn get_shallow_keys(&self, path: &str) -> Result<Vec<String>, SinkError> {
        let response = self
            .send(Method::GET, path, None, &[("shallow", "true")])
            .await?;
        Ok(match Self::read_json(response).await? {
            Value::Object(map) => map.into_iter().map(|(k, _)| k).collect(),
            _ => Vec::new(),
        })
    }

    async fn set(&self, path: &str, value: &Value) -> Result<(), SinkError> {
        self.send(Method::PUT, path, Some(value), &[("print", "silent")])
            .await
            .map(|_| ())
    }

    async fn update(&self, path: &str, value: &Map<String, Value>) -> Result<(), SinkError> {
        let body = Value::Object(value.clone());
        self.send(Method::PATCH, path, Some(&body), &[("print", "silent")])
            .await
            .map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<(), SinkError> {
        self.send(Method::DELETE, path, None, &[]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer, auth: FirebaseAuth) -> FirebaseStore {
        FirebaseStore::new(format!("{}/", server.uri()), auth, reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_put_with_database_secret() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/root/status.json"))
            .and(query_param("auth", "s3cret"))
            .and(query_param("print", "silent"))
            .and(body_json(json!({"state": "running"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = store(&server, FirebaseAuth::DatabaseSecret("s3cret".into()));
        store.set("/root/status", &json!({"state": "running"})).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_and_shallow_keys() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/root/snapshots.json"))
            .and(query_param("shallow", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"k1": true, "k2": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/root/metadata/chain_hash.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .mount(&server)
            .await;

        let store = store(&server, FirebaseAuth::None);
        let mut keys = store.get_shallow_keys("root/snapshots").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["k1", "k2"]);
        assert_eq!(store.get("root/metadata/chain_hash").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_error_status_maps_to_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "Permission denied"})))
            .mount(&server)
            .await;

        let store = store(&server, FirebaseAuth::None);
        let err = store.update("root/coins", &Map::new()).await.unwrap_err();
        match err {
            SinkError::Http { status, method, body, .. } => {
                assert_eq!(status, 401);
                assert_eq!(method, "PATCH");
                assert!(body.contains("Permission denied"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_delete() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/root/snapshots/2024-05-01_12-00-00.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .expect(1)
            .mount(&server)
            .await;

        let store = store(&server, FirebaseAuth::None);
        store.delete("root/snapshots/2024-05-01_12-00-00").await.unwrap();
    }
}
