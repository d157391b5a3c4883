//! Thin wire adapter for the etcd v2 keys API.
//!
//! Exposes exactly the primitives the discovery layer assumes: create,
//! conditional refresh, delete, recursive listing, and a recursive
//! long-poll watch. No retry policy lives here beyond trying each
//! configured endpoint in order on connection-level failure; retry
//! decisions belong to the watch loop above.

use std::time::Duration;

use serde::Deserialize;
use tracing::trace;

use crate::error::{Error, Result};

/// Default per-request timeout for non-watch calls; also the fixed
/// interval the watch loop sleeps before re-polling after a read error.
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Store error code: key not found.
const CODE_KEY_NOT_FOUND: u64 = 100;
/// Store error code: key already exists.
const CODE_NODE_EXIST: u64 = 105;
/// Store error code: the requested watch index was compacted away.
pub(crate) const CODE_EVENT_INDEX_CLEARED: u64 = 401;

/// One node in a keys response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Node {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub modified_index: u64,
}

/// A keys API response document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KeysResponse {
    pub action: String,
    #[serde(default)]
    pub node: Option<Node>,
    #[serde(default)]
    pub prev_node: Option<Node>,
}

impl KeysResponse {
    /// The index of the change this response describes, if any.
    pub fn change_index(&self) -> Option<u64> {
        self.node.as_ref().map(|node| node.modified_index)
    }
}

/// Error document returned by the store on failure.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiError {
    error_code: u64,
    #[serde(default)]
    message: String,
}

fn map_api_error(err: ApiError) -> Error {
    match err.error_code {
        CODE_KEY_NOT_FOUND => Error::NotRegistered,
        CODE_NODE_EXIST => Error::AlreadyRegistered,
        code => Error::Api {
            code,
            message: err.message,
        },
    }
}

/// HTTP client for one v2 cluster.
#[derive(Debug, Clone)]
pub(crate) struct KeysClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
    auth: Option<(String, String)>,
    request_timeout: Duration,
}

impl KeysClient {
    pub fn new(endpoints: Vec<String>, auth: Option<(String, String)>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        // No client-wide timeout: watch long-polls must be able to idle.
        // Non-watch calls set a per-request timeout instead.
        let http = reqwest::Client::builder()
            .connect_timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoints,
            auth,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn url(&self, endpoint: &str, key: &str) -> String {
        format!(
            "{}/v2/keys/{}",
            endpoint.trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }

    /// Issue a request against each endpoint in order until one answers
    /// at the transport level.
    async fn execute<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut last_err: Option<reqwest::Error> = None;
        for endpoint in &self.endpoints {
            let mut request = build(endpoint);
            if let Some((username, password)) = &self.auth {
                request = request.basic_auth(username, Some(password));
            }
            match request.send().await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_connect() => {
                    trace!(endpoint = %endpoint, error = %err, "endpoint unreachable");
                    last_err = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_err.map(Error::from).unwrap_or(Error::NoEndpoints))
    }

    async fn parse(response: reqwest::Response) -> Result<KeysResponse> {
        let status = response.status();
        let body = response.bytes().await?;
        if status.is_success() {
            return Ok(serde_json::from_slice(&body).map_err(|err| Error::Api {
                code: status.as_u16() as u64,
                message: err.to_string(),
            })?);
        }
        match serde_json::from_slice::<ApiError>(&body) {
            Ok(err) => Err(map_api_error(err)),
            Err(_) => Err(Error::Api {
                code: status.as_u16() as u64,
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }

    /// Create-only write with a TTL; fails if the key exists.
    pub async fn create(&self, key: &str, value: &str, ttl_secs: u64) -> Result<KeysResponse> {
        let ttl = ttl_secs.to_string();
        let response = self
            .execute(|endpoint| {
                self.http
                    .put(self.url(endpoint, key))
                    .timeout(self.request_timeout)
                    .form(&[("value", value), ("ttl", ttl.as_str()), ("prevExist", "false")])
            })
            .await?;
        Self::parse(response).await
    }

    /// Conditional refresh: extend the TTL of an existing key without
    /// altering its value. Fails if the key is gone.
    pub async fn refresh(&self, key: &str, ttl_secs: u64) -> Result<KeysResponse> {
        let ttl = ttl_secs.to_string();
        let response = self
            .execute(|endpoint| {
                self.http
                    .put(self.url(endpoint, key))
                    .timeout(self.request_timeout)
                    .form(&[
                        ("ttl", ttl.as_str()),
                        ("prevExist", "true"),
                        ("refresh", "true"),
                    ])
            })
            .await?;
        Self::parse(response).await
    }

    /// Delete a single key.
    pub async fn delete(&self, key: &str) -> Result<KeysResponse> {
        let response = self
            .execute(|endpoint| {
                self.http
                    .delete(self.url(endpoint, key))
                    .timeout(self.request_timeout)
            })
            .await?;
        Self::parse(response).await
    }

    /// Recursive listing rooted at `key`.
    pub async fn get_recursive(&self, key: &str) -> Result<KeysResponse> {
        let response = self
            .execute(|endpoint| {
                self.http
                    .get(self.url(endpoint, key))
                    .timeout(self.request_timeout)
                    .query(&[("recursive", "true")])
            })
            .await?;
        Self::parse(response).await
    }

    /// Recursive long-poll watch: blocks until the next change at or
    /// after `after_index` (or the current head when `None`).
    pub async fn watch(&self, key: &str, after_index: Option<u64>) -> Result<KeysResponse> {
        let response = self
            .execute(|endpoint| {
                let mut request = self
                    .http
                    .get(self.url(endpoint, key))
                    .query(&[("wait", "true"), ("recursive", "true")]);
                if let Some(index) = after_index {
                    request = request.query(&[("waitIndex", index.to_string())]);
                }
                request
            })
            .await?;
        Self::parse(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_change_response() {
        let raw = r#"{
            "action": "set",
            "node": {
                "key": "/svc/worker-1",
                "value": "10.0.0.5:9000",
                "modifiedIndex": 7,
                "createdIndex": 6
            },
            "prevNode": {
                "key": "/svc/worker-1",
                "value": "10.0.0.4:9000",
                "modifiedIndex": 6,
                "createdIndex": 6
            }
        }"#;
        let resp: KeysResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.action, "set");
        assert_eq!(resp.change_index(), Some(7));
        assert_eq!(resp.node.unwrap().value.as_deref(), Some("10.0.0.5:9000"));
        assert_eq!(
            resp.prev_node.unwrap().value.as_deref(),
            Some("10.0.0.4:9000")
        );
    }

    #[test]
    fn decodes_a_directory_listing() {
        let raw = r#"{
            "action": "get",
            "node": {
                "key": "/svc",
                "dir": true,
                "nodes": [
                    {"key": "/svc/worker-1", "value": "10.0.0.5:9000", "modifiedIndex": 3},
                    {"key": "/svc/sub", "dir": true, "modifiedIndex": 4}
                ],
                "modifiedIndex": 2
            }
        }"#;
        let resp: KeysResponse = serde_json::from_str(raw).unwrap();
        let node = resp.node.unwrap();
        assert!(node.dir);
        assert_eq!(node.nodes.len(), 2);
        assert_eq!(node.nodes[0].value.as_deref(), Some("10.0.0.5:9000"));
        assert!(node.nodes[1].dir);
        assert!(node.nodes[1].value.is_none());
    }

    #[test]
    fn maps_known_error_codes() {
        let exists: ApiError =
            serde_json::from_str(r#"{"errorCode":105,"message":"Key already exists"}"#).unwrap();
        assert!(matches!(map_api_error(exists), Error::AlreadyRegistered));

        let missing: ApiError =
            serde_json::from_str(r#"{"errorCode":100,"message":"Key not found"}"#).unwrap();
        assert!(matches!(map_api_error(missing), Error::NotRegistered));
    }

    #[test]
    fn unknown_error_codes_pass_through() {
        let cleared: ApiError = serde_json::from_str(
            r#"{"errorCode":401,"message":"The event in requested index is outdated and cleared"}"#,
        )
        .unwrap();
        match map_api_error(cleared) {
            Error::Api { code, .. } => assert_eq!(code, CODE_EVENT_INDEX_CLEARED),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn rejects_an_empty_endpoint_list() {
        assert!(matches!(
            KeysClient::new(Vec::new(), None),
            Err(Error::NoEndpoints)
        ));
    }
}
