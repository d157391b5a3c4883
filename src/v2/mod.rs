//! Generation-2 backend: TTL-refresh registration over the HTTP keys API.
//!
//! Registration is a create-only write; renewal is a conditional refresh
//! that extends the TTL without touching the value. The watch is a
//! recursive long-poll that treats every read error as transient; only
//! cancellation terminates a generation-2 subscription.

mod keys;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::discoverer::{Discoverer, Events, KeepAlive, WatchHandle};
use crate::error::{Error, Result};
use crate::event::{Action, Event};
use crate::{key, watch};

use keys::{KeysClient, KeysResponse, CODE_EVENT_INDEX_CLEARED};

/// Discoverer over an etcd cluster speaking the generation-2 protocol.
pub struct V2Discoverer {
    keys: KeysClient,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl V2Discoverer {
    /// Connect to the given endpoints (e.g. `http://127.0.0.1:2379`).
    ///
    /// Endpoints are tried in order on connection-level failure.
    pub fn connect<S: AsRef<str>>(endpoints: &[S]) -> Result<Self> {
        Self::new(endpoints, None)
    }

    /// Connect with basic-auth credentials.
    pub fn connect_with_auth<S: AsRef<str>>(
        endpoints: &[S],
        username: &str,
        password: &str,
    ) -> Result<Self> {
        Self::new(
            endpoints,
            Some((username.to_string(), password.to_string())),
        )
    }

    fn new<S: AsRef<str>>(endpoints: &[S], auth: Option<(String, String)>) -> Result<Self> {
        let endpoints = endpoints
            .iter()
            .map(|endpoint| endpoint.as_ref().to_string())
            .collect();
        Ok(Self {
            keys: KeysClient::new(endpoints, auth)?,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Override the per-request timeout, which is also the interval the
    /// watch loop sleeps before re-polling after a read error.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.keys.set_request_timeout(timeout);
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Discoverer for V2Discoverer {
    async fn register(
        &self,
        namespace: &str,
        name: &str,
        addr: &str,
        ttl: Duration,
    ) -> Result<KeepAlive> {
        self.ensure_open()?;
        let ttl_secs = ttl.as_secs();
        if ttl_secs == 0 {
            return Err(Error::InvalidTtl);
        }

        let registered = key::join(namespace, name);
        self.keys.create(&registered, addr, ttl_secs).await?;
        debug!(key = %registered, ttl = ttl_secs, "registered service");

        let keys = self.keys.clone();
        Ok(KeepAlive::new(move || {
            let keys = keys.clone();
            let registered = registered.clone();
            Box::pin(async move {
                // Refresh to twice the registration interval so one missed
                // renewal does not drop the entry.
                keys.refresh(&registered, 2 * ttl_secs).await.map(|_| ())
            })
        }))
    }

    async fn unregister(&self, namespace: &str, name: &str) -> Result<()> {
        self.ensure_open()?;
        let removed = key::join(namespace, name);
        self.keys.delete(&removed).await?;
        debug!(key = %removed, "unregistered service");
        Ok(())
    }

    async fn watch(&self, namespace: &str) -> Result<(Events, WatchHandle)> {
        self.ensure_open()?;
        let (tx, events) = watch::subscription();
        let token = self.cancel.child_token();

        let keys = self.keys.clone();
        let namespace = namespace.to_string();
        let task_token = token.clone();
        tokio::spawn(run_watch(keys, namespace, tx, task_token));

        Ok((events, WatchHandle::new(token)))
    }

    async fn services(&self, namespace: &str) -> Result<HashMap<String, String>> {
        self.ensure_open()?;
        let listing = self.keys.get_recursive(namespace).await?;

        let mut services = HashMap::new();
        if let Some(root) = listing.node {
            for child in root.nodes {
                let Some(name) = key::relative(namespace, &child.key) else {
                    continue;
                };
                let Some(addr) = child.value else {
                    // directories carry no value
                    continue;
                };
                services.insert(name.to_string(), addr);
            }
        }
        Ok(services)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        self.cancel.cancel();
        Ok(())
    }

    fn version(&self) -> u8 {
        2
    }
}

/// Long-poll loop for one subscription.
///
/// Only cancellation is terminal: read errors sleep one request-timeout
/// interval and re-poll at the same index. An index-cleared response
/// resumes from the current head, accepting that changes in the gap are
/// lost.
async fn run_watch(
    keys: KeysClient,
    namespace: String,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let mut after_index: Option<u64> = None;
    loop {
        let poll = tokio::select! {
            _ = cancel.cancelled() => break,
            poll = keys.watch(&namespace, after_index) => poll,
        };
        match poll {
            Ok(change) => {
                if let Some(index) = change.change_index() {
                    after_index = Some(index + 1);
                }
                if let Some(event) = normalize(&namespace, &change) {
                    if !watch::deliver(&tx, &cancel, event).await {
                        break;
                    }
                }
            }
            Err(Error::Api {
                code: CODE_EVENT_INDEX_CLEARED,
                ..
            }) => {
                warn!(namespace = %namespace, "watch index cleared, resuming from current state");
                after_index = None;
            }
            Err(err) => {
                debug!(namespace = %namespace, error = %err, "watch read failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(keys.request_timeout()) => {}
                }
            }
        }
    }
    debug!(namespace = %namespace, "watch terminated");
    // dropping tx closes the event stream
}

/// Map one raw change onto the canonical event schema.
///
/// For expirations and deletions the current node is gone, so the name
/// and address come from the previous node.
fn normalize(namespace: &str, change: &KeysResponse) -> Option<Event> {
    let action = Action::from_v2(&change.action)?;
    let node = if action.is_deleted() {
        change.prev_node.as_ref().or(change.node.as_ref())
    } else {
        change.node.as_ref()
    };
    let node = node?;
    let name = key::relative(namespace, &node.key)?;
    Some(Event {
        action,
        name: name.to_string(),
        addr: node.value.clone().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(action: &str, node: Option<keys::Node>, prev: Option<keys::Node>) -> KeysResponse {
        KeysResponse {
            action: action.to_string(),
            node,
            prev_node: prev,
        }
    }

    fn node(key: &str, value: Option<&str>, modified_index: u64) -> keys::Node {
        keys::Node {
            key: key.to_string(),
            value: value.map(str::to_string),
            dir: false,
            nodes: Vec::new(),
            modified_index,
        }
    }

    #[test]
    fn create_uses_the_current_node() {
        let change = change(
            "create",
            Some(node("/svc/worker-1", Some("10.0.0.5:9000"), 7)),
            None,
        );
        let event = normalize("svc", &change).unwrap();
        assert_eq!(event.action, Action::Created);
        assert_eq!(event.name, "worker-1");
        assert_eq!(event.addr, "10.0.0.5:9000");
    }

    #[test]
    fn expiry_takes_the_address_from_the_previous_node() {
        let change = change(
            "expire",
            Some(node("/svc/worker-1", None, 9)),
            Some(node("/svc/worker-1", Some("10.0.0.5:9000"), 7)),
        );
        let event = normalize("svc", &change).unwrap();
        assert_eq!(event.action, Action::Deleted);
        assert_eq!(event.name, "worker-1");
        assert_eq!(event.addr, "10.0.0.5:9000");
    }

    #[test]
    fn delete_without_a_previous_node_still_yields_an_event() {
        let change = change("delete", Some(node("/svc/worker-1", None, 9)), None);
        let event = normalize("svc", &change).unwrap();
        assert_eq!(event.action, Action::Deleted);
        assert_eq!(event.addr, "");
    }

    #[test]
    fn foreign_keys_are_skipped() {
        let change = change(
            "set",
            Some(node("/other/worker-1", Some("10.0.0.5:9000"), 7)),
            None,
        );
        assert!(normalize("svc", &change).is_none());
    }

    #[test]
    fn non_lifecycle_actions_are_skipped() {
        let change = change(
            "get",
            Some(node("/svc/worker-1", Some("10.0.0.5:9000"), 7)),
            None,
        );
        assert!(normalize("svc", &change).is_none());
    }
}
