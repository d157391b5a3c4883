//! Generation-3 backend: lease-grant + keepalive registration over gRPC.
//!
//! Registration grants a lease and binds the entry to it inside a
//! create-revision transaction; the store's own lease expiry is the
//! crash-detection mechanism. The watch is a prefix stream; any read
//! error is terminal for this generation and closes the subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions, WatchStream, Watcher,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::discoverer::{Discoverer, Events, KeepAlive, WatchHandle};
use crate::error::{Error, Result};
use crate::event::{Action, Event};
use crate::{key, watch};

/// Discoverer over an etcd cluster speaking the generation-3 protocol.
pub struct V3Discoverer {
    client: Client,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl V3Discoverer {
    /// Connect to the given endpoints (e.g. `http://127.0.0.1:2379`).
    pub async fn connect<S: AsRef<str>>(endpoints: &[S]) -> Result<Self> {
        Self::new(endpoints, None).await
    }

    /// Connect with credentials.
    pub async fn connect_with_auth<S: AsRef<str>>(
        endpoints: &[S],
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let options = ConnectOptions::new().with_user(username, password);
        Self::new(endpoints, Some(options)).await
    }

    async fn new<S: AsRef<str>>(endpoints: &[S], options: Option<ConnectOptions>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        let client = Client::connect(endpoints, options).await?;
        Ok(Self {
            client,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
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
impl Discoverer for V3Discoverer {
    async fn register(
        &self,
        namespace: &str,
        name: &str,
        addr: &str,
        ttl: Duration,
    ) -> Result<KeepAlive> {
        self.ensure_open()?;
        // lease TTLs are whole seconds, rounded down
        let ttl_secs = ttl.as_secs() as i64;
        if ttl_secs == 0 {
            return Err(Error::InvalidTtl);
        }

        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl_secs, None).await?;
        let registered = key::join(namespace, name);

        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                registered.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                registered.as_str(),
                addr,
                Some(PutOptions::new().with_lease(lease.id())),
            )]);
        let committed = client.txn(txn).await?;
        if !committed.succeeded() {
            // the fresh lease is bound to nothing; don't leave it ticking
            let _ = client.lease_revoke(lease.id()).await;
            return Err(Error::AlreadyRegistered);
        }
        debug!(key = %registered, lease = lease.id(), ttl = ttl_secs, "registered service");

        let (keeper, stream) = client.lease_keep_alive(lease.id()).await?;
        let channel = Arc::new(Mutex::new((keeper, stream)));
        Ok(KeepAlive::new(move || {
            let channel = Arc::clone(&channel);
            Box::pin(async move {
                let mut guard = channel.lock().await;
                let (keeper, stream) = &mut *guard;
                keeper.keep_alive().await?;
                match stream.message().await? {
                    // the store reports a dead lease with a zero TTL
                    Some(renewed) if renewed.ttl() > 0 => Ok(()),
                    _ => Err(Error::NotRegistered),
                }
            })
        }))
    }

    async fn unregister(&self, namespace: &str, name: &str) -> Result<()> {
        self.ensure_open()?;
        let removed = key::join(namespace, name);
        let mut client = self.client.clone();

        let current = client.get(removed.as_str(), None).await?;
        let Some(entry) = current.kvs().first() else {
            return Err(Error::NotRegistered);
        };
        if entry.lease() != 0 {
            // revoking the lease removes every key bound to it and fences
            // the owner's keepalive
            client.lease_revoke(entry.lease()).await?;
        } else {
            client.delete(removed.as_str(), None).await?;
        }
        debug!(key = %removed, "unregistered service");
        Ok(())
    }

    async fn watch(&self, namespace: &str) -> Result<(Events, WatchHandle)> {
        self.ensure_open()?;
        let mut client = self.client.clone();
        // open the backend watch before returning so open failures
        // surface synchronously
        let options = WatchOptions::new().with_prefix().with_prev_key();
        let (watcher, stream) = client
            .watch(key::prefix(namespace).as_str(), Some(options))
            .await?;

        let (tx, events) = watch::subscription();
        let token = self.cancel.child_token();
        let namespace = namespace.to_string();
        let task_token = token.clone();
        tokio::spawn(run_watch(watcher, stream, namespace, tx, task_token));

        Ok((events, WatchHandle::new(token)))
    }

    async fn services(&self, namespace: &str) -> Result<HashMap<String, String>> {
        self.ensure_open()?;
        let mut client = self.client.clone();
        let listing = client
            .get(
                key::prefix(namespace).as_str(),
                Some(GetOptions::new().with_prefix()),
            )
            .await?;

        let mut services = HashMap::new();
        for entry in listing.kvs() {
            let entry_key = String::from_utf8_lossy(entry.key());
            let Some(name) = key::relative(namespace, &entry_key) else {
                continue;
            };
            services.insert(
                name.to_string(),
                String::from_utf8_lossy(entry.value()).into_owned(),
            );
        }
        Ok(services)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        self.cancel.cancel();
        Ok(())
    }

    fn version(&self) -> u8 {
        3
    }
}

/// Stream consumer for one subscription.
///
/// Any read error or end of stream is terminal for this generation: the
/// event stream closes and the caller must re-watch.
async fn run_watch(
    mut watcher: Watcher,
    mut stream: WatchStream,
    namespace: String,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    'read: loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break 'read,
            message = stream.message() => message,
        };
        match message {
            Ok(Some(response)) => {
                for raw in response.events() {
                    let Some(event) = normalize(&namespace, raw) else {
                        continue;
                    };
                    if !watch::deliver(&tx, &cancel, event).await {
                        break 'read;
                    }
                }
            }
            Ok(None) => {
                debug!(namespace = %namespace, "watch stream ended");
                break 'read;
            }
            Err(err) => {
                warn!(namespace = %namespace, error = %err, "watch stream failed");
                break 'read;
            }
        }
    }
    let _ = watcher.cancel().await;
    debug!(namespace = %namespace, "watch terminated");
    // dropping tx closes the event stream
}

/// Map one raw change record onto the canonical event schema.
///
/// A put on a key whose mod revision equals its create revision is a
/// first write; later puts are overwrites. Deletions carry no current
/// value, so name and address come from the previous key-value.
fn normalize(namespace: &str, raw: &etcd_client::Event) -> Option<Event> {
    let current = raw.kv()?;
    match raw.event_type() {
        EventType::Put => {
            let action = if current.create_revision() == current.mod_revision() {
                Action::Created
            } else {
                Action::Updated
            };
            let entry_key = String::from_utf8_lossy(current.key());
            let name = key::relative(namespace, &entry_key)?;
            Some(Event {
                action,
                name: name.to_string(),
                addr: String::from_utf8_lossy(current.value()).into_owned(),
            })
        }
        EventType::Delete => {
            let prior = raw.prev_kv().unwrap_or(current);
            let entry_key = String::from_utf8_lossy(prior.key());
            let name = key::relative(namespace, &entry_key)?;
            Some(Event {
                action: Action::Deleted,
                name: name.to_string(),
                addr: String::from_utf8_lossy(prior.value()).into_owned(),
            })
        }
    }
}
