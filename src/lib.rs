//! Service registration and discovery over etcd.
//!
//! A process advertises `(namespace, name, address)` tuples with a bounded
//! lifetime, keeps the advertisement alive on its own timer, lists the
//! current membership of a namespace, and subscribes to a live stream of
//! membership changes. Two incompatible protocol generations are hidden
//! behind one [`Discoverer`] trait: [`V2Discoverer`] speaks the HTTP keys
//! API (TTL-refresh renewal, recursive long-poll watch) and
//! [`V3Discoverer`] speaks gRPC (lease grant + keepalive, prefix watch).
//! Backend-native change vocabularies are normalized onto one [`Event`]
//! schema.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use etcd_discovery::{Discoverer, V3Discoverer};
//!
//! # async fn run() -> etcd_discovery::Result<()> {
//! let disco = V3Discoverer::connect(&["http://127.0.0.1:2379"]).await?;
//! let keep_alive = disco
//!     .register("svc", "worker-1", "10.0.0.5:9000", Duration::from_secs(10))
//!     .await?;
//!
//! // the caller owns the renewal timer
//! tokio::spawn(async move {
//!     let mut tick = tokio::time::interval(Duration::from_secs(3));
//!     loop {
//!         tick.tick().await;
//!         if keep_alive.keep_alive().await.is_err() {
//!             break; // registration is gone; re-register
//!         }
//!     }
//! });
//!
//! let (mut events, watch) = disco.watch("svc").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{} {} {}", event.action, event.name, event.addr);
//! }
//! if !watch.is_cancelled() {
//!     // the stream closed on a backend failure; re-watch or bail
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod discoverer;
pub mod error;
pub mod event;
pub mod v2;
pub mod v3;

mod key;
mod watch;

// Re-export key types
pub use discoverer::{Discoverer, Events, KeepAlive, WatchHandle};
pub use error::{Error, Result};
pub use event::{Action, Event};
pub use v2::V2Discoverer;
pub use v3::V3Discoverer;
