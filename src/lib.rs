//! rimcu is a client-side caching library for Redis-compatible
//! servers. Each process keeps a bounded in-memory replica of recently
//! read keys; writes made through the library invalidate the
//! corresponding replicas in all cooperating processes within bounded
//! time.
//!
//! Two invalidation transports are supported and selected through
//! [`Config::protocol`]:
//!
//! - **RESP3 server-assisted tracking** — data connections run with
//!   `CLIENT TRACKING ON` and the server pushes invalidations for the
//!   keys they read; no application-level protocol is involved.
//! - **RESP2 application-assisted invalidation** — every mutating
//!   operation runs as an atomic server-side script that pairs the
//!   write with a publish on a well-known channel (`rimcu:strings`,
//!   `rimcu:list`); a dedicated subscriber connection per upstream
//!   shard feeds those notifications back into the local cache.
//!
//! The library is eventually consistent: a read may serve a value that
//! a concurrent writer has already replaced, bounded by the
//! subscriber round-trip. Whenever the subscriber loses its stream,
//! the whole local cache is purged on resubscription, because
//! invalidations may have been missed in between.
//!
//! # Strings
//!
//! ```rust,no_run
//! # async fn example() -> rimcu::RimcuResult<()> {
//! use std::time::Duration;
//!
//! let cache = rimcu::StringsCache::new(rimcu::Config {
//!     server_addr: "127.0.0.1:6379".into(),
//!     ..Default::default()
//! })
//! .await?;
//!
//! cache.setex("greeting", b"hello", Duration::from_secs(60)).await?;
//! let value = cache.get("greeting", Duration::from_secs(60)).await?;
//! assert_eq!(value.string()?, "hello");
//! # Ok(())
//! # }
//! ```
//!
//! # Lists
//!
//! The list cache keeps whole lists in memory and reconciles local
//! mutations with the notification stream through per-operation ids:
//! a locally written entry stays *dirty* — reads go to the server —
//! until the write's own echo arrives, at which point buffered remote
//! notifications are replayed in order.
//!
//! Connections are not safe for concurrent use; concurrency comes from
//! the internal pool, capped at [`Config::max_conns`] outstanding
//! connections.

#![deny(unsafe_code)]

mod cache;
mod cluster;
mod cmd;
mod config;
mod connection;
mod errors;
mod list;
mod notif;
mod parser;
mod pool;
mod script;
mod slot;
mod strings;
mod strings_resp2;
mod strings_resp3;
mod subscriber;
mod types;

pub use config::{Config, Protocol};
pub use errors::{Error, ErrorKind, RimcuResult};
pub use list::ListCache;
pub use slot::key_slot;
pub use strings::{StringsCache, StringsResult};
pub use types::{PushKind, Value};
