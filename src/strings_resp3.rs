use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::StringsStore;
use crate::cmd::cmd;
use crate::config::Config;
use crate::connection::{Handshake, Invalidation, InvalidationSink};
use crate::errors::{not_found_error, Error, ErrorKind, RimcuResult};
use crate::pool::{Pool, PoolConfig};
use crate::strings::{StringsEngine, StringsResult};
use crate::types::Value;

/// Strings cache over RESP3 server-assisted tracking.
///
/// No application-level publishes: every data connection runs with
/// `CLIENT TRACKING ON` and the server pushes invalidations for the
/// keys read over it. Push payloads carry either keys or a slot number;
/// the slot index resolves the latter to the locally cached keys.
pub(crate) struct StringsCacheResp3 {
    pool: Pool,
    store: Arc<StringsStore>,
    cfg: Config,
}

struct TrackingSink {
    store: Arc<StringsStore>,
}

impl InvalidationSink for TrackingSink {
    fn invalidate(&self, invalidation: Invalidation) {
        match invalidation {
            Invalidation::Keys(keys) => {
                for key in keys {
                    self.store.del(&key);
                }
            }
            Invalidation::Slot(slot) => self.store.purge_slot(slot),
            Invalidation::All => self.store.purge(),
        }
    }
}

impl StringsCacheResp3 {
    pub(crate) async fn new(cfg: Config) -> RimcuResult<StringsCacheResp3> {
        let store = Arc::new(StringsStore::new(cfg.cache_size, true));
        let pool = Pool::new(PoolConfig {
            server_addr: cfg.server_addr.clone(),
            max_conns: cfg.max_conns,
            acquire_timeout: cfg.acquire_timeout,
            response_timeout: cfg.response_timeout,
            handshake: Handshake::Resp3Tracking,
            invalidations: Some(Arc::new(TrackingSink {
                store: Arc::clone(&store),
            })),
            // A dead connection takes its tracking scope with it; the
            // keys it read can no longer be trusted, and which ones
            // those were is not recorded per connection here.
            on_destroyed: Some({
                let store = Arc::clone(&store);
                Arc::new(move |_conn_id| store.purge())
            }),
        });
        Ok(StringsCacheResp3 { pool, store, cfg })
    }
}

#[async_trait]
impl StringsEngine for StringsCacheResp3 {
    async fn setex(&self, key: &str, val: &[u8], ttl: Duration) -> RimcuResult<()> {
        let ttl = self.cfg.effective_ttl(ttl);
        let mut conn = self.pool.acquire().await?;
        conn.do_cmd(
            &cmd("SET")
                .arg(key)
                .arg(val)
                .arg("EX")
                .arg(ttl.as_secs().max(1)),
        )
        .await?
        .into_status()?;
        // No local prime: tracking coverage is read-driven, so a key
        // cached here without a GET would never be invalidated. A
        // stale replica from an earlier read is cleared by the push
        // this write triggers.
        Ok(())
    }

    async fn get(&self, key: &str, ttl: Duration) -> RimcuResult<StringsResult> {
        if let Some(val) = self.store.get(key) {
            return Ok(StringsResult::local(val));
        }
        let ttl = self.cfg.effective_ttl(ttl);
        let mut conn = self.pool.acquire().await?;
        match conn.do_cmd(&cmd("GET").arg(key)).await? {
            Value::Nil => Err(not_found_error()),
            reply => {
                let val = reply.into_bytes()?;
                self.store.set_ex(key, &val, conn.client_id(), ttl);
                Ok(StringsResult::remote(val))
            }
        }
    }

    async fn del(&self, key: &str) -> RimcuResult<()> {
        self.store.del(key);
        let mut conn = self.pool.acquire().await?;
        conn.do_cmd(&cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn append(&self, key: &str, val: &[u8]) -> RimcuResult<()> {
        let mut conn = self.pool.acquire().await?;
        conn.do_cmd(&cmd("APPEND").arg(key).arg(val)).await?;
        self.store.del(key);
        Ok(())
    }

    async fn mset(&self, pairs: &[(&str, &[u8])]) -> RimcuResult<()> {
        if pairs.is_empty() {
            return Err(Error::from((ErrorKind::InvalidArgs, "mset with no pairs")));
        }
        let mut command = cmd("MSET");
        for (key, val) in pairs {
            command = command.arg(*key).arg(*val);
        }
        let mut conn = self.pool.acquire().await?;
        conn.do_cmd(&command).await?.into_status()?;
        for (key, _) in pairs {
            self.store.del(key);
        }
        Ok(())
    }

    async fn mget(
        &self,
        keys: &[&str],
        ttl: Duration,
    ) -> RimcuResult<Vec<Option<StringsResult>>> {
        if keys.is_empty() {
            return Err(Error::from((ErrorKind::InvalidArgs, "mget with no keys")));
        }
        let mut results: Vec<Option<StringsResult>> = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        for (idx, key) in keys.iter().enumerate() {
            match self.store.get(key) {
                Some(val) => results.push(Some(StringsResult::local(val))),
                None => {
                    results.push(None);
                    missing.push(idx);
                }
            }
        }
        if missing.is_empty() {
            return Ok(results);
        }

        let ttl = self.cfg.effective_ttl(ttl);
        let mut command = cmd("MGET");
        for &idx in &missing {
            command = command.arg(keys[idx]);
        }
        let mut conn = self.pool.acquire().await?;
        let replies = conn.do_cmd(&command).await?.into_array()?;
        for (&idx, reply) in missing.iter().zip(replies) {
            if let Value::Nil = reply {
                continue;
            }
            let val = reply.into_bytes()?;
            self.store.set_ex(keys[idx], &val, conn.client_id(), ttl);
            results[idx] = Some(StringsResult::remote(val));
        }
        Ok(results)
    }

    fn contains_local(&self, key: &str) -> bool {
        self.store.get(key).is_some()
    }

    fn close(&self) {
        self.pool.close();
    }
}
