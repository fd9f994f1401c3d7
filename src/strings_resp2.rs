use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};

use crate::cache::StringsStore;
use crate::cluster::Explorer;
use crate::cmd::cmd;
use crate::config::{Config, Protocol};
use crate::connection::Handshake;
use crate::errors::{not_found_error, Error, ErrorKind, RimcuResult};
use crate::notif::Notif;
use crate::pool::{Pool, PoolConfig};
use crate::script::Script;
use crate::strings::{StringsEngine, StringsResult};
use crate::subscriber::{
    NotifHandler, NotifSubscriber, SubscriberConfig, STRINGS_CHANNEL,
};
use crate::types::Value;

// Each write and its notification publish run as one atomic script, so
// no subscriber can observe the write without its invalidation.
const SCRIPT_SETEX: &str = r"
local setret = redis.call('setex', KEYS[1], ARGV[1], ARGV[2])
redis.call('publish', 'rimcu:strings', ARGV[3])
return 'OK'
";
const SCRIPT_DEL: &str = r"
local setret = redis.call('del', KEYS[1])
redis.call('publish', 'rimcu:strings', ARGV[1])
return '1'
";
const SCRIPT_APPEND: &str = r"
redis.call('append', KEYS[1], ARGV[1])
redis.call('publish', 'rimcu:strings', ARGV[2])
return 'OK'
";
const SCRIPT_MSET: &str = r"
local n = #KEYS
for i = 1, n do
  redis.call('set', KEYS[i], ARGV[i])
end
for i = 1, n do
  redis.call('publish', 'rimcu:strings', ARGV[n + i])
end
return 'OK'
";

/// Strings cache over the RESP2 protocol.
///
/// Writes pair the server mutation with an application-level publish;
/// the subscriber deletes replicas on every cooperating process.
/// Entries are tagged with the client id of the data connection that
/// fetched them and dropped when that connection dies, matching the
/// server's per-connection tracking scope.
pub(crate) struct StringsCacheResp2 {
    pool: Pool,
    /// Identity carried in published notifications; our own echoes are
    /// recognized by it.
    name: Vec<u8>,
    store: Arc<StringsStore>,
    script_setex: Script,
    script_del: Script,
    script_append: Script,
    script_mset: Script,
    subscribers: Vec<NotifSubscriber>,
    cfg: Config,
}

struct StringsNotifHandler {
    store: Arc<StringsStore>,
    name: Vec<u8>,
}

impl NotifHandler for StringsNotifHandler {
    fn on_message(&self, _channel: &str, payload: &[u8]) {
        let notif = match Notif::decode(payload) {
            Ok(notif) => notif,
            Err(err) => {
                error!("skipping malformed strings notification: {err}");
                return;
            }
        };
        if notif.client_id == self.name {
            // Our own echo; the write already updated the local state.
            return;
        }
        debug!("invalidating {} after a remote write", notif.key);
        self.store.del(&notif.key);
    }

    fn on_invalidate(&self, keys: Vec<String>) {
        for key in keys {
            self.store.del(&key);
        }
    }

    fn on_subscribed(&self) {
        self.store.purge();
    }
}

impl StringsCacheResp2 {
    pub(crate) async fn new(cfg: Config) -> RimcuResult<StringsCacheResp2> {
        let proxy = cfg.protocol == Protocol::Resp2ClusterProxy;
        let name = cfg.client_id_or_generated();
        let store = Arc::new(StringsStore::new(cfg.cache_size, false));
        let handler: Arc<dyn NotifHandler> = Arc::new(StringsNotifHandler {
            store: Arc::clone(&store),
            name: name.clone(),
        });

        let targets = if proxy {
            let explorer = Explorer::new(
                cfg.cluster_nodes.clone(),
                cfg.password.clone(),
                cfg.response_timeout,
            );
            let masters = explorer.discover().await?.masters();
            if masters.is_empty() {
                return Err(Error::from((
                    ErrorKind::InvalidArgs,
                    "cluster discovery returned no masters",
                )));
            }
            masters
        } else {
            vec![cfg.server_addr.clone()]
        };

        let mut subscribers = Vec::with_capacity(targets.len());
        for addr in targets {
            subscribers.push(NotifSubscriber::start(
                SubscriberConfig {
                    server_addr: addr,
                    password: cfg.password.clone(),
                    channels: vec![STRINGS_CHANNEL.to_string()],
                    track_invalidations: true,
                    bcast_tracking: proxy,
                    response_timeout: cfg.response_timeout,
                },
                Arc::clone(&handler),
            ));
        }
        for subscriber in &subscribers {
            subscriber.wait_ready(cfg.response_timeout).await?;
        }

        // Single-node mode redirects each data connection's tracking to
        // the subscriber; a cluster master cannot do that, the
        // subscriber tracks in broadcast mode there instead.
        let redirect = (!proxy).then(|| subscribers[0].client_id());

        let pool = Pool::new(PoolConfig {
            server_addr: cfg.server_addr.clone(),
            max_conns: cfg.max_conns,
            acquire_timeout: cfg.acquire_timeout,
            response_timeout: cfg.response_timeout,
            handshake: Handshake::Resp2 { redirect },
            invalidations: None,
            on_destroyed: Some({
                let store = Arc::clone(&store);
                Arc::new(move |conn_id| store.purge_conn(conn_id))
            }),
        });

        Ok(StringsCacheResp2 {
            pool,
            name,
            store,
            script_setex: Script::new(SCRIPT_SETEX),
            script_del: Script::new(SCRIPT_DEL),
            script_append: Script::new(SCRIPT_APPEND),
            script_mset: Script::new(SCRIPT_MSET),
            subscribers,
            cfg,
        })
    }

    fn notif_for(&self, key: &str) -> RimcuResult<Vec<u8>> {
        Notif::new(&self.name, key).encode()
    }
}

fn ttl_secs_arg(ttl: Duration) -> Vec<u8> {
    ttl.as_secs().max(1).to_string().into_bytes()
}

#[async_trait]
impl StringsEngine for StringsCacheResp2 {
    async fn setex(&self, key: &str, val: &[u8], ttl: Duration) -> RimcuResult<()> {
        let ttl = self.cfg.effective_ttl(ttl);
        let notif = self.notif_for(key)?;
        let mut conn = self.pool.acquire().await?;
        self.script_setex
            .invoke(
                &mut conn,
                &[key.as_bytes().to_vec()],
                &[ttl_secs_arg(ttl), val.to_vec(), notif],
            )
            .await?
            .into_status()?;
        // Prime the writer's replica; the next local read hits.
        self.store.set_ex(key, val, conn.client_id(), ttl);
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
        let notif = self.notif_for(key)?;
        let mut conn = self.pool.acquire().await?;
        self.script_del
            .invoke(&mut conn, &[key.as_bytes().to_vec()], &[notif])
            .await?;
        Ok(())
    }

    async fn append(&self, key: &str, val: &[u8]) -> RimcuResult<()> {
        let notif = self.notif_for(key)?;
        let mut conn = self.pool.acquire().await?;
        self.script_append
            .invoke(
                &mut conn,
                &[key.as_bytes().to_vec()],
                &[val.to_vec(), notif],
            )
            .await?
            .into_status()?;
        // The combined value is unknown here; drop the replica and let
        // the next read fetch it.
        self.store.del(key);
        Ok(())
    }

    async fn mset(&self, pairs: &[(&str, &[u8])]) -> RimcuResult<()> {
        if pairs.is_empty() {
            return Err(Error::from((ErrorKind::InvalidArgs, "mset with no pairs")));
        }
        let keys: Vec<Vec<u8>> = pairs.iter().map(|(k, _)| k.as_bytes().to_vec()).collect();
        let mut args: Vec<Vec<u8>> = pairs.iter().map(|(_, v)| v.to_vec()).collect();
        for (key, _) in pairs {
            args.push(self.notif_for(key)?);
        }
        let mut conn = self.pool.acquire().await?;
        self.script_mset
            .invoke(&mut conn, &keys, &args)
            .await?
            .into_status()?;
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
        for subscriber in &self.subscribers {
            subscriber.stop();
        }
        self.pool.close();
    }
}
