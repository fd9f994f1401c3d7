use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use log::{debug, error};
use lru::LruCache;

use crate::cluster::Explorer;
use crate::cmd::cmd;
use crate::config::{gen_token, Config, Protocol};
use crate::connection::Handshake;
use crate::errors::{Error, ErrorKind, RimcuResult};
use crate::notif::{ListCmd, ListNotif};
use crate::pool::{Pool, PoolConfig};
use crate::script::Script;
use crate::subscriber::{NotifHandler, NotifSubscriber, SubscriberConfig, LIST_CHANNEL};
use crate::types::Value;

const SCRIPT_RPUSH: &str = r"
redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('publish', 'rimcu:list', ARGV[2])
return 'OK'
";
const SCRIPT_LPOP: &str = r"
local val = redis.call('LPOP', KEYS[1])
redis.call('publish', 'rimcu:list', ARGV[1])
return val
";

/// In-memory replica of one list key.
///
/// Either the entry is clean and the buffer is empty, or it is dirty
/// and the buffer holds everything observed between the local write
/// and its own echo.
struct ListEntry {
    list: Vec<String>,
    dirty: Option<Vec<u8>>,
    buffer: Vec<ListNotif>,
}

fn apply(list: &mut Vec<String>, notif: &ListNotif) {
    match notif.cmd {
        ListCmd::Rpush => list.push(notif.arg.clone()),
        ListCmd::Lpop => {
            if !list.is_empty() {
                list.remove(0);
            }
        }
    }
}

/// The replica table plus the reconciliation protocol that keeps a
/// writer's own operations from being applied twice.
struct ListStore {
    name: Vec<u8>,
    entries: Mutex<LruCache<String, Arc<Mutex<ListEntry>>>>,
}

impl ListStore {
    fn new(name: Vec<u8>, capacity: usize) -> ListStore {
        ListStore {
            name,
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    fn get(&self, key: &str) -> Option<Arc<Mutex<ListEntry>>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Installs server truth, but never overwrites a dirty replica:
    /// that one belongs to the echo-replay protocol until it clears.
    fn prime(&self, key: &str, list: Vec<String>) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) => {
                let mut entry = entry.lock().unwrap();
                if entry.dirty.is_none() {
                    entry.list = list;
                }
            }
            None => {
                let _ = entries.push(
                    key.to_string(),
                    Arc::new(Mutex::new(ListEntry {
                        list,
                        dirty: None,
                        buffer: Vec::new(),
                    })),
                );
            }
        }
    }

    /// Marks the replica dirty for the op; a no-op (returning false)
    /// when the key is not cached, so writes never create entries.
    fn mark_dirty(&self, key: &str, op_id: &[u8]) -> bool {
        match self.get(key) {
            Some(entry) => {
                entry.lock().unwrap().dirty = Some(op_id.to_vec());
                true
            }
            None => false,
        }
    }

    /// Undoes `mark_dirty` after a failed script call by dropping the
    /// replica, but only while the dirty id still matches: a later
    /// write owns the entry otherwise. Dropping (rather than just
    /// clearing) stays correct even when the failure was a lost reply
    /// and the write actually committed.
    fn rollback_dirty(&self, key: &str, op_id: &[u8]) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.peek(key) else {
            return;
        };
        let matches = entry.lock().unwrap().dirty.as_deref() == Some(op_id);
        if matches {
            entries.pop(key);
        }
    }

    /// Subscriber-side processing of one notification.
    fn handle_notif(&self, notif: ListNotif) {
        let Some(entry) = self.get(&notif.key) else {
            return;
        };
        let mut entry = entry.lock().unwrap();
        match entry.dirty.clone() {
            None => {
                if notif.client_id == self.name {
                    // Echo of an own write issued while this key was not
                    // cached; the replica was primed from server state
                    // that already includes it.
                    debug!("skipping own echo for clean key {}", notif.key);
                    return;
                }
                apply(&mut entry.list, &notif);
            }
            Some(dirty_id) => {
                let own_echo = notif.client_id == self.name && notif.op_id == dirty_id;
                if !own_echo {
                    entry.buffer.push(notif);
                    return;
                }
                let buffered = std::mem::take(&mut entry.buffer);
                for queued in &buffered {
                    apply(&mut entry.list, queued);
                }
                apply(&mut entry.list, &notif);
                entry.dirty = None;
            }
        }
    }

    fn purge(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// The replica for `key` when present and clean.
    fn clean_list(&self, key: &str) -> Option<Vec<String>> {
        let entry = self.get(key)?;
        let entry = entry.lock().unwrap();
        entry.dirty.is_none().then(|| entry.list.clone())
    }

    fn local_list(&self, key: &str) -> Option<Vec<String>> {
        let entry = self.get(key)?;
        let entry = entry.lock().unwrap();
        Some(entry.list.clone())
    }
}

struct ListNotifHandler {
    store: Arc<ListStore>,
}

impl NotifHandler for ListNotifHandler {
    fn on_message(&self, _channel: &str, payload: &[u8]) {
        match ListNotif::decode(payload) {
            Ok(notif) => self.store.handle_notif(notif),
            Err(err) => error!("skipping malformed list notification: {err}"),
        }
    }

    fn on_invalidate(&self, _keys: Vec<String>) {}

    fn on_subscribed(&self) {
        self.store.purge();
    }
}

/// Client-side cache for the list data type.
///
/// Reads serve the in-memory replica; every write goes to the server
/// paired with a published notification, and the replica stays dirty
/// until the write's own echo comes back through the subscriber.
pub struct ListCache {
    pool: Pool,
    store: Arc<ListStore>,
    script_rpush: Script,
    script_lpop: Script,
    subscribers: Vec<NotifSubscriber>,
}

impl std::fmt::Debug for ListCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListCache").finish_non_exhaustive()
    }
}

impl ListCache {
    /// Connects the pool and the notification subscribers.
    ///
    /// The list protocol rides on application-level publishes and is
    /// available on the RESP2 transports.
    pub async fn new(cfg: Config) -> RimcuResult<ListCache> {
        let cfg = cfg.normalized();
        if cfg.protocol == Protocol::Resp3 {
            return Err(Error::from((
                ErrorKind::InvalidArgs,
                "the list cache requires a RESP2 transport",
            )));
        }
        let proxy = cfg.protocol == Protocol::Resp2ClusterProxy;
        let name = cfg.client_id_or_generated();
        let store = Arc::new(ListStore::new(name, cfg.cache_size));
        let handler: Arc<dyn NotifHandler> = Arc::new(ListNotifHandler {
            store: Arc::clone(&store),
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
                    channels: vec![LIST_CHANNEL.to_string()],
                    track_invalidations: false,
                    bcast_tracking: false,
                    response_timeout: cfg.response_timeout,
                },
                Arc::clone(&handler),
            ));
        }
        for subscriber in &subscribers {
            subscriber.wait_ready(cfg.response_timeout).await?;
        }

        let pool = Pool::new(PoolConfig {
            server_addr: cfg.server_addr.clone(),
            max_conns: cfg.max_conns,
            acquire_timeout: cfg.acquire_timeout,
            response_timeout: cfg.response_timeout,
            handshake: Handshake::Resp2 { redirect: None },
            invalidations: None,
            on_destroyed: None,
        });

        Ok(ListCache {
            pool,
            store,
            script_rpush: Script::new(SCRIPT_RPUSH),
            script_lpop: Script::new(SCRIPT_LPOP),
            subscribers,
        })
    }

    /// Appends `val` at the tail of the list stored at `key`.
    pub async fn rpush(&self, key: &str, val: &str) -> RimcuResult<()> {
        let op_id = gen_token();
        let notif =
            ListNotif::new(&self.store.name, op_id.clone(), ListCmd::Rpush, key, val).encode()?;
        let mut conn = self.pool.acquire().await?;
        let marked = self.store.mark_dirty(key, &op_id);
        let result = self
            .script_rpush
            .invoke(
                &mut conn,
                &[key.as_bytes().to_vec()],
                &[val.as_bytes().to_vec(), notif],
            )
            .await;
        match result {
            Ok(reply) => reply.into_status(),
            Err(err) => {
                if marked {
                    self.store.rollback_dirty(key, &op_id);
                }
                Err(err)
            }
        }
    }

    /// Removes and returns the head of the list stored at `key`.
    pub async fn lpop(&self, key: &str) -> RimcuResult<Option<String>> {
        let op_id = gen_token();
        let notif =
            ListNotif::new(&self.store.name, op_id.clone(), ListCmd::Lpop, key, "").encode()?;
        let mut conn = self.pool.acquire().await?;
        let marked = self.store.mark_dirty(key, &op_id);
        let result = self
            .script_lpop
            .invoke(&mut conn, &[key.as_bytes().to_vec()], &[notif])
            .await;
        match result {
            Ok(Value::Nil) => Ok(None),
            Ok(reply) => Ok(Some(reply.into_string()?)),
            Err(err) => {
                if marked {
                    self.store.rollback_dirty(key, &op_id);
                }
                Err(err)
            }
        }
    }

    /// Returns the whole list.
    ///
    /// Serves the replica when it is present and clean; otherwise asks
    /// the server, which is the ordering authority while a write is in
    /// flight.
    pub async fn get(&self, key: &str) -> RimcuResult<Vec<String>> {
        if let Some(list) = self.store.clean_list(key) {
            return Ok(list);
        }
        let mut conn = self.pool.acquire().await?;
        let list = conn
            .do_cmd(&cmd("LRANGE").arg(key).arg(0u64).arg("-1"))
            .await?
            .into_string_vec()?;
        self.store.prime(key, list.clone());
        Ok(list)
    }

    /// Releases the pool and the subscribers.
    pub fn close(&self) {
        for subscriber in &self.subscribers {
            subscriber.stop();
        }
        self.pool.close();
    }

    /// The local replica for `key`, dirty or not.
    #[doc(hidden)]
    pub fn local_list(&self, key: &str) -> Option<Vec<String>> {
        self.store.local_list(key)
    }
}
