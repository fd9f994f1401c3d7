use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;

use crate::connection::{Conn, Handshake, InvalidationSink};
use crate::errors::{Error, ErrorKind, RimcuResult};

/// Hook invoked with the client id of every connection the pool
/// destroys, so caches can drop entries that lost tracking coverage.
pub(crate) type DestroyHook = Arc<dyn Fn(i64) + Send + Sync>;

pub(crate) struct PoolConfig {
    pub(crate) server_addr: String,
    pub(crate) max_conns: usize,
    pub(crate) acquire_timeout: Duration,
    pub(crate) response_timeout: Duration,
    pub(crate) handshake: Handshake,
    pub(crate) invalidations: Option<Arc<dyn InvalidationSink>>,
    pub(crate) on_destroyed: Option<DestroyHook>,
}

/// A bounded pool of connections.
///
/// The cap is on outstanding connections, in-flight plus idle: a permit
/// is taken before an idle connection is popped or a new one dialed,
/// which bounds server-side load symmetrically.
#[derive(Clone)]
pub(crate) struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    cfg: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Conn>>,
    closed: AtomicBool,
}

impl Pool {
    pub(crate) fn new(cfg: PoolConfig) -> Pool {
        let permits = cfg.max_conns.max(1);
        Pool {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(permits)),
                idle: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                cfg,
            }),
        }
    }

    /// Borrows a connection, dialing a fresh one when the idle list is
    /// empty. Fails with `PoolExhausted` when no permit frees up before
    /// the acquire deadline.
    pub(crate) async fn acquire(&self) -> RimcuResult<PooledConn> {
        let inner = &self.inner;
        let permit = match time::timeout(
            inner.cfg.acquire_timeout,
            Arc::clone(&inner.semaphore).acquire_owned(),
        )
        .await
        {
            Err(_) => {
                return Err(Error::from((
                    ErrorKind::PoolExhausted,
                    "no connection permit before the deadline",
                )))
            }
            Ok(Err(_)) => {
                return Err(Error::from((ErrorKind::ConnectionClosed, "pool is closed")))
            }
            Ok(Ok(permit)) => permit,
        };

        // Stale idle connections (reader gone, poisoned) are culled here.
        loop {
            let candidate = inner.idle.lock().unwrap().pop();
            match candidate {
                Some(conn) if conn.is_reusable() => {
                    return Ok(PooledConn {
                        conn: Some(conn),
                        inner: Arc::clone(inner),
                        _permit: permit,
                    })
                }
                Some(conn) => inner.destroy(conn),
                None => break,
            }
        }

        // The permit is returned automatically when the dial fails.
        let conn = Conn::connect(
            &inner.cfg.server_addr,
            inner.cfg.handshake.clone(),
            inner.cfg.invalidations.clone(),
            inner.cfg.response_timeout,
        )
        .await?;
        Ok(PooledConn {
            conn: Some(conn),
            inner: Arc::clone(inner),
            _permit: permit,
        })
    }

    /// Destroys all idle connections and fails pending acquires.
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();
        let idle = std::mem::take(&mut *self.inner.idle.lock().unwrap());
        for conn in idle {
            self.inner.destroy(conn);
        }
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }
}

impl PoolInner {
    fn destroy(&self, conn: Conn) {
        if let Some(hook) = &self.cfg.on_destroyed {
            hook(conn.client_id());
        }
        drop(conn);
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for conn in self.idle.get_mut().unwrap().drain(..) {
            if let Some(hook) = &self.cfg.on_destroyed {
                hook(conn.client_id());
            }
        }
    }
}

/// An exclusively borrowed connection.
///
/// Returned to the idle list on drop; a poisoned or still-in-flight
/// connection (the caller's future was dropped mid-request) is
/// destroyed instead, since its reply slot has no consumer.
pub(crate) struct PooledConn {
    conn: Option<Conn>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish_non_exhaustive()
    }
}

impl Deref for PooledConn {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Conn {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.inner.closed.load(Ordering::SeqCst) || !conn.is_reusable() {
            self.inner.destroy(conn);
        } else {
            self.inner.idle.lock().unwrap().push(conn);
        }
    }
}
