use std::time::Duration;

use rand::RngCore;

/// Wire protocol and invalidation style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// RESP2 against a single server; writes publish application-level
    /// notifications, reads are tracked with a redirect to the
    /// process-wide subscriber.
    Resp2,
    /// RESP2 against a cluster front-proxy; one broadcast-tracking
    /// subscriber per master.
    Resp2ClusterProxy,
    /// RESP3; the server pushes invalidations on the data connections
    /// themselves.
    Resp3,
}

/// Configuration shared by the cache types.
#[derive(Debug, Clone)]
pub struct Config {
    /// `host:port` of the server or front-proxy.
    pub server_addr: String,
    /// Seed addresses for topology discovery; cluster-proxy mode only.
    pub cluster_nodes: Vec<String>,
    /// Password for the cluster seeds; discovery and subscribers only.
    pub password: Option<String>,
    pub protocol: Protocol,
    /// Local cache capacity in entries.
    pub cache_size: usize,
    /// TTL applied when a call site passes a zero duration.
    pub cache_ttl: Duration,
    /// Cap on outstanding pool connections.
    pub max_conns: usize,
    /// How long an acquire may wait for a pool permit.
    pub acquire_timeout: Duration,
    /// How long a request may wait for its reply.
    pub response_timeout: Duration,
    /// Identity used to recognize our own notification echoes;
    /// generated when absent.
    pub client_id: Option<Vec<u8>>,
}

pub(crate) const DEFAULT_CACHE_SIZE: usize = 100_000;
pub(crate) const DEFAULT_MAX_CONNS: usize = 50;

impl Default for Config {
    fn default() -> Config {
        Config {
            server_addr: "127.0.0.1:6379".to_string(),
            cluster_nodes: Vec::new(),
            password: None,
            protocol: Protocol::Resp2,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_ttl: Duration::from_secs(60 * 30),
            max_conns: DEFAULT_MAX_CONNS,
            acquire_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            client_id: None,
        }
    }
}

impl Config {
    pub(crate) fn normalized(mut self) -> Config {
        if self.cache_size == 0 {
            self.cache_size = DEFAULT_CACHE_SIZE;
        }
        if self.max_conns == 0 {
            self.max_conns = DEFAULT_MAX_CONNS;
        }
        self
    }

    pub(crate) fn effective_ttl(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.cache_ttl
        } else {
            ttl
        }
    }

    pub(crate) fn client_id_or_generated(&self) -> Vec<u8> {
        self.client_id.clone().unwrap_or_else(gen_token)
    }
}

/// Mints a unique printable token; used for client identities and list
/// op-ids.
pub(crate) fn gen_token() -> Vec<u8> {
    let mut raw = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut raw);
    let mut token = Vec::with_capacity(raw.len() * 2);
    for byte in raw {
        token.extend_from_slice(format!("{byte:02x}").as_bytes());
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_printable() {
        let a = gen_token();
        let b = gen_token();
        assert_eq!(a.len(), 24);
        assert_ne!(a, b);
        assert!(a.iter().all(u8::is_ascii_hexdigit));
    }

    #[test]
    fn zero_ttl_falls_back_to_config() {
        let cfg = Config {
            cache_ttl: Duration::from_secs(7),
            ..Config::default()
        };
        assert_eq!(cfg.effective_ttl(Duration::ZERO), Duration::from_secs(7));
        assert_eq!(
            cfg.effective_ttl(Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
