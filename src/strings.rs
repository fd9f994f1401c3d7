use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Config, Protocol};
use crate::errors::{Error, ErrorKind, RimcuResult};
use crate::strings_resp2::StringsCacheResp2;
use crate::strings_resp3::StringsCacheResp3;

/// Result of a strings read, with coercions mirroring the server's
/// loose typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringsResult {
    val: Vec<u8>,
    from_local: bool,
}

impl StringsResult {
    pub(crate) fn local(val: Vec<u8>) -> StringsResult {
        StringsResult {
            val,
            from_local: true,
        }
    }

    pub(crate) fn remote(val: Vec<u8>) -> StringsResult {
        StringsResult {
            val,
            from_local: false,
        }
    }

    /// The raw value.
    pub fn bytes(&self) -> &[u8] {
        &self.val
    }

    /// The value as owned bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.val
    }

    /// The value as a string.
    pub fn string(&self) -> RimcuResult<String> {
        String::from_utf8(self.val.clone())
            .map_err(|_| Error::from((ErrorKind::UnexpectedReturnType, "value is not utf-8")))
    }

    /// The value parsed as an integer.
    pub fn as_i64(&self) -> RimcuResult<i64> {
        std::str::from_utf8(&self.val)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| Error::from((ErrorKind::UnexpectedReturnType, "value is not an integer")))
    }

    /// The value parsed as a boolean (`0`/`1`, `true`/`false`).
    pub fn as_bool(&self) -> RimcuResult<bool> {
        match self.val.as_slice() {
            b"1" | b"true" => Ok(true),
            b"0" | b"false" => Ok(false),
            _ => Err(Error::from((
                ErrorKind::UnexpectedReturnType,
                "value is not a boolean",
            ))),
        }
    }

    /// True when the read was served from the local replica.
    pub fn from_local_cache(&self) -> bool {
        self.from_local
    }
}

/// The engine capability set; one variant per protocol.
#[async_trait]
pub(crate) trait StringsEngine: Send + Sync {
    async fn setex(&self, key: &str, val: &[u8], ttl: Duration) -> RimcuResult<()>;
    async fn get(&self, key: &str, ttl: Duration) -> RimcuResult<StringsResult>;
    async fn del(&self, key: &str) -> RimcuResult<()>;
    async fn append(&self, key: &str, val: &[u8]) -> RimcuResult<()>;
    async fn mset(&self, pairs: &[(&str, &[u8])]) -> RimcuResult<()>;
    async fn mget(&self, keys: &[&str], ttl: Duration)
        -> RimcuResult<Vec<Option<StringsResult>>>;
    fn contains_local(&self, key: &str) -> bool;
    fn close(&self);
}

/// Client-side cache for the strings data type.
///
/// A thin dispatcher over the protocol engine selected by
/// [`Config::protocol`]; every engine keeps the local replica coherent
/// with the server within the documented staleness bounds.
pub struct StringsCache {
    engine: Box<dyn StringsEngine>,
}

impl StringsCache {
    /// Connects the engine, its pool and its invalidation subscribers.
    pub async fn new(cfg: Config) -> RimcuResult<StringsCache> {
        let cfg = cfg.normalized();
        let engine: Box<dyn StringsEngine> = match cfg.protocol {
            Protocol::Resp2 | Protocol::Resp2ClusterProxy => {
                Box::new(StringsCacheResp2::new(cfg).await?)
            }
            Protocol::Resp3 => Box::new(StringsCacheResp3::new(cfg).await?),
        };
        Ok(StringsCache { engine })
    }

    /// Sets `key` to `val` with the given expiry, invalidating the
    /// key's replicas in all cooperating processes.
    ///
    /// A zero `ttl` falls back to the configured default.
    pub async fn setex(&self, key: &str, val: &[u8], ttl: Duration) -> RimcuResult<()> {
        self.engine.setex(key, val, ttl).await
    }

    /// Gets the value of `key`, reading the server only on a local
    /// miss; a fetched value is cached with the given expiry.
    pub async fn get(&self, key: &str, ttl: Duration) -> RimcuResult<StringsResult> {
        self.engine.get(key, ttl).await
    }

    /// Deletes `key` locally and on the server.
    pub async fn del(&self, key: &str) -> RimcuResult<()> {
        self.engine.del(key).await
    }

    /// Appends `val` to the string at `key`.
    pub async fn append(&self, key: &str, val: &[u8]) -> RimcuResult<()> {
        self.engine.append(key, val).await
    }

    /// Sets several keys at once.
    pub async fn mset(&self, pairs: &[(&str, &[u8])]) -> RimcuResult<()> {
        self.engine.mset(pairs).await
    }

    /// Gets several keys at once; the result aligns with `keys` and
    /// holds `None` for absent ones.
    pub async fn mget(
        &self,
        keys: &[&str],
        ttl: Duration,
    ) -> RimcuResult<Vec<Option<StringsResult>>> {
        self.engine.mget(keys, ttl).await
    }

    /// Releases the pool and the subscribers.
    pub fn close(&self) {
        self.engine.close();
    }

    /// Whether the local replica currently holds `key`.
    #[doc(hidden)]
    pub fn contains_local(&self, key: &str) -> bool {
        self.engine.contains_local(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_coercions() {
        let res = StringsResult::remote(b"42".to_vec());
        assert_eq!(res.as_i64().unwrap(), 42);
        assert!(!res.from_local_cache());
        assert!(StringsResult::local(b"1".to_vec()).as_bool().unwrap());
        assert!(!StringsResult::local(b"false".to_vec()).as_bool().unwrap());
        assert!(StringsResult::local(b"x".to_vec()).as_bool().is_err());
        assert_eq!(res.string().unwrap(), "42");
    }
}
