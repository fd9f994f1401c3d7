mod support;

use std::time::Duration;

use rimcu::{Config, Protocol, StringsCache};
use support::{wait_until, MockRedis};

const TTL: Duration = Duration::from_secs(1000);
const SETTLE: Duration = Duration::from_secs(2);

fn config(addr: String) -> Config {
    Config {
        server_addr: addr,
        protocol: Protocol::Resp3,
        cache_size: 10_000,
        acquire_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[tokio::test]
async fn tracking_push_invalidates_the_reader() {
    let server = MockRedis::start().await;
    let c1 = StringsCache::new(config(server.addr())).await.unwrap();
    let c2 = StringsCache::new(config(server.addr())).await.unwrap();

    c1.setex("k", b"v1", TTL).await.unwrap();

    // c2 reads over its tracking connection; the server remembers.
    assert_eq!(c2.get("k", TTL).await.unwrap().string().unwrap(), "v1");
    assert!(c2.contains_local("k"));

    // The next write pushes an invalidation to c2.
    c1.setex("k", b"v2", TTL).await.unwrap();
    assert!(wait_until(SETTLE, || !c2.contains_local("k")).await);
    assert_eq!(c2.get("k", TTL).await.unwrap().string().unwrap(), "v2");
}

#[tokio::test]
async fn writes_do_not_prime_without_a_read() {
    let server = MockRedis::start().await;
    let c1 = StringsCache::new(config(server.addr())).await.unwrap();

    // Only reads establish tracking coverage, so only reads populate
    // the replica.
    c1.setex("k", b"v1", TTL).await.unwrap();
    assert!(!c1.contains_local("k"));
    assert!(!c1.get("k", TTL).await.unwrap().from_local_cache());
    assert!(c1.get("k", TTL).await.unwrap().from_local_cache());
}

#[tokio::test]
async fn delete_removes_local_and_remote() {
    let server = MockRedis::start().await;
    let c1 = StringsCache::new(config(server.addr())).await.unwrap();
    let c2 = StringsCache::new(config(server.addr())).await.unwrap();

    c1.setex("k", b"v1", TTL).await.unwrap();
    assert_eq!(c2.get("k", TTL).await.unwrap().string().unwrap(), "v1");

    // c1 reads too, so the delete's push must reach it.
    assert_eq!(c1.get("k", TTL).await.unwrap().string().unwrap(), "v1");
    assert!(c1.contains_local("k"));

    c2.del("k").await.unwrap();
    assert!(!c2.contains_local("k"));
    assert_eq!(server.raw_get("k"), None);
    assert!(wait_until(SETTLE, || !c1.contains_local("k")).await);
    assert!(c1.get("k", TTL).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn mget_primes_and_tracks() {
    let server = MockRedis::start().await;
    let c1 = StringsCache::new(config(server.addr())).await.unwrap();
    let c2 = StringsCache::new(config(server.addr())).await.unwrap();

    c1.mset(&[("a", b"1".as_slice()), ("b", b"2".as_slice())])
        .await
        .unwrap();

    let vals = c2.mget(&["a", "b"], TTL).await.unwrap();
    assert!(vals.iter().all(Option::is_some));
    assert!(c2.contains_local("a") && c2.contains_local("b"));
}
