use salon_chat::business::{BusinessDataCache, BusinessDataSource, StaticBusinessData};
use salon_chat::config::CacheConfig;
use salon_chat::{ChatError, ChatResult, TenantKey};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, sleep};
use std::time::Duration;

/// Counts upstream calls; can be switched to failing and slowed down.
struct CountingSource {
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Duration,
}

impl CountingSource {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BusinessDataSource for CountingSource {
    fn fetch(&self, tenant: &TenantKey) -> ChatResult<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        sleep(self.delay);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChatError::DataUnavailable {
                tenant: tenant.to_string(),
                reason: "upstream returned 503".into(),
            });
        }
        Ok(json!({ "tenant": tenant.as_str(), "version": call, "pricing": "https://example.test/preise" }))
    }
}

fn config(ttl_ms: u64) -> CacheConfig {
    CacheConfig {
        default_ttl_ms: ttl_ms,
        coalesce_wait_ms: 2_000,
    }
}

#[test]
fn live_snapshot_is_served_from_cache() {
    let source = CountingSource::new(Duration::ZERO);
    let cache = BusinessDataCache::new(source.clone(), config(60_000));
    let tenant = TenantKey::new("eunoia");

    let first = cache.get(&tenant).expect("first");
    let second = cache.get(&tenant).expect("second");
    assert!(!first.stale && !second.stale);
    assert_eq!(first.snapshot.payload["version"], 1);
    assert_eq!(second.snapshot.payload["version"], 1);
    assert_eq!(source.calls(), 1);
}

#[test]
fn expired_snapshot_triggers_refresh() {
    let source = CountingSource::new(Duration::ZERO);
    let cache = BusinessDataCache::new(source.clone(), config(50));
    let tenant = TenantKey::new("eunoia");

    cache.get(&tenant).expect("first");
    sleep(Duration::from_millis(80));
    let refreshed = cache.get(&tenant).expect("refreshed");
    assert!(!refreshed.stale);
    assert_eq!(refreshed.snapshot.payload["version"], 2);
    assert!(refreshed.snapshot.age() < refreshed.snapshot.ttl);
}

#[test]
fn failed_refresh_serves_previous_snapshot_marked_stale() {
    let source = CountingSource::new(Duration::ZERO);
    let cache = BusinessDataCache::new(source.clone(), config(50));
    let tenant = TenantKey::new("eunoia");

    cache.get(&tenant).expect("first");
    source.failing.store(true, Ordering::SeqCst);
    sleep(Duration::from_millis(80));

    let served = cache.get(&tenant).expect("stale fallback");
    assert!(served.stale);
    assert_eq!(served.snapshot.payload["version"], 1);
    assert!(served.snapshot.age() >= served.snapshot.ttl);
    assert_eq!(source.calls(), 2, "a refresh must be attempted before serving stale data");
}

#[test]
fn failed_refresh_without_snapshot_is_data_unavailable() {
    let cache = BusinessDataCache::new(Arc::new(StaticBusinessData::new()), config(1_000));
    let err = cache
        .get(&TenantKey::new("waxbaby"))
        .expect_err("no data at all");
    assert!(err.is_data_unavailable());
}

#[test]
fn invalidate_forces_next_get_to_refresh() {
    let source = CountingSource::new(Duration::ZERO);
    let cache = BusinessDataCache::new(source.clone(), config(60_000));
    let tenant = TenantKey::new("eunoia");

    cache.get(&tenant).expect("first");
    assert!(cache.invalidate(&tenant));
    assert!(!cache.invalidate(&tenant));
    assert_eq!(cache.get(&tenant).expect("second").snapshot.payload["version"], 2);
}

#[test]
fn concurrent_refreshes_coalesce_into_one_fetch() {
    let source = CountingSource::new(Duration::from_millis(150));
    let cache = Arc::new(BusinessDataCache::new(source.clone(), config(60_000)));
    let tenant = TenantKey::new("eunoia");
    let callers = 16;
    let barrier = Arc::new(Barrier::new(callers));

    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let tenant = tenant.clone();
            thread::spawn(move || {
                barrier.wait();
                cache.refresh(&tenant)
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("caller thread").expect("refresh"))
        .collect();

    assert_eq!(source.calls(), 1);
    for snapshot in &results {
        assert!(Arc::ptr_eq(snapshot, &results[0]));
    }
}

#[test]
fn coalesced_waiters_share_the_failure() {
    let source = CountingSource::new(Duration::from_millis(150));
    source.failing.store(true, Ordering::SeqCst);
    let cache = Arc::new(BusinessDataCache::new(source.clone(), config(60_000)));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.get(&TenantKey::new("waxbaby"))
            })
        })
        .collect();

    for handle in handles {
        let err = handle
            .join()
            .expect("caller thread")
            .expect_err("no snapshot to fall back on");
        assert!(err.is_data_unavailable());
    }
    assert_eq!(source.calls(), 1);
}

#[test]
fn different_tenants_refresh_in_parallel() {
    let source = CountingSource::new(Duration::from_millis(200));
    let cache = Arc::new(BusinessDataCache::new(source.clone(), config(60_000)));
    let started = std::time::Instant::now();

    let handles: Vec<_> = ["eunoia", "waxbaby"]
        .into_iter()
        .map(|tenant| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get(&TenantKey::new(tenant)).map(|s| s.stale))
        })
        .collect();
    for handle in handles {
        let stale = handle.join().expect("thread").expect("served");
        assert!(!stale);
    }

    assert_eq!(source.calls(), 2);
    assert!(started.elapsed() < Duration::from_millis(395));
}

#[test]
fn waiter_gives_up_after_coalesce_wait() {
    let source = CountingSource::new(Duration::from_millis(400));
    let cache = Arc::new(BusinessDataCache::new(
        source.clone(),
        CacheConfig {
            default_ttl_ms: 60_000,
            coalesce_wait_ms: 50,
        },
    ));
    let tenant = TenantKey::new("eunoia");

    let leader = {
        let cache = Arc::clone(&cache);
        let tenant = tenant.clone();
        thread::spawn(move || cache.refresh(&tenant))
    };
    sleep(Duration::from_millis(100));

    let err = cache.refresh(&tenant).expect_err("waiter times out");
    assert_eq!(
        err,
        ChatError::RefreshCoalesceTimeout {
            tenant: "eunoia".into()
        }
    );
    assert!(err.is_data_unavailable());
    leader.join().expect("leader").expect("leader refresh");
    assert_eq!(source.calls(), 1);
}

#[test]
fn tenant_ttl_override_applies() {
    use salon_chat::config::{TenantConfig, TenantRegistry};

    let registry = TenantRegistry::new([
        TenantConfig::new("eunoia", "EUNOIA", "Noia", "de").with_data_ttl(Duration::from_millis(40)),
        TenantConfig::new("waxbaby", "WAX! Baby", "Waxi", "de"),
    ]);
    let cache = BusinessDataCache::new(CountingSource::new(Duration::ZERO), config(60_000))
        .with_tenants(&registry);

    assert_eq!(cache.ttl_for(&TenantKey::new("eunoia")), Duration::from_millis(40));
    assert_eq!(cache.ttl_for(&TenantKey::new("waxbaby")), Duration::from_secs(60));
}
