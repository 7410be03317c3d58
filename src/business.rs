//! Cached business data with single-flight refresh per tenant.

use crate::config::{CacheConfig, TenantRegistry};
use crate::error::{data_unavailable, ChatError, ChatResult};
use crate::model::TenantKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Upstream provider of a tenant's services, prices, hours and location.
pub trait BusinessDataSource: Send + Sync + 'static {
    fn fetch(&self, tenant: &TenantKey) -> ChatResult<Value>;
}

/// Fixed payloads per tenant, for deployments that ship business data with
/// their configuration and for tests.
#[derive(Clone, Debug, Default)]
pub struct StaticBusinessData {
    payloads: HashMap<TenantKey, Value>,
}

impl StaticBusinessData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>, payload: Value) -> Self {
        self.payloads.insert(TenantKey::new(tenant), payload);
        self
    }
}

impl BusinessDataSource for StaticBusinessData {
    fn fetch(&self, tenant: &TenantKey) -> ChatResult<Value> {
        self.payloads
            .get(tenant)
            .cloned()
            .ok_or_else(|| data_unavailable(tenant.as_str(), "no business data configured"))
    }
}

/// One successful fetch, replaced as a whole on the next refresh.
#[derive(Clone, Debug, PartialEq)]
pub struct BusinessSnapshot {
    pub tenant: TenantKey,
    pub payload: Value,
    pub fetched_at: OffsetDateTime,
    fetched_instant: Instant,
    pub ttl: Duration,
}

impl BusinessSnapshot {
    fn new(tenant: TenantKey, payload: Value, ttl: Duration) -> Self {
        Self {
            tenant,
            payload,
            fetched_at: OffsetDateTime::now_utc(),
            fetched_instant: Instant::now(),
            ttl,
        }
    }

    pub fn age(&self) -> Duration {
        self.fetched_instant.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.age() < self.ttl
    }
}

/// A snapshot as handed to a turn, tagged when it outlived its TTL.
#[derive(Clone, Debug, PartialEq)]
pub struct ServedSnapshot {
    pub snapshot: Arc<BusinessSnapshot>,
    pub stale: bool,
}

type FlightOutcome = ChatResult<Arc<BusinessSnapshot>>;

/// A refresh other callers can wait on.
struct Flight {
    outcome: Mutex<Option<FlightOutcome>>,
    done: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn publish(&self, outcome: FlightOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.done.notify_all();
    }

    fn wait(&self, limit: Duration) -> Option<FlightOutcome> {
        let deadline = Instant::now() + limit;
        let mut slot = self.outcome.lock();
        while slot.is_none() {
            if self.done.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }
}

/// Publishes a failure and clears the registry if the leader unwinds.
struct FlightGuard<'a> {
    cache: &'a BusinessDataCache,
    tenant: &'a TenantKey,
    flight: Arc<Flight>,
}

impl FlightGuard<'_> {
    fn finish(self, outcome: FlightOutcome) -> FlightOutcome {
        self.flight.publish(outcome.clone());
        outcome
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.publish(Err(data_unavailable(
            self.tenant.as_str(),
            "refresh aborted",
        )));
        let flight = &self.flight;
        self.cache
            .in_flight
            .remove_if(self.tenant, |_, current| Arc::ptr_eq(current, flight));
    }
}

/// Tenant business data cache.
///
/// Live snapshots are served directly. Expired or missing ones trigger a
/// synchronous refresh; concurrent refreshes for one tenant share a single
/// upstream fetch. A failed refresh falls back to the previous snapshot,
/// marked stale.
pub struct BusinessDataCache {
    source: Arc<dyn BusinessDataSource>,
    snapshots: DashMap<TenantKey, Arc<BusinessSnapshot>>,
    in_flight: DashMap<TenantKey, Arc<Flight>>,
    ttls: HashMap<TenantKey, Duration>,
    config: CacheConfig,
}

impl BusinessDataCache {
    pub fn new(source: Arc<dyn BusinessDataSource>, config: CacheConfig) -> Self {
        Self {
            source,
            snapshots: DashMap::new(),
            in_flight: DashMap::new(),
            ttls: HashMap::new(),
            config,
        }
    }

    /// Applies each tenant's TTL override.
    pub fn with_tenants(mut self, tenants: &TenantRegistry) -> Self {
        for key in tenants.keys() {
            if let Ok(tenant) = tenants.get(key) {
                self.ttls.insert(key.clone(), tenant.data_ttl(&self.config));
            }
        }
        self
    }

    pub fn ttl_for(&self, tenant: &TenantKey) -> Duration {
        self.ttls
            .get(tenant)
            .copied()
            .unwrap_or_else(|| self.config.default_ttl())
    }

    /// Returns the cached snapshot without refreshing, live or not.
    pub fn peek(&self, tenant: &TenantKey) -> Option<Arc<BusinessSnapshot>> {
        self.snapshots.get(tenant).map(|entry| Arc::clone(entry.value()))
    }

    /// Drops the snapshot so the next [`get`](Self::get) refreshes.
    pub fn invalidate(&self, tenant: &TenantKey) -> bool {
        let removed = self.snapshots.remove(tenant).is_some();
        if removed {
            tracing::info!(tenant = %tenant, "business data invalidated");
        }
        removed
    }

    /// Returns a live snapshot, refreshing when it is missing or expired.
    pub fn get(&self, tenant: &TenantKey) -> ChatResult<ServedSnapshot> {
        if let Some(snapshot) = self.peek(tenant).filter(|s| s.is_live()) {
            return Ok(ServedSnapshot {
                snapshot,
                stale: false,
            });
        }

        match self.load(tenant, true) {
            Ok(snapshot) => Ok(ServedSnapshot {
                snapshot,
                stale: false,
            }),
            Err(err) => match self.peek(tenant) {
                Some(previous) => {
                    tracing::warn!(
                        tenant = %tenant,
                        age_ms = previous.age().as_millis() as u64,
                        error = %err,
                        "serving stale business data"
                    );
                    Ok(ServedSnapshot {
                        stale: !previous.is_live(),
                        snapshot: previous,
                    })
                }
                None => Err(match err {
                    ChatError::RefreshCoalesceTimeout { .. } | ChatError::DataUnavailable { .. } => {
                        err
                    }
                    other => data_unavailable(tenant.as_str(), other.to_string()),
                }),
            },
        }
    }

    /// Fetches from the source and replaces the stored snapshot.
    ///
    /// Callers arriving while a refresh for the same tenant is running wait
    /// for it and receive its result.
    pub fn refresh(&self, tenant: &TenantKey) -> ChatResult<Arc<BusinessSnapshot>> {
        self.load(tenant, false)
    }

    /// Single-flight fetch. With `reuse_live`, a leader that finds a live
    /// snapshot (stored by a flight that finished after the caller peeked)
    /// returns it instead of fetching again.
    fn load(&self, tenant: &TenantKey, reuse_live: bool) -> ChatResult<Arc<BusinessSnapshot>> {
        let (flight, leader) = match self.in_flight.entry(tenant.clone()) {
            Entry::Occupied(occ) => (Arc::clone(occ.get()), false),
            Entry::Vacant(vac) => {
                let flight = Arc::new(Flight::new());
                vac.insert(Arc::clone(&flight));
                (flight, true)
            }
        };

        if !leader {
            tracing::debug!(tenant = %tenant, "joining in-flight refresh");
            return match flight.wait(self.config.coalesce_wait()) {
                Some(outcome) => outcome,
                None => Err(ChatError::RefreshCoalesceTimeout {
                    tenant: tenant.to_string(),
                }),
            };
        }

        let guard = FlightGuard {
            cache: self,
            tenant,
            flight,
        };
        if reuse_live {
            if let Some(snapshot) = self.peek(tenant).filter(|s| s.is_live()) {
                return guard.finish(Ok(snapshot));
            }
        }
        let outcome = self.fetch(tenant);
        guard.finish(outcome)
    }

    fn fetch(&self, tenant: &TenantKey) -> FlightOutcome {
        let started = Instant::now();
        match self.source.fetch(tenant) {
            Ok(payload) => {
                let snapshot = Arc::new(BusinessSnapshot::new(
                    tenant.clone(),
                    payload,
                    self.ttl_for(tenant),
                ));
                self.snapshots.insert(tenant.clone(), Arc::clone(&snapshot));
                tracing::info!(
                    tenant = %tenant,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "business data refreshed"
                );
                Ok(snapshot)
            }
            Err(err) => {
                tracing::warn!(tenant = %tenant, error = %err, "business data refresh failed");
                Err(err)
            }
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_source::RedisBusinessData;

#[cfg(feature = "redis")]
mod redis_source {
    use super::BusinessDataSource;
    use crate::error::{data_unavailable, ChatResult};
    use crate::model::TenantKey;
    use redis::{Client, Commands, Connection};
    use serde_json::{Map, Value};
    use std::collections::HashMap;

    const DEFAULT_NAMESPACE: &str = "salon:business";

    /// Reads a tenant's business data from Redis keys under
    /// `{namespace}:{tenant}:*`.
    ///
    /// List keys: `services`, `promotions`. Hash keys: `contact_info`,
    /// `additional_info`. String keys: `pricing`, `opening_hours`, `booking`.
    pub struct RedisBusinessData {
        client: Client,
        namespace: String,
    }

    impl RedisBusinessData {
        pub fn from_url(url: impl AsRef<str>) -> ChatResult<Self> {
            Self::from_url_with_namespace(url, DEFAULT_NAMESPACE)
        }

        pub fn from_url_with_namespace(
            url: impl AsRef<str>,
            namespace: impl Into<String>,
        ) -> ChatResult<Self> {
            let client = Client::open(url.as_ref())
                .map_err(|err| data_unavailable("-", err.to_string()))?;
            Ok(Self {
                client,
                namespace: namespace.into(),
            })
        }

        fn key(&self, tenant: &TenantKey, field: &str) -> String {
            format!("{}:{}:{}", self.namespace, tenant.as_str(), field)
        }

        fn read(&self, conn: &mut Connection, tenant: &TenantKey) -> redis::RedisResult<Value> {
            let mut payload = Map::new();
            for field in ["services", "promotions"] {
                let items: Vec<String> = conn.lrange(self.key(tenant, field), 0, -1)?;
                if !items.is_empty() {
                    payload.insert(field.into(), Value::from(items));
                }
            }
            for field in ["contact_info", "additional_info"] {
                let entries: HashMap<String, String> = conn.hgetall(self.key(tenant, field))?;
                if !entries.is_empty() {
                    let object = entries
                        .into_iter()
                        .map(|(k, v)| (k, Value::String(v)))
                        .collect::<Map<_, _>>();
                    payload.insert(field.into(), Value::Object(object));
                }
            }
            for field in ["pricing", "opening_hours", "booking"] {
                let value: Option<String> = conn.get(self.key(tenant, field))?;
                if let Some(value) = value {
                    payload.insert(field.into(), Value::String(value));
                }
            }
            Ok(Value::Object(payload))
        }
    }

    impl BusinessDataSource for RedisBusinessData {
        fn fetch(&self, tenant: &TenantKey) -> ChatResult<Value> {
            let unavailable = |err: redis::RedisError| data_unavailable(tenant.as_str(), err.to_string());
            let mut conn = self.client.get_connection().map_err(unavailable)?;
            let payload = self.read(&mut conn, tenant).map_err(unavailable)?;
            if payload.as_object().is_some_and(Map::is_empty) {
                return Err(data_unavailable(tenant.as_str(), "no business keys found"));
            }
            Ok(payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn static_source_reports_missing_tenant() {
        let source = StaticBusinessData::new().with_tenant("eunoia", json!({"services": []}));
        assert!(source.fetch(&TenantKey::new("eunoia")).is_ok());
        let err = source
            .fetch(&TenantKey::new("waxbaby"))
            .expect_err("missing tenant");
        assert!(err.is_data_unavailable());
    }

    struct Counting {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl BusinessDataSource for Counting {
        fn fetch(&self, _tenant: &TenantKey) -> ChatResult<Value> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(json!({ "opening_hours": "Mo-Fr 10-19" }))
        }
    }

    #[test]
    fn leader_reuses_snapshot_stored_after_peek() {
        let source = Arc::new(Counting {
            calls: Default::default(),
        });
        let cache = BusinessDataCache::new(source.clone(), CacheConfig::default());
        let tenant = TenantKey::new("eunoia");
        let first = cache.refresh(&tenant).expect("first fetch");

        // A caller that peeked before `first` was stored still becomes leader.
        let reused = cache.load(&tenant, true).expect("reused");
        assert!(Arc::ptr_eq(&first, &reused));
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let forced = cache.refresh(&tenant).expect("forced");
        assert!(!Arc::ptr_eq(&first, &forced));
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn flight_wait_times_out_without_publish() {
        let flight = Flight::new();
        assert!(flight.wait(Duration::from_millis(10)).is_none());
        flight.publish(Err(ChatError::InvalidInput("x".into())));
        assert!(flight.wait(Duration::from_millis(10)).is_some());
    }
}
