//! Single-flight coordinator: async response cache plus in-flight request
//! map.
//!
//! The two surfaces share nothing but the key space. A key may live in the
//! cache, in the in-flight map, both, or neither. The cache side stamps
//! entries with TTL and an optional stale horizon; the in-flight side lets
//! one originator run a request while any number of joiners await the same
//! broadcast outcome, each free to stop listening without disturbing the
//! flight.
//!
//! A flight whose originator neither settles nor drops its handle stays in
//! the map indefinitely; there is no age-based eviction.

pub mod store;

use crate::clock::Clock;
use crate::error::FetchError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use store::{CacheItem, CacheStore, StoreResult};
use tokio::sync::broadcast;

/// Outcome shared by every participant of one flight.
pub type SharedResult<V> = Result<V, Arc<FetchError>>;

/// Cache lookup outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<V> {
    Miss,
    /// The entry's TTL had lapsed; it has been evicted.
    Expired,
    Hit { value: V, is_stale: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlightStats {
    pub cache_size: usize,
    pub inflight_count: usize,
}

struct FlightEntry<V> {
    tx: broadcast::Sender<SharedResult<V>>,
    waiting: u64,
    #[allow(dead_code)]
    started_at: u64,
    generation: u64,
}

type FlightMap<V> = Arc<Mutex<HashMap<String, FlightEntry<V>>>>;

pub struct SingleFlight<V> {
    store: Arc<dyn CacheStore<V>>,
    clock: Arc<dyn Clock>,
    flights: FlightMap<V>,
    generations: AtomicU64,
}

impl<V> std::fmt::Debug for SingleFlight<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flights = self.flights.lock().unwrap_or_else(|p| p.into_inner());
        f.debug_struct("SingleFlight")
            .field("inflight_count", &flights.len())
            .finish()
    }
}

impl<V: Clone + Send + 'static> SingleFlight<V> {
    pub fn new(store: Arc<dyn CacheStore<V>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            flights: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    // --- cache surface ---

    /// Look a key up, applying expiry. Adapter errors propagate; the
    /// caller decides whether to degrade to a miss.
    pub async fn get_cache(&self, key: &str) -> StoreResult<CacheLookup<V>> {
        let Some(item) = self.store.get(key).await? else {
            return Ok(CacheLookup::Miss);
        };
        let now = self.clock.now_millis();
        if now >= item.expires_at {
            let _ = self.store.delete(key).await;
            return Ok(CacheLookup::Expired);
        }
        let is_stale = item.stale_at.is_some_and(|at| at <= now);
        Ok(CacheLookup::Hit { value: item.value, is_stale })
    }

    /// Store a value with a TTL and optional stale horizon. `stale_in` is
    /// clamped to the TTL so `created_at ≤ stale_at ≤ expires_at` holds.
    pub async fn set_cache(
        &self,
        key: &str,
        value: V,
        ttl: Duration,
        stale_in: Option<Duration>,
    ) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(ttl.as_millis() as u64);
        let stale_at =
            stale_in.map(|d| now.saturating_add(d.as_millis() as u64).min(expires_at));
        self.store
            .set(key, CacheItem { value, created_at: now, expires_at, stale_at })
            .await
    }

    pub async fn delete_cache(&self, key: &str) -> StoreResult<bool> {
        self.store.delete(key).await
    }

    /// Whether the key holds a live (unexpired) entry.
    pub async fn has_cache(&self, key: &str) -> StoreResult<bool> {
        Ok(matches!(self.get_cache(key).await?, CacheLookup::Hit { .. }))
    }

    pub async fn clear_cache(&self) -> StoreResult<()> {
        self.store.clear().await
    }

    pub async fn cache_keys(&self) -> StoreResult<Vec<String>> {
        self.store.keys().await
    }

    pub async fn stats(&self) -> StoreResult<FlightStats> {
        Ok(FlightStats {
            cache_size: self.store.size().await?,
            inflight_count: self.inflight_count(),
        })
    }

    // --- in-flight surface ---

    /// Atomically join the flight for `key`, or become its originator.
    pub fn claim(&self, key: &str) -> Flight<V> {
        let mut flights = self.flights.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = flights.get_mut(key) {
            entry.waiting += 1;
            return Flight::Joiner(JoinedFlight {
                waiting_count: entry.waiting,
                rx: entry.tx.subscribe(),
                _guard: JoinGuard {
                    key: key.to_string(),
                    generation: entry.generation,
                    flights: Arc::clone(&self.flights),
                },
            });
        }

        let (tx, _) = broadcast::channel(1);
        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        flights.insert(
            key.to_string(),
            FlightEntry {
                tx: tx.clone(),
                waiting: 1,
                started_at: self.clock.now_millis(),
                generation,
            },
        );
        Flight::Originator(FlightHandle {
            key: key.to_string(),
            generation,
            tx,
            flights: Arc::clone(&self.flights),
            settled: AtomicBool::new(false),
        })
    }

    pub fn has_inflight(&self, key: &str) -> bool {
        self.flights.lock().unwrap_or_else(|p| p.into_inner()).contains_key(key)
    }

    pub fn inflight_count(&self) -> usize {
        self.flights.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Number of callers attached to the flight, originator included.
    pub fn waiting_count(&self, key: &str) -> Option<u64> {
        self.flights
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .map(|e| e.waiting)
    }
}

/// Result of [`SingleFlight::claim`].
pub enum Flight<V> {
    Originator(FlightHandle<V>),
    Joiner(JoinedFlight<V>),
}

/// Originator's side of a flight. `settle` removes the entry and fans the
/// outcome out to joiners; it is idempotent, and dropping the handle
/// unsettled settles with an abort error so joiners are never stranded.
pub struct FlightHandle<V> {
    key: String,
    generation: u64,
    tx: broadcast::Sender<SharedResult<V>>,
    flights: FlightMap<V>,
    settled: AtomicBool,
}

impl<V> FlightHandle<V> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn settle(&self, result: SharedResult<V>) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut flights = self.flights.lock().unwrap_or_else(|p| p.into_inner());
            if flights.get(&self.key).is_some_and(|e| e.generation == self.generation) {
                flights.remove(&self.key);
            }
        }
        let _ = self.tx.send(result);
    }
}

impl<V> Drop for FlightHandle<V> {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            self.settle(Err(Arc::new(FetchError::aborted("request abandoned"))));
        }
    }
}

/// Joiner's side of a flight.
pub struct JoinedFlight<V> {
    pub waiting_count: u64,
    rx: broadcast::Receiver<SharedResult<V>>,
    _guard: JoinGuard<V>,
}

impl<V: Clone + Send + 'static> JoinedFlight<V> {
    /// Await the originator's outcome. Dropping this future instead
    /// detaches the joiner without touching the flight.
    pub async fn outcome(mut self) -> SharedResult<V> {
        match self.rx.recv().await {
            Ok(result) => result,
            Err(_) => Err(Arc::new(FetchError::aborted("request abandoned"))),
        }
    }
}

struct JoinGuard<V> {
    key: String,
    generation: u64,
    flights: FlightMap<V>,
}

impl<V> Drop for JoinGuard<V> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = flights.get_mut(&self.key) {
            if entry.generation == self.generation {
                entry.waiting = entry.waiting.saturating_sub(1);
            }
        }
    }
}
