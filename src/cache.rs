//! Response cache with in-flight request deduplication.
//!
//! Entries live for a fixed time-to-live. While a request for a key is running,
//! further callers for the same key join it and receive a clone of its result
//! instead of issuing their own request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default entry lifetime (5 minutes)
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Time source for expiry checks
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by `Instant::now`
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Counters describing how lookups were served
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub joins: u64,
    pub misses: u64,
}

struct Entry<T> {
    value: T,
    stored_at: Instant,
}

enum FlightState<T, E> {
    Running,
    Done(Result<T, E>),
    Abandoned,
}

/// A request currently being produced for one key
struct InFlight<T, E> {
    state: Mutex<FlightState<T, E>>,
    done: Condvar,
}

impl<T: Clone, E: Clone> InFlight<T, E> {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Running),
            done: Condvar::new(),
        }
    }

    fn publish(&self, state: FlightState<T, E>) {
        *lock(&self.state) = state;
        self.done.notify_all();
    }

    /// Block until the leader finishes. `None` means the leader gave up without a result.
    fn wait(&self) -> Option<Result<T, E>> {
        let mut state = lock(&self.state);
        loop {
            match &*state {
                FlightState::Running => {
                    state = self
                        .done
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                FlightState::Done(result) => return Some(result.clone()),
                FlightState::Abandoned => return None,
            }
        }
    }
}

enum Role<T, E> {
    Leader(Arc<InFlight<T, E>>),
    Follower(Arc<InFlight<T, E>>),
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keyed response cache owned by a request client
pub struct ResponseCache<T, E> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry<T>>>,
    pending: Mutex<HashMap<String, Arc<InFlight<T, E>>>>,
    hits: AtomicU64,
    joins: AtomicU64,
    misses: AtomicU64,
}

impl<T: Clone, E: Clone> ResponseCache<T, E> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            joins: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return a live entry for `key`, or share/run a request for it.
    ///
    /// With `use_cache` false the entries map is neither read nor written, but
    /// concurrent callers are still deduplicated. A failed producer leaves no
    /// pending marker behind, so the next call runs the producer again.
    pub fn fetch<F>(&self, key: &str, use_cache: bool, producer: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut producer = Some(producer);
        loop {
            if use_cache {
                if let Some(value) = self.lookup(key) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
            }

            match self.join_or_lead(key) {
                Role::Follower(flight) => {
                    self.joins.fetch_add(1, Ordering::Relaxed);
                    match flight.wait() {
                        Some(result) => return result,
                        None => continue,
                    }
                }
                Role::Leader(flight) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let mut guard = LeaderGuard {
                        cache: self,
                        key,
                        flight,
                        finished: false,
                    };
                    // A leader only exists once per call: the producer is still here.
                    let Some(run) = producer.take() else {
                        continue;
                    };
                    let result = run();
                    guard.finish(&result, use_cache);
                    return result;
                }
            }
        }
    }

    fn join_or_lead(&self, key: &str) -> Role<T, E> {
        let mut pending = lock(&self.pending);
        if let Some(flight) = pending.get(key) {
            return Role::Follower(Arc::clone(flight));
        }
        let flight = Arc::new(InFlight::new());
        pending.insert(key.to_string(), Arc::clone(&flight));
        Role::Leader(flight)
    }

    fn lookup(&self, key: &str) -> Option<T> {
        let now = self.clock.now();
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) if now.saturating_duration_since(entry.stored_at) < self.ttl => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: &str, value: T) {
        let entry = Entry {
            value,
            stored_at: self.clock.now(),
        };
        lock(&self.entries).insert(key.to_string(), entry);
    }

    /// Whether a request for `key` is currently running
    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.pending).contains_key(key)
    }

    /// Drop the entry for `key`, if any
    pub fn invalidate(&self, key: &str) {
        lock(&self.entries).remove(key);
    }

    /// Drop every entry whose key starts with `prefix`
    pub fn invalidate_prefix(&self, prefix: &str) {
        lock(&self.entries).retain(|key, _| !key.starts_with(prefix));
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Number of stored entries, expired ones included until they are looked up
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Clears the pending marker even if the producer unwinds.
struct LeaderGuard<'a, T: Clone, E: Clone> {
    cache: &'a ResponseCache<T, E>,
    key: &'a str,
    flight: Arc<InFlight<T, E>>,
    finished: bool,
}

impl<T: Clone, E: Clone> LeaderGuard<'_, T, E> {
    fn finish(&mut self, result: &Result<T, E>, use_cache: bool) {
        // Store before releasing the key so a caller arriving in between sees the entry.
        if let (Ok(value), true) = (result, use_cache) {
            self.cache.store(self.key, value.clone());
        }
        lock(&self.cache.pending).remove(self.key);
        self.flight.publish(FlightState::Done(result.clone()));
        self.finished = true;
    }
}

impl<T: Clone, E: Clone> Drop for LeaderGuard<'_, T, E> {
    fn drop(&mut self) {
        if !self.finished {
            lock(&self.cache.pending).remove(self.key);
            self.flight.publish(FlightState::Abandoned);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    fn cache_with_clock() -> (ResponseCache<String, String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = ResponseCache::with_clock(DEFAULT_TTL, clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_live_entry_skips_producer() {
        let (cache, _clock) = cache_with_clock();
        let calls = AtomicUsize::new(0);
        let produce = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>("payload".to_string())
        };

        assert_eq!(cache.fetch("k", true, produce), Ok("payload".to_string()));
        assert_eq!(cache.fetch("k", true, produce), Ok("payload".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_expired_entry_is_never_returned() {
        let (cache, clock) = cache_with_clock();
        cache
            .fetch("k", true, || Ok::<_, String>("old".to_string()))
            .unwrap();

        clock.advance(DEFAULT_TTL);
        let value = cache
            .fetch("k", true, || Ok::<_, String>("new".to_string()))
            .unwrap();
        assert_eq!(value, "new");
    }

    #[test]
    fn test_entry_just_before_expiry_is_live() {
        let (cache, clock) = cache_with_clock();
        cache
            .fetch("k", true, || Ok::<_, String>("old".to_string()))
            .unwrap();

        clock.advance(DEFAULT_TTL - Duration::from_millis(1));
        let value = cache
            .fetch("k", true, || Ok::<_, String>("new".to_string()))
            .unwrap();
        assert_eq!(value, "old");
    }

    #[test]
    fn test_use_cache_false_does_not_store() {
        let (cache, _clock) = cache_with_clock();
        cache
            .fetch("profile", false, || Ok::<_, String>("a".to_string()))
            .unwrap();
        assert_eq!(cache.len(), 0);

        let value = cache
            .fetch("profile", false, || Ok::<_, String>("b".to_string()))
            .unwrap();
        assert_eq!(value, "b");
    }

    #[test]
    fn test_failure_leaves_no_pending_marker() {
        let (cache, _clock) = cache_with_clock();
        let result = cache.fetch("k", true, || Err::<String, _>("boom".to_string()));
        assert_eq!(result, Err("boom".to_string()));
        assert!(!cache.is_pending("k"));
        assert_eq!(cache.len(), 0);

        let retry = cache.fetch("k", true, || Ok::<_, String>("ok".to_string()));
        assert_eq!(retry, Ok("ok".to_string()));
    }

    #[test]
    fn test_concurrent_callers_share_one_request() {
        let (cache, _clock) = cache_with_clock();
        let calls = AtomicUsize::new(0);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (cache, calls) = (&cache, &calls);

        thread::scope(|s| {
            let leader = s.spawn(move || {
                cache.fetch("search", true, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release_rx.recv().unwrap();
                    Ok::<_, String>("shared".to_string())
                })
            });

            while !cache.is_pending("search") {
                thread::yield_now();
            }

            let follower = s.spawn(move || {
                cache.fetch("search", true, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("duplicate".to_string())
                })
            });

            while cache.stats().joins == 0 {
                thread::yield_now();
            }
            release_tx.send(()).unwrap();

            assert_eq!(leader.join().unwrap(), Ok("shared".to_string()));
            assert_eq!(follower.join().unwrap(), Ok("shared".to_string()));
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_joined_callers_receive_the_failure() {
        let (cache, _clock) = cache_with_clock();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let cache = &cache;

        thread::scope(|s| {
            let leader = s.spawn(move || {
                cache.fetch("k", true, || {
                    release_rx.recv().unwrap();
                    Err::<String, _>("down".to_string())
                })
            });

            while !cache.is_pending("k") {
                thread::yield_now();
            }
            let follower = s.spawn(move || cache.fetch("k", true, || Ok("unused".to_string())));
            while cache.stats().joins == 0 {
                thread::yield_now();
            }
            release_tx.send(()).unwrap();

            assert_eq!(leader.join().unwrap(), Err("down".to_string()));
            assert_eq!(follower.join().unwrap(), Err("down".to_string()));
        });

        assert!(!cache.is_pending("k"));
    }

    #[test]
    fn test_panicking_producer_releases_key() {
        let (cache, _clock) = cache_with_clock();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.fetch("k", true, || -> Result<String, String> { panic!("producer crashed") })
        }));
        assert!(outcome.is_err());
        assert!(!cache.is_pending("k"));

        let retry = cache.fetch("k", true, || Ok::<_, String>("ok".to_string()));
        assert_eq!(retry, Ok("ok".to_string()));
    }

    #[test]
    fn test_invalidate_prefix() {
        let (cache, _clock) = cache_with_clock();
        for key in ["public-profiles-a", "public-profiles-b", "other"] {
            cache
                .fetch(key, true, || Ok::<_, String>(key.to_string()))
                .unwrap();
        }
        cache.invalidate_prefix("public-profiles-");
        assert_eq!(cache.len(), 1);

        cache.invalidate("other");
        assert_eq!(cache.len(), 0);
    }
}
