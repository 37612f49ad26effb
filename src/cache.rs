//! Analysis cache - memoizes computed tracks, deduplicating concurrent work.
//!
//! Tracks are keyed by (sound identity, algorithm kind, time domain,
//! parameter set), compared by value: two requests with identical
//! parameters hit the same entry no matter where the parameter structs
//! live. Floating-point fields are compared and hashed through their bit
//! patterns; parameter validation rejects NaN, so bitwise equality is
//! exact value equality.
//!
//! `get_or_compute` guarantees at-most-one computation per distinct key
//! even under concurrent callers: the first caller for a key becomes the
//! leader and computes; later callers find the pending entry and wait on
//! its condvar, then share the leader's result. Ready entries live in an
//! LRU with a configurable ceiling; pending entries live outside the LRU,
//! so eviction can never drop an entry a caller is still awaiting.
//!
//! Invalidation by sound identity is the designed hook for upstream
//! in-place edit features; with the immutable sample buffer of this core
//! it has no active caller besides session teardown.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::formant::FormantParams;
use crate::intensity::IntensityParams;
use crate::pitch::PitchParams;
use crate::track::{CancelToken, Track, TrackKind};

/// Parameter set of a cached request, compared by value.
#[derive(Debug, Clone)]
pub enum ParamSet {
    Pitch(PitchParams),
    Formants(FormantParams),
    Intensity(IntensityParams),
}

impl ParamSet {
    /// Discriminant plus every field as stable bits.
    fn bits(&self) -> (u8, Vec<u64>) {
        match self {
            ParamSet::Pitch(p) => (
                0,
                vec![
                    p.time_step.to_bits(),
                    p.minimum_pitch.to_bits(),
                    p.maximum_pitch.to_bits(),
                    p.voicing_threshold.to_bits(),
                ],
            ),
            ParamSet::Formants(p) => (
                1,
                vec![
                    p.time_step.to_bits(),
                    p.nformant as u64,
                    p.lpc_order as u64,
                    p.window_length.to_bits(),
                    p.maximum_frequency.to_bits(),
                    p.maximum_bandwidth.to_bits(),
                    p.pre_emphasis_from.to_bits(),
                ],
            ),
            ParamSet::Intensity(p) => (
                2,
                vec![p.time_step.to_bits(), p.minimum_pitch.to_bits()],
            ),
        }
    }
}

impl PartialEq for ParamSet {
    fn eq(&self, other: &Self) -> bool {
        self.bits() == other.bits()
    }
}

impl Eq for ParamSet {}

impl Hash for ParamSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let (tag, fields) = self.bits();
        tag.hash(state);
        fields.hash(state);
    }
}

/// Identifies one reproducible analysis request.
#[derive(Debug, Clone)]
pub struct CacheKey {
    sound: u64,
    kind: TrackKind,
    domain: (f64, f64),
    params: ParamSet,
}

impl CacheKey {
    pub fn pitch(sound: u64, t0: f64, t1: f64, params: PitchParams) -> Self {
        Self {
            sound,
            kind: TrackKind::Pitch,
            domain: (t0, t1),
            params: ParamSet::Pitch(params),
        }
    }

    pub fn formants(sound: u64, t0: f64, t1: f64, params: FormantParams) -> Self {
        Self {
            sound,
            kind: TrackKind::Formants,
            domain: (t0, t1),
            params: ParamSet::Formants(params),
        }
    }

    pub fn intensity(sound: u64, t0: f64, t1: f64, params: IntensityParams) -> Self {
        Self {
            sound,
            kind: TrackKind::Intensity,
            domain: (t0, t1),
            params: ParamSet::Intensity(params),
        }
    }

    pub fn sound(&self) -> u64 {
        self.sound
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.sound == other.sound
            && self.kind == other.kind
            && self.domain.0.to_bits() == other.domain.0.to_bits()
            && self.domain.1.to_bits() == other.domain.1.to_bits()
            && self.params == other.params
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sound.hash(state);
        self.kind.hash(state);
        self.domain.0.to_bits().hash(state);
        self.domain.1.to_bits().hash(state);
        self.params.hash(state);
    }
}

/// Cache sizing.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Ready-track ceiling; least-recently-used entries are evicted beyond it.
    pub max_tracks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_tracks: 64 }
    }
}

/// Failure shared with waiters of a pending entry. The leader keeps the
/// original error; waiters get a clonable summary.
#[derive(Debug, Clone)]
enum SharedFailure {
    Cancelled,
    Failed(String),
}

type Outcome = std::result::Result<Arc<Track>, SharedFailure>;

struct Pending {
    done: Mutex<Option<Outcome>>,
    ready: Condvar,
    cancel: CancelToken,
}

impl Pending {
    fn new() -> Self {
        Self {
            done: Mutex::new(None),
            ready: Condvar::new(),
            cancel: CancelToken::new(),
        }
    }
}

struct State {
    ready: LruCache<CacheKey, Arc<Track>>,
    pending: HashMap<CacheKey, Arc<Pending>>,
}

/// Memoizes analysis tracks with single-flight computation per key.
pub struct AnalysisCache {
    state: Mutex<State>,
}

impl AnalysisCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_tracks.max(1))
            .expect("max(1) is non-zero");
        Self {
            state: Mutex::new(State {
                ready: LruCache::new(capacity),
                pending: HashMap::new(),
            }),
        }
    }

    /// Return the cached track for `key`, or compute it.
    ///
    /// At most one caller runs `compute` per distinct key; concurrent
    /// callers for the same key block until the computation finishes and
    /// share the same `Arc<Track>`. The closure receives a [`CancelToken`]
    /// it should check between frames.
    pub fn get_or_compute<F>(&self, key: CacheKey, compute: F) -> Result<Arc<Track>>
    where
        F: FnOnce(&CancelToken) -> Result<Track>,
    {
        let pending = {
            let mut state = self.state.lock();
            if let Some(track) = state.ready.get(&key) {
                trace!(kind = ?key.kind, "cache hit");
                return Ok(track.clone());
            }
            if let Some(pending) = state.pending.get(&key) {
                // Someone else is computing this key; attach to their result.
                let pending = pending.clone();
                drop(state);
                trace!(kind = ?key.kind, "awaiting in-flight computation");
                let mut done = pending.done.lock();
                while done.is_none() {
                    pending.ready.wait(&mut done);
                }
                return match done.clone().expect("signalled after completion") {
                    Ok(track) => Ok(track),
                    Err(SharedFailure::Cancelled) => Err(Error::Cancelled),
                    Err(SharedFailure::Failed(message)) => Err(Error::AnalysisFailed(message)),
                };
            }
            let pending = Arc::new(Pending::new());
            state.pending.insert(key.clone(), pending.clone());
            pending
        };

        // Leader path: compute without holding the cache lock.
        debug!(kind = ?key.kind, "computing track");
        match compute(&pending.cancel) {
            Ok(track) => {
                let track = Arc::new(track);
                let mut state = self.state.lock();
                state.pending.remove(&key);
                state.ready.put(key, track.clone());
                drop(state);
                *pending.done.lock() = Some(Ok(track.clone()));
                pending.ready.notify_all();
                Ok(track)
            }
            Err(err) => {
                let shared = match &err {
                    Error::Cancelled => SharedFailure::Cancelled,
                    other => SharedFailure::Failed(other.to_string()),
                };
                self.state.lock().pending.remove(&key);
                *pending.done.lock() = Some(Err(shared));
                pending.ready.notify_all();
                Err(err)
            }
        }
    }

    /// Drop every ready entry computed from the given sound.
    ///
    /// The hook for upstream in-place sample edits; also used when a
    /// session closes.
    pub fn invalidate_sound(&self, sound: u64) {
        let mut state = self.state.lock();
        let stale: Vec<CacheKey> = state
            .ready
            .iter()
            .filter(|(k, _)| k.sound == sound)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            state.ready.pop(key);
        }
        if !stale.is_empty() {
            debug!(sound, dropped = stale.len(), "invalidated cached tracks");
        }
    }

    /// Request cancellation of the in-flight computation for one key, if any.
    pub fn cancel(&self, key: &CacheKey) {
        if let Some(pending) = self.state.lock().pending.get(key) {
            pending.cancel.cancel();
        }
    }

    /// Request cancellation of every in-flight computation.
    pub fn cancel_all(&self) {
        let state = self.state.lock();
        for pending in state.pending.values() {
            pending.cancel.cancel();
        }
    }

    /// Number of ready (completed) entries.
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all ready entries. In-flight computations are unaffected.
    pub fn clear(&self) {
        self.state.lock().ready.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    use crate::track::TrackSample;

    fn dummy_track() -> Track {
        Track::new(
            TrackKind::Pitch,
            (0.0, 1.0),
            0.01,
            vec![TrackSample {
                time: 0.5,
                values: vec![Some(120.0)],
            }],
        )
    }

    fn key_for(sound: u64) -> CacheKey {
        CacheKey::pitch(sound, 0.0, 1.0, PitchParams::default())
    }

    #[test]
    fn second_request_hits_the_cache() {
        let cache = AnalysisCache::new(CacheConfig::default());
        let mut computed = 0;
        let a = cache
            .get_or_compute(key_for(1), |_| {
                computed += 1;
                Ok(dummy_track())
            })
            .unwrap();
        let b = cache
            .get_or_compute(key_for(1), |_| {
                computed += 1;
                Ok(dummy_track())
            })
            .unwrap();
        assert_eq!(computed, 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn equal_keys_are_equal_by_value() {
        let a = key_for(7);
        let b = key_for(7);
        assert_eq!(a, b);
        let c = CacheKey::pitch(
            7,
            0.0,
            1.0,
            PitchParams {
                minimum_pitch: 50.0,
                ..PitchParams::default()
            },
        );
        assert_ne!(a, c);
        let d = CacheKey::intensity(7, 0.0, 1.0, IntensityParams::default());
        assert_ne!(a, d);
    }

    #[test]
    fn concurrent_requests_compute_exactly_once() {
        let cache = Arc::new(AnalysisCache::new(CacheConfig::default()));
        let computed = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let computed = computed.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                cache
                    .get_or_compute(key_for(42), |_| {
                        computed.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        Ok(dummy_track())
                    })
                    .unwrap()
            }));
        }

        let tracks: Vec<Arc<Track>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(computed.load(Ordering::SeqCst), 1);
        for t in &tracks[1..] {
            assert!(Arc::ptr_eq(&tracks[0], t));
        }
    }

    #[test]
    fn lru_evicts_oldest_ready_entry() {
        let cache = AnalysisCache::new(CacheConfig { max_tracks: 2 });
        for sound in 1..=3u64 {
            cache
                .get_or_compute(key_for(sound), |_| Ok(dummy_track()))
                .unwrap();
        }
        assert_eq!(cache.len(), 2);

        // Sound 1 was evicted: recomputation happens.
        let mut recomputed = false;
        cache
            .get_or_compute(key_for(1), |_| {
                recomputed = true;
                Ok(dummy_track())
            })
            .unwrap();
        assert!(recomputed);
    }

    #[test]
    fn invalidate_drops_only_that_sound() {
        let cache = AnalysisCache::new(CacheConfig::default());
        cache
            .get_or_compute(key_for(1), |_| Ok(dummy_track()))
            .unwrap();
        cache
            .get_or_compute(key_for(2), |_| Ok(dummy_track()))
            .unwrap();

        cache.invalidate_sound(1);
        assert_eq!(cache.len(), 1);

        let mut recomputed = false;
        cache
            .get_or_compute(key_for(2), |_| {
                recomputed = true;
                Ok(dummy_track())
            })
            .unwrap();
        assert!(!recomputed, "sound 2 should still be cached");
    }

    #[test]
    fn leader_error_reaches_waiters_as_shared_failure() {
        let cache = Arc::new(AnalysisCache::new(CacheConfig::default()));
        let barrier = Arc::new(Barrier::new(2));

        let leader = {
            let cache = cache.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                cache.get_or_compute(key_for(9), |_| {
                    barrier.wait();
                    std::thread::sleep(Duration::from_millis(30));
                    Err(Error::Parameter("bad".into()))
                })
            })
        };
        let waiter = {
            let cache = cache.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                // Give the leader time to register as pending before us.
                std::thread::sleep(Duration::from_millis(5));
                cache.get_or_compute(key_for(9), |_| Ok(dummy_track()))
            })
        };

        assert!(matches!(leader.join().unwrap(), Err(Error::Parameter(_))));
        match waiter.join().unwrap() {
            // Either the waiter attached to the failing computation, or it
            // arrived after completion and recomputed successfully.
            Err(Error::AnalysisFailed(_)) | Ok(_) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn cancel_all_flags_inflight_tokens() {
        let cache = Arc::new(AnalysisCache::new(CacheConfig::default()));
        let barrier = Arc::new(Barrier::new(2));

        let worker = {
            let cache = cache.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                cache.get_or_compute(key_for(5), |token| {
                    barrier.wait();
                    // Wait until the main thread cancels us.
                    for _ in 0..200 {
                        if token.is_cancelled() {
                            return Err(Error::Cancelled);
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(dummy_track())
                })
            })
        };

        barrier.wait();
        std::thread::sleep(Duration::from_millis(10));
        cache.cancel_all();
        assert!(matches!(worker.join().unwrap(), Err(Error::Cancelled)));
        assert_eq!(cache.len(), 0);
    }
}
