//! Fee-rate lookup over pre-signed candidates
//!
//! Given candidates sorted by fee rate, find the cheapest one paying at least
//! a target rate.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::{Deserialize, Serialize};

/// Upper bound on bisection steps; enough for any slice that fits in memory.
pub const MAX_SEARCH_STEPS: u32 = 64;

/// Default number of cached lookups.
pub const DEFAULT_CACHE_SIZE: usize = 128;

/// One pre-signed transaction, as offered to a fee picker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxCandidate {
    pub fee_rate: f64,
    pub fee: u64,
    pub vsize: u64,
    pub tx_hex: String,
}

/// Result of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRatePick {
    pub index: usize,
    /// `false` if the step budget ran out; `index` then meets the target but
    /// may not be the cheapest such candidate.
    pub exact: bool,
}

/// Candidates sorted ascending by fee rate, with a content-derived id.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    candidates: Vec<TxCandidate>,
    id: u64,
}

impl CandidateSet {
    pub fn new(mut candidates: Vec<TxCandidate>) -> Self {
        candidates.sort_by(|a, b| {
            a.fee_rate
                .total_cmp(&b.fee_rate)
                .then_with(|| a.tx_hex.cmp(&b.tx_hex))
        });

        let mut hasher = DefaultHasher::new();
        for c in &candidates {
            c.fee_rate.to_bits().hash(&mut hasher);
            c.tx_hex.hash(&mut hasher);
        }
        Self {
            candidates,
            id: hasher.finish(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn as_slice(&self) -> &[TxCandidate] {
        &self.candidates
    }

    pub fn get(&self, index: usize) -> Option<&TxCandidate> {
        self.candidates.get(index)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Most expensive candidate, the fallback when a target exceeds them all.
    pub fn highest(&self) -> Option<&TxCandidate> {
        self.candidates.last()
    }

    /// Cheapest candidate meeting `target`, uncached.
    pub fn lower_bound(&self, target: f64) -> Option<&TxCandidate> {
        lower_bound(&self.candidates, target).and_then(|pick| self.get(pick.index))
    }
}

/// Lowest index whose fee rate is `>= target`, or `None` if the target is
/// above every rate (or not a number). `candidates` must be sorted ascending.
pub fn lower_bound(candidates: &[TxCandidate], target: f64) -> Option<FeeRatePick> {
    lower_bound_within(candidates, target, MAX_SEARCH_STEPS)
}

fn lower_bound_within(candidates: &[TxCandidate], target: f64, budget: u32) -> Option<FeeRatePick> {
    let last = candidates.last()?;
    if !(target <= last.fee_rate) {
        return None;
    }

    // candidates[hi] always meets the target
    let (mut lo, mut hi) = (0, candidates.len() - 1);
    let mut steps = 0;
    while lo < hi {
        if steps == budget {
            return Some(FeeRatePick {
                index: hi,
                exact: false,
            });
        }
        let mid = lo + (hi - lo) / 2;
        if candidates[mid].fee_rate >= target {
            hi = mid;
        } else {
            lo = mid + 1;
        }
        steps += 1;
    }
    Some(FeeRatePick {
        index: lo,
        exact: true,
    })
}

/// Lookup with a bounded LRU cache, for callers that query the same set
/// repeatedly (e.g. a fee slider).
#[derive(Debug)]
pub struct FeeRateSelector {
    /// `None` when caching is disabled
    cache: Option<Mutex<LruCache<(u64, u64), Option<FeeRatePick>>>>,
}

impl Default for FeeRateSelector {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl FeeRateSelector {
    /// A capacity of 0 disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn pick(&self, set: &CandidateSet, target: f64) -> Option<FeeRatePick> {
        let key = (set.id(), target.to_bits());
        // A poisoned cache only costs us memoization.
        let Some(Ok(mut cache)) = self.cache.as_ref().map(|c| c.lock()) else {
            return lower_bound(set.as_slice(), target);
        };

        if let Some(pick) = cache.get(&key) {
            return *pick;
        }
        let pick = lower_bound(set.as_slice(), target);
        cache.put(key, pick);
        pick
    }

    /// Candidate for `target`, if any.
    pub fn select<'a>(&self, set: &'a CandidateSet, target: f64) -> Option<&'a TxCandidate> {
        self.pick(set, target).and_then(|pick| set.get(pick.index))
    }

    pub fn cached(&self) -> usize {
        self.cache
            .as_ref()
            .and_then(|c| c.lock().ok().map(|c| c.len()))
            .unwrap_or(0)
    }
}
