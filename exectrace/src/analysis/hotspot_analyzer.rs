//! Hotspot analysis for replayed samples.
//!
//! Aggregates samples by function to find where threads spend their time.
//!
//! # Architecture
//!
//! - **`HotspotStats`** - Incremental aggregation, one sample at a time
//! - **`analyze_hotspots()`** - Batch analysis of a whole [`Replay`]
//!
//! ## Self vs. total
//!
//! ```text
//! stack: Main → Parse → ReadToken     (weight 3)
//!
//!   ReadToken   self +3   total +3
//!   Parse                 total +3
//!   Main                  total +3
//! ```
//!
//! A function that appears several times in one stack (recursion) counts
//! once toward its total.
//!
//! # Performance
//!
//! - `record_sample()`: O(stack depth) amortized
//! - `to_hotspots()`: O(n log n) where n = unique functions (sorting)

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use super::replay::{Replay, ReplayedSample};
use exectrace_common::{Frame, InternalId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Maximum unique call stacks to store per hotspot.
///
/// Enough to show the main call paths into a function without keeping every
/// stack of a long trace.
const MAX_CALL_STACKS_PER_HOTSPOT: usize = 5;

// =============================================================================
// FUNCTION HOTSPOT (OUTPUT TYPE)
// =============================================================================

/// A function with aggregated sample weights.
///
/// ```text
/// SELF%   TOTAL%  FUNCTION
/// 42.3    61.0    JsonParser::ReadToken
/// 18.7    18.7    Dictionary<T,U>::Hash
/// ```
#[derive(Debug, Clone)]
pub struct FunctionHotspot {
    pub function: InternalId,

    /// Display name (`Class::Method`), or the id when unnamed.
    pub name: String,

    /// Weight of samples where this function was on top.
    pub self_weight: u64,

    /// Weight of samples where this function was anywhere on the stack.
    pub total_weight: u64,

    /// `self_weight` as a share of all non-empty samples (0.0 - 100.0).
    pub self_percentage: f64,

    /// `total_weight` as a share of all non-empty samples (0.0 - 100.0).
    pub total_percentage: f64,

    /// Per-thread breakdown of `self_weight`.
    pub threads: HashMap<InternalId, u64>,

    /// Representative stacks with this function on top, most frequent first.
    pub call_stacks: Vec<Arc<Vec<Frame>>>,
}

// =============================================================================
// HOTSPOT STATS (AGGREGATOR)
// =============================================================================

#[derive(Debug, Default)]
pub struct HotspotStats {
    functions: HashMap<InternalId, FunctionStats>,

    /// Weight of all samples with a non-empty stack; the percentage denominator.
    total_weight: u64,
}

#[derive(Debug, Clone, Default)]
struct FunctionStats {
    self_weight: u64,
    total_weight: u64,
    threads: HashMap<InternalId, u64>,
    /// Distinct stacks (by content) with their weights.
    call_stacks: Vec<(Arc<Vec<Frame>>, u64)>,
}

impl HotspotStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one sample.
    ///
    /// Samples with an empty stack (thread idle between calls) are skipped.
    pub fn record_sample(&mut self, sample: &ReplayedSample) {
        let Some(top) = sample.stack.last() else {
            return;
        };
        let weight = sample.weight();
        self.total_weight += weight;

        let mut seen = HashSet::with_capacity(sample.stack.len());
        for frame in sample.stack.iter() {
            if seen.insert(frame.function) {
                self.functions.entry(frame.function).or_default().total_weight += weight;
            }
        }

        let stats = self.functions.entry(top.function).or_default();
        stats.self_weight += weight;
        *stats.threads.entry(sample.thread).or_insert(0) += weight;

        if let Some((_, count)) = stats.call_stacks.iter_mut().find(|(stack, _)| **stack == *sample.stack) {
            *count += weight;
        } else if stats.call_stacks.len() < MAX_CALL_STACKS_PER_HOTSPOT {
            stats.call_stacks.push((Arc::clone(&sample.stack), weight));
        }
    }

    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Hotspots sorted by self weight, then total weight (descending).
    #[must_use]
    pub fn to_hotspots(&self, name: impl Fn(InternalId) -> String) -> Vec<FunctionHotspot> {
        let percentage = |weight: u64| {
            if self.total_weight > 0 {
                (weight as f64 / self.total_weight as f64) * 100.0
            } else {
                0.0
            }
        };

        let mut hotspots: Vec<FunctionHotspot> = self
            .functions
            .iter()
            .map(|(&function, stats)| {
                let mut sorted_stacks = stats.call_stacks.clone();
                sorted_stacks.sort_unstable_by_key(|(_, count)| std::cmp::Reverse(*count));

                FunctionHotspot {
                    function,
                    name: name(function),
                    self_weight: stats.self_weight,
                    total_weight: stats.total_weight,
                    self_percentage: percentage(stats.self_weight),
                    total_percentage: percentage(stats.total_weight),
                    threads: stats.threads.clone(),
                    call_stacks: sorted_stacks.into_iter().map(|(stack, _)| stack).collect(),
                }
            })
            .collect();

        hotspots.sort_unstable_by(|a, b| {
            b.self_weight
                .cmp(&a.self_weight)
                .then(b.total_weight.cmp(&a.total_weight))
                .then(a.function.cmp(&b.function))
        });
        hotspots
    }
}

/// Hotspots of a whole replay, heaviest first.
#[must_use]
pub fn analyze_hotspots(replay: &Replay) -> Vec<FunctionHotspot> {
    let mut stats = HotspotStats::new();
    for sample in &replay.samples {
        stats.record_sample(sample);
    }
    stats.to_hotspots(|function| replay.function_name(function))
}
