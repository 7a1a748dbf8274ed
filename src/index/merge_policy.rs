//! Merge policies for barrel management.
//!
//! A policy looks at the live barrels after every flush and names the runs
//! worth merging. Candidates are always consecutive barrels so the merged
//! barrel keeps covering one contiguous doc id range per collection.

use crate::index::barrel::Barrel;
use crate::index::config::MergePolicyConfig;

/// A span of consecutive barrels to merge into one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCandidate {
    /// Barrel names, in manifest order.
    pub barrels: Vec<String>,

    /// Level whose collision triggered the merge.
    pub level: u32,
}

/// Trait for defining merge policies.
pub trait MergePolicy: Send + Sync + std::fmt::Debug {
    /// Select barrel runs for merging; `barrels` is in manifest order.
    fn select_merges(&self, barrels: &[Barrel]) -> Vec<MergeCandidate>;
}

/// Level of a barrel holding `doc_count` documents: `floor(log3(n))`.
pub fn barrel_level(doc_count: u64) -> u32 {
    let mut level = 0;
    let mut n = doc_count.max(1);
    while n >= 3 {
        n /= 3;
        level += 1;
    }
    level
}

/// Log-structured merging by document count.
///
/// Barrels of equal level collide wherever they sit in the manifest. Once
/// `collision_factor` searchable barrels share a level, the span from the
/// oldest of them to the `collision_factor`-th is merged into one barrel,
/// taking any lower-level barrels between them along. A span crossing a
/// higher-level or unsearchable barrel is skipped in favour of a newer one.
/// Lower levels go first.
#[derive(Debug, Clone)]
pub struct LevelMergePolicy {
    /// Barrels per level that trigger a merge.
    pub collision_factor: usize,
}

impl Default for LevelMergePolicy {
    fn default() -> Self {
        LevelMergePolicy {
            collision_factor: 3,
        }
    }
}

impl LevelMergePolicy {
    pub fn new(collision_factor: usize) -> Self {
        LevelMergePolicy {
            collision_factor: collision_factor.max(2),
        }
    }
}

impl MergePolicy for LevelMergePolicy {
    fn select_merges(&self, barrels: &[Barrel]) -> Vec<MergeCandidate> {
        let collision_factor = self.collision_factor.max(2);
        let levels: Vec<Option<u32>> = barrels
            .iter()
            .map(|b| b.searchable.then(|| barrel_level(b.doc_count)))
            .collect();

        let mut distinct: Vec<u32> = levels.iter().flatten().copied().collect();
        distinct.sort_unstable();
        distinct.dedup();

        let mut candidates = Vec::new();
        for level in distinct {
            let members: Vec<usize> = levels
                .iter()
                .enumerate()
                .filter(|(_, l)| **l == Some(level))
                .map(|(i, _)| i)
                .collect();

            // The span between the first and last member is merged whole;
            // it may absorb lower levels but never a higher or busy barrel.
            let span = members.windows(collision_factor).find_map(|window| {
                let (start, end) = (window[0], window[window.len() - 1]);
                let clear = levels[start..=end]
                    .iter()
                    .all(|l| matches!(l, Some(l) if *l <= level));
                clear.then_some(start..=end)
            });
            if let Some(span) = span {
                candidates.push(MergeCandidate {
                    barrels: barrels[span].iter().map(|b| b.name.clone()).collect(),
                    level,
                });
            }
        }
        candidates
    }
}

/// A policy that never merges.
#[derive(Debug, Clone, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn select_merges(&self, _barrels: &[Barrel]) -> Vec<MergeCandidate> {
        Vec::new()
    }
}

/// Build the policy a configuration names.
pub fn from_config(config: MergePolicyConfig) -> Box<dyn MergePolicy> {
    match config {
        MergePolicyConfig::Level { collision_factor } => {
            Box::new(LevelMergePolicy::new(collision_factor))
        }
        MergePolicyConfig::NoMerge => Box::new(NoMergePolicy),
    }
}
