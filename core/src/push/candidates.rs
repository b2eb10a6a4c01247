//! Scored candidate set of one push session.
//!
//! Selection is roulette-wheel via stochastic acceptance (Lipowski & Lipowska):
//! draw a candidate uniformly, accept it with probability `score / max_score`,
//! retry otherwise. Only the running maximum is needed, so a pick costs O(1)
//! expected work instead of a sort. The maximum is cached together with a
//! staleness flag; a stale cache costs one full rescan before the next pick.

use super::score::Scorer;
use crate::store::{ContentHandle, ContentId};
use rand::Rng;
use std::collections::HashMap;

/// Outcome of offering a handle to the set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Score at or below the threshold; the handle was released
    BelowThreshold,
    /// The id is already a candidate; the new handle was released
    AlreadyPresent,
}

struct Candidate {
    handle: ContentHandle,
    /// Last computed score
    score: f32,
}

pub struct CandidateSet {
    entries: Vec<Candidate>,
    index: HashMap<ContentId, usize>,
    max: Option<(ContentId, f32)>,
    max_valid: bool,
    threshold: f32,
    rescans: u64,
}

impl CandidateSet {
    pub fn new(threshold: f32) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            max: None,
            max_valid: false,
            threshold: threshold.max(0.0),
            rescans: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ContentId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Number of full rescans performed so far
    pub fn rescans(&self) -> u64 {
        self.rescans
    }

    /// Cached maximum, if currently valid
    pub fn max(&self) -> Option<(ContentId, f32)> {
        if self.max_valid {
            self.max
        } else {
            None
        }
    }

    pub fn is_max_stale(&self) -> bool {
        !self.max_valid
    }

    /// Force a rescan before the next pick (scores changed wholesale)
    pub fn mark_stale(&mut self) {
        self.max_valid = false;
    }

    pub fn ids(&self) -> Vec<ContentId> {
        self.entries.iter().map(|c| c.handle.id()).collect()
    }

    fn eligible(&self, score: f32) -> bool {
        score.is_finite() && score > self.threshold
    }

    /// Fresh score of the entry at `idx`, None when it is no longer eligible
    fn rescore<S: Scorer + ?Sized>(&self, scorer: &S, idx: usize) -> Option<f32> {
        scorer
            .score(&self.entries[idx].handle)
            .filter(|score| self.eligible(*score))
    }

    fn is_cached_max(&self, id: ContentId) -> bool {
        matches!(self.max, Some((max_id, _)) if max_id == id)
    }

    /// Offer a freshly fetched handle with its current score.
    pub fn insert(&mut self, handle: ContentHandle, score: f32) -> Admission {
        if !self.eligible(score) {
            return Admission::BelowThreshold;
        }
        let id = handle.id();
        if self.index.contains_key(&id) {
            return Admission::AlreadyPresent;
        }

        let was_empty = self.entries.is_empty();
        self.index.insert(id, self.entries.len());
        self.entries.push(Candidate { handle, score });

        if was_empty {
            self.max = Some((id, score));
            self.max_valid = true;
        } else if self.max_valid {
            if let Some((_, max_score)) = self.max {
                if score > max_score {
                    self.max = Some((id, score));
                }
            }
        }
        Admission::Admitted
    }

    /// Take a candidate out of the set. Removing the cached maximum marks it stale.
    pub fn remove(&mut self, id: ContentId) -> Option<ContentHandle> {
        let idx = self.index.remove(&id)?;
        let candidate = self.entries.swap_remove(idx);
        if idx < self.entries.len() {
            let moved = self.entries[idx].handle.id();
            self.index.insert(moved, idx);
        }
        if self.is_cached_max(id) {
            self.max = None;
            self.max_valid = false;
        }
        Some(candidate.handle)
    }

    /// Recompute every score, evict what fell to the threshold, rebuild the maximum.
    pub fn rescan<S: Scorer + ?Sized>(&mut self, scorer: &S) {
        self.rescans += 1;
        let threshold = self.threshold;
        let mut kept = Vec::with_capacity(self.entries.len());
        for mut candidate in self.entries.drain(..) {
            match scorer.score(&candidate.handle) {
                Some(score) if score.is_finite() && score > threshold => {
                    candidate.score = score;
                    kept.push(candidate);
                }
                // decayed or gone from the store: the handle is released here
                _ => {}
            }
        }

        self.index.clear();
        self.max = None;
        for (idx, candidate) in kept.iter().enumerate() {
            let id = candidate.handle.id();
            self.index.insert(id, idx);
            match self.max {
                Some((_, best)) if best >= candidate.score => {}
                _ => self.max = Some((id, candidate.score)),
            }
        }
        self.entries = kept;
        self.max_valid = true;
    }

    /// Current maximum score, refreshing the cached entry and rescanning when stale.
    /// None when nothing eligible is left.
    fn refresh_max<S: Scorer + ?Sized>(&mut self, scorer: &S) -> Option<f32> {
        if self.entries.is_empty() {
            return None;
        }
        if self.max_valid {
            if let Some((id, _)) = self.max {
                if let Some(&idx) = self.index.get(&id) {
                    if let Some(score) = self.rescore(scorer, idx) {
                        self.entries[idx].score = score;
                        self.max = Some((id, score));
                        return Some(score);
                    }
                }
            }
            self.max_valid = false;
        }
        self.rescan(scorer);
        self.max.map(|(_, score)| score)
    }

    /// Select and remove one candidate with probability proportional to its score.
    ///
    /// Returns None only when no eligible candidate is left.
    pub fn pick<R, S>(&mut self, rng: &mut R, scorer: &S) -> Option<ContentHandle>
    where
        R: Rng + ?Sized,
        S: Scorer + ?Sized,
    {
        let mut max_score = self.refresh_max(scorer)?;
        loop {
            if self.entries.is_empty() {
                return None;
            }
            let idx = rng.gen_range(0..self.entries.len());
            let id = self.entries[idx].handle.id();
            let Some(score) = self.rescore(scorer, idx) else {
                let was_max = self.is_cached_max(id);
                drop(self.remove(id));
                if was_max {
                    max_score = self.refresh_max(scorer)?;
                }
                continue;
            };

            self.entries[idx].score = score;
            if score > max_score {
                max_score = score;
                self.max = Some((id, score));
                self.max_valid = true;
            }

            let draw: f32 = rng.gen_range(0.0..max_score);
            if draw <= score {
                return self.remove(id);
            }
        }
    }

    /// Empty the set, handing every handle back to the caller
    pub fn drain(&mut self) -> Vec<ContentHandle> {
        self.index.clear();
        self.max = None;
        self.max_valid = false;
        self.entries.drain(..).map(|c| c.handle).collect()
    }
}
