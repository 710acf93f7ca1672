use crate::roster::Roster;
use crate::types::{Embedding, MatchResult};

/// Acceptance threshold for a qualifying match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.5;

/// Strategy for comparing a probe embedding against the roster.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, roster: &Roster) -> Option<MatchResult>;
}

/// Cosine similarity matcher.
///
/// Scans every roster entry and keeps the maximum. Ties resolve to the
/// lexicographically smallest identity-id: the roster iterates in ascending
/// order and only a strictly greater score replaces the current best.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    threshold: f32,
}

impl CosineMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl Matcher for CosineMatcher {
    fn best_match(&self, probe: &Embedding, roster: &Roster) -> Option<MatchResult> {
        if roster.is_empty() {
            return None;
        }

        let mut best: Option<(&str, f32)> = None;

        for (identity, candidate) in roster.iter() {
            // Non-matchable: wrong shape or degenerate vector.
            if candidate.dim() != probe.dim() || candidate.norm() <= f32::EPSILON {
                continue;
            }

            let score = probe.similarity(candidate);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((identity, score)),
            }
        }

        let (identity, score) = best?;
        if score < self.threshold {
            tracing::trace!(identity, score, "best candidate below threshold");
            return None;
        }

        Some(MatchResult {
            identity: identity.to_string(),
            score,
        })
    }
}
