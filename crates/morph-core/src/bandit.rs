//! Decision agent: the per-(user, component) A/B bandit.
//!
//! Slot lifecycle: `seeded` (both slots carry the author fragment) becomes
//! `active` on the first trial; a sufficient score gap marks the loser
//! `regenerating` (advisory lock held in storage); installing the rewritten
//! candidate archives the old one and returns the slot to `active` with score
//! and trials reset. A failed rewrite leaves the slot untouched.

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::shared::{SlotLabel, VariantKey, VariantRecord};
use crate::store::DocumentStore;
use rand::Rng;
use std::sync::Arc;

/// A regeneration the score update has decided to schedule.
#[derive(Debug, Clone)]
pub struct RegenCandidate {
    pub key: VariantKey,
    pub loser: SlotLabel,
}

/// ε-greedy selection and incremental-mean scoring over variant records.
pub struct DecisionEngine {
    store: Arc<DocumentStore>,
    epsilon: f64,
    min_trials: u64,
    regen_gap: f64,
}

impl DecisionEngine {
    pub fn new(store: Arc<DocumentStore>, config: &CoreConfig) -> Self {
        Self {
            store,
            epsilon: config.epsilon.clamp(0.0, 1.0),
            min_trials: config.min_trials,
            regen_gap: config.regen_gap,
        }
    }

    /// Picks a slot for one optimize request.
    ///
    /// With probability ε the slot with fewer trials is served (exploration);
    /// otherwise the higher-scoring slot wins, ties broken by fewer trials,
    /// then by A. Returns `(label, explored)`; the trial is counted
    /// separately once the guardrail has approved the candidate.
    pub fn choose(&self, record: &VariantRecord) -> (SlotLabel, bool) {
        let explored = rand::thread_rng().gen_bool(self.epsilon);
        let label = if explored {
            Self::fewer_trials(record)
        } else {
            Self::exploit(record)
        };
        (label, explored)
    }

    /// Counts one served trial on a slot.
    pub fn count_trial(&self, key: &VariantKey, label: SlotLabel) -> CoreResult<VariantRecord> {
        let updated = self.store.modify_variant(key, |r| {
            r.slot_mut(label).number_of_trials += 1;
            Ok(())
        })?;
        tracing::debug!(
            target: "morph::bandit",
            %key,
            slot = label.as_str(),
            trials = updated.slot(label).number_of_trials,
            "trial counted"
        );
        Ok(updated)
    }

    fn fewer_trials(record: &VariantRecord) -> SlotLabel {
        if record.variants.b.number_of_trials < record.variants.a.number_of_trials {
            SlotLabel::B
        } else {
            SlotLabel::A
        }
    }

    fn exploit(record: &VariantRecord) -> SlotLabel {
        let (a, b) = (&record.variants.a, &record.variants.b);
        if b.current_score > a.current_score {
            SlotLabel::B
        } else if a.current_score > b.current_score {
            SlotLabel::A
        } else {
            Self::fewer_trials(record)
        }
    }

    /// Applies one reward to a slot and returns the updated record.
    ///
    /// The score is a rolling mean over one reward per served trial:
    /// `μ ← μ + (r − μ) / n` with `n` the slot's trial count (floored at 1 so
    /// a reward arriving before any trial still lands).
    pub fn apply_reward(
        &self,
        key: &VariantKey,
        label: SlotLabel,
        reward: f64,
    ) -> CoreResult<VariantRecord> {
        if !reward.is_finite() || reward < 0.0 {
            return Err(CoreError::Validation(format!(
                "reward must be a non-negative number, got {reward}"
            )));
        }
        let updated = self.store.modify_variant(key, |r| {
            let slot = r.slot_mut(label);
            let n = slot.number_of_trials.max(1) as f64;
            slot.current_score += (reward - slot.current_score) / n;
            Ok(())
        })?;
        tracing::debug!(
            target: "morph::bandit",
            %key,
            slot = label.as_str(),
            reward,
            new_score = updated.slot(label).current_score,
            "reward applied"
        );
        Ok(updated)
    }

    /// Decides whether the record has diverged enough to rewrite the loser:
    /// both slots past `min_trials` and the score gap at or above the
    /// configured threshold.
    pub fn regeneration_check(
        &self,
        key: &VariantKey,
        record: &VariantRecord,
    ) -> Option<RegenCandidate> {
        let winner = record.leader();
        let loser = winner.other();
        let (w, l) = (record.slot(winner), record.slot(loser));
        if w.number_of_trials < self.min_trials || l.number_of_trials < self.min_trials {
            return None;
        }
        if w.current_score - l.current_score < self.regen_gap {
            return None;
        }
        Some(RegenCandidate {
            key: key.clone(),
            loser,
        })
    }
}
