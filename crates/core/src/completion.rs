//! Completion matrix: required tuples versus terminally resolved tuples.
//!
//! The matrix answers "is this campaign done?". Stores persist it and apply
//! these transitions under their own concurrency control (a lock or a guarded
//! SQL update).
//!
//! ## Revisions
//!
//! Each tuple carries its current revision and generation seed. A result only
//! counts when it was produced for the tuple's *current* revision; anything
//! older is stale and ignored. Advancing to revision 1 keeps the seed so the
//! first rework is a close variant of the original, later revisions take a
//! fresh seed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dimension::CompletionTuple;
use crate::error::{DomainError, DomainResult};
use crate::id::CampaignId;
use crate::work_unit::IdempotencyKey;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TupleOutcome {
    Done,
    FailedPermanent,
}

impl TupleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TupleOutcome::Done => "done",
            TupleOutcome::FailedPermanent => "failed_permanent",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "done" => Ok(TupleOutcome::Done),
            "failed_permanent" => Ok(TupleOutcome::FailedPermanent),
            other => Err(DomainError::validation(format!("unknown tuple outcome '{other}'"))),
        }
    }
}

/// An outcome pinned to the revision it was produced for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOutcome {
    pub revision: u32,
    pub outcome: TupleOutcome,
    pub source: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleProgress {
    pub revision: u32,
    pub seed: u64,
    pub resolved: Option<ResolvedOutcome>,
}

impl TupleProgress {
    /// Outcome for the current revision, if any.
    pub fn current_outcome(&self) -> Option<TupleOutcome> {
        self.resolved
            .as_ref()
            .filter(|r| r.revision == self.revision)
            .map(|r| r.outcome)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The tuple became resolved for its current revision.
    Inserted,
    /// Already resolved for this revision; nothing changed.
    Duplicate,
    /// Produced for an older revision; ignored.
    Stale,
    /// Not part of the required set.
    NotRequired,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionCounts {
    pub required: usize,
    pub done: usize,
    pub failed: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    Completed,
    CompletedWithErrors,
}

/// Revision allocated by a revision request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionTicket {
    pub revision: u32,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMatrix {
    campaign_id: CampaignId,
    tuples: BTreeMap<CompletionTuple, TupleProgress>,
}

impl CompletionMatrix {
    /// Build the matrix at submission time; every tuple starts at revision 0.
    pub fn new(
        campaign_id: CampaignId,
        required: impl IntoIterator<Item = CompletionTuple>,
        mut seed_for: impl FnMut(&CompletionTuple) -> u64,
    ) -> Self {
        let tuples = required
            .into_iter()
            .map(|t| {
                let seed = seed_for(&t);
                (
                    t,
                    TupleProgress {
                        revision: 0,
                        seed,
                        resolved: None,
                    },
                )
            })
            .collect();
        Self {
            campaign_id,
            tuples,
        }
    }

    /// Reassemble a matrix loaded from storage.
    pub fn from_parts(
        campaign_id: CampaignId,
        tuples: impl IntoIterator<Item = (CompletionTuple, TupleProgress)>,
    ) -> Self {
        Self {
            campaign_id,
            tuples: tuples.into_iter().collect(),
        }
    }

    pub fn campaign_id(&self) -> CampaignId {
        self.campaign_id
    }

    pub fn required_count(&self) -> usize {
        self.tuples.len()
    }

    pub fn tuples(&self) -> impl Iterator<Item = (&CompletionTuple, &TupleProgress)> {
        self.tuples.iter()
    }

    pub fn progress(&self, tuple: &CompletionTuple) -> Option<&TupleProgress> {
        self.tuples.get(tuple)
    }

    pub fn current_revision(&self, tuple: &CompletionTuple) -> Option<u32> {
        self.tuples.get(tuple).map(|p| p.revision)
    }

    pub fn is_stale(&self, tuple: &CompletionTuple, revision: u32) -> bool {
        self.current_revision(tuple).is_some_and(|current| revision < current)
    }

    /// Resolve `tuple` at `revision`. First write for a revision wins.
    pub fn record(
        &mut self,
        tuple: &CompletionTuple,
        revision: u32,
        outcome: TupleOutcome,
        source: IdempotencyKey,
    ) -> RecordOutcome {
        let Some(progress) = self.tuples.get_mut(tuple) else {
            return RecordOutcome::NotRequired;
        };
        if revision != progress.revision {
            return RecordOutcome::Stale;
        }
        if progress.current_outcome().is_some() {
            return RecordOutcome::Duplicate;
        }
        progress.resolved = Some(ResolvedOutcome {
            revision,
            outcome,
            source,
        });
        RecordOutcome::Inserted
    }

    /// Move `tuple` to its next revision.
    ///
    /// `fresh_seed` is only used from the second revision onwards.
    pub fn advance_revision(
        &mut self,
        tuple: &CompletionTuple,
        fresh_seed: u64,
    ) -> DomainResult<RevisionTicket> {
        let progress = self
            .tuples
            .get_mut(tuple)
            .ok_or_else(|| DomainError::validation(format!("tuple {tuple} is not part of the campaign")))?;
        let revision = progress
            .revision
            .checked_add(1)
            .ok_or_else(|| DomainError::invariant("revision counter overflow"))?;
        progress.revision = revision;
        if revision >= 2 {
            progress.seed = fresh_seed;
        }
        Ok(RevisionTicket {
            revision,
            seed: progress.seed,
        })
    }

    pub fn counts(&self) -> CompletionCounts {
        let mut counts = CompletionCounts {
            required: self.tuples.len(),
            done: 0,
            failed: 0,
        };
        for progress in self.tuples.values() {
            match progress.current_outcome() {
                Some(TupleOutcome::Done) => counts.done += 1,
                Some(TupleOutcome::FailedPermanent) => counts.failed += 1,
                None => {}
            }
        }
        counts
    }

    /// Completed iff every tuple is done; with errors once all are terminal
    /// and at least one failed permanently.
    pub fn verdict(&self) -> Verdict {
        let counts = self.counts();
        if counts.required == 0 || counts.done + counts.failed < counts.required {
            Verdict::Pending
        } else if counts.failed == 0 {
            Verdict::Completed
        } else {
            Verdict::CompletedWithErrors
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::{AspectRatio, Locale, ProductId};
    use uuid::Uuid;

    fn tuple(locale: &str, ar: AspectRatio) -> CompletionTuple {
        CompletionTuple::new(
            Locale::new(locale).unwrap(),
            ProductId::new("serum").unwrap(),
            ar,
        )
    }

    fn key(n: u128) -> IdempotencyKey {
        IdempotencyKey::from_uuid(Uuid::from_u128(n))
    }

    fn c1() -> CompletionMatrix {
        let required = vec![
            tuple("en", AspectRatio::Square),
            tuple("en", AspectRatio::Portrait),
            tuple("de", AspectRatio::Square),
            tuple("de", AspectRatio::Portrait),
        ];
        CompletionMatrix::new(CampaignId::new(), required, |_| 42)
    }

    #[test]
    fn completes_only_after_last_tuple() {
        let mut m = c1();
        let all: Vec<_> = m.tuples().map(|(t, _)| t.clone()).collect();
        for (i, t) in all.iter().take(3).enumerate() {
            assert_eq!(m.record(t, 0, TupleOutcome::Done, key(i as u128)), RecordOutcome::Inserted);
            assert_eq!(m.verdict(), Verdict::Pending);
        }
        m.record(&all[3], 0, TupleOutcome::Done, key(3));
        assert_eq!(m.verdict(), Verdict::Completed);
        assert_eq!(
            m.counts(),
            CompletionCounts {
                required: 4,
                done: 4,
                failed: 0
            }
        );
    }

    #[test]
    fn duplicate_record_is_noop() {
        let mut m = c1();
        let t = tuple("en", AspectRatio::Square);
        assert_eq!(m.record(&t, 0, TupleOutcome::Done, key(1)), RecordOutcome::Inserted);
        assert_eq!(m.record(&t, 0, TupleOutcome::Done, key(1)), RecordOutcome::Duplicate);
        assert_eq!(
            m.record(&t, 0, TupleOutcome::FailedPermanent, key(2)),
            RecordOutcome::Duplicate
        );
        assert_eq!(m.counts().done, 1);
    }

    #[test]
    fn failures_yield_completed_with_errors() {
        let mut m = c1();
        let all: Vec<_> = m.tuples().map(|(t, _)| t.clone()).collect();
        m.record(&all[0], 0, TupleOutcome::FailedPermanent, key(0));
        for (i, t) in all.iter().enumerate().skip(1) {
            m.record(t, 0, TupleOutcome::Done, key(i as u128));
        }
        assert_eq!(m.verdict(), Verdict::CompletedWithErrors);
    }

    #[test]
    fn stale_revision_does_not_count() {
        let mut m = c1();
        let t = tuple("en", AspectRatio::Square);
        m.advance_revision(&t, 7).unwrap();
        assert_eq!(m.record(&t, 0, TupleOutcome::Done, key(1)), RecordOutcome::Stale);
        assert_eq!(m.counts().done, 0);
        assert_eq!(m.record(&t, 1, TupleOutcome::Done, key(2)), RecordOutcome::Inserted);
    }

    #[test]
    fn revision_reopens_a_done_tuple() {
        let mut m = c1();
        let all: Vec<_> = m.tuples().map(|(t, _)| t.clone()).collect();
        for (i, t) in all.iter().enumerate() {
            m.record(t, 0, TupleOutcome::Done, key(i as u128));
        }
        assert_eq!(m.verdict(), Verdict::Completed);
        m.advance_revision(&all[0], 9).unwrap();
        assert_eq!(m.verdict(), Verdict::Pending);
    }

    #[test]
    fn first_revision_reuses_seed_later_ones_refresh() {
        let mut m = c1();
        let t = tuple("de", AspectRatio::Portrait);
        let first = m.advance_revision(&t, 100).unwrap();
        assert_eq!(first, RevisionTicket { revision: 1, seed: 42 });
        let second = m.advance_revision(&t, 200).unwrap();
        assert_eq!(second, RevisionTicket { revision: 2, seed: 200 });
        let third = m.advance_revision(&t, 300).unwrap();
        assert_eq!(third, RevisionTicket { revision: 3, seed: 300 });
    }

    #[test]
    fn unknown_tuple_is_not_required() {
        let mut m = c1();
        let t = tuple("fr", AspectRatio::Square);
        assert_eq!(m.record(&t, 0, TupleOutcome::Done, key(1)), RecordOutcome::NotRequired);
        assert!(m.advance_revision(&t, 1).is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        const LOCALES: [&str; 4] = ["en", "de", "fr", "es"];

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Property: with L locales × A ratios (single product), the verdict is
            /// Completed iff every tuple has a success record.
            #[test]
            fn completes_iff_all_tuples_done(
                l in 1usize..=4,
                a in 1usize..=4,
                recorded in proptest::collection::vec(any::<bool>(), 16),
                seed in any::<u64>()
            ) {
                let mut required = Vec::new();
                for locale in LOCALES.iter().take(l) {
                    for ar in AspectRatio::ALL.iter().take(a) {
                        required.push(tuple(locale, *ar));
                    }
                }
                let mut m = CompletionMatrix::new(CampaignId::new(), required.clone(), |_| seed);
                for (i, t) in required.iter().enumerate() {
                    if recorded[i] {
                        m.record(t, 0, TupleOutcome::Done, key(i as u128));
                    }
                }
                let all_done = required.iter().enumerate().all(|(i, _)| recorded[i]);
                prop_assert_eq!(m.verdict() == Verdict::Completed, all_done);
                if !all_done {
                    prop_assert_eq!(m.verdict(), Verdict::Pending);
                }
            }

            /// Property: recording in any order, any number of times, yields the same counts.
            #[test]
            fn recording_is_idempotent(repeats in 1usize..5) {
                let mut m = c1();
                let all: Vec<_> = m.tuples().map(|(t, _)| t.clone()).collect();
                for _ in 0..repeats {
                    for (i, t) in all.iter().enumerate().rev() {
                        m.record(t, 0, TupleOutcome::Done, key(i as u128));
                    }
                }
                prop_assert_eq!(m.counts().done, all.len());
                prop_assert_eq!(m.verdict(), Verdict::Completed);
            }
        }
    }
}
