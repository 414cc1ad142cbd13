//! Local answer state with per-question write tracking.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use exam_core::model::{AnswerValue, QuestionId};

/// Identifies one local write so its flush can be acknowledged later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteToken {
    pub question: QuestionId,
    seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAnswer {
    pub value: AnswerValue,
    pub written_at: DateTime<Utc>,
    seq: u64,
    flushed_seq: Option<u64>,
}

impl LocalAnswer {
    /// Written locally after its last confirmed flush.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.flushed_seq != Some(self.seq)
    }
}

/// Counts from reconciling with a remote snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeReport {
    pub adopted_remote: usize,
    pub kept_local: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AnswerLedger {
    entries: BTreeMap<QuestionId, LocalAnswer>,
    next_seq: u64,
}

impl AnswerLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, question: QuestionId, value: AnswerValue, at: DateTime<Utc>) -> WriteToken {
        let seq = self.bump();
        self.entries.insert(
            question,
            LocalAnswer {
                value,
                written_at: at,
                seq,
                flushed_seq: None,
            },
        );
        WriteToken { question, seq }
    }

    /// Acknowledge a flushed write. A newer local write for the same question
    /// stays pending.
    pub fn mark_flushed(&mut self, token: WriteToken) -> bool {
        match self.entries.get_mut(&token.question) {
            Some(entry) if entry.seq == token.seq => {
                entry.flushed_seq = Some(token.seq);
                true
            }
            _ => false,
        }
    }

    /// Pending writes in question order.
    #[must_use]
    pub fn pending(&self) -> Vec<(WriteToken, AnswerValue)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_pending())
            .map(|(question, entry)| {
                (
                    WriteToken {
                        question: *question,
                        seq: entry.seq,
                    },
                    entry.value.clone(),
                )
            })
            .collect()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_pending()).count()
    }

    #[must_use]
    pub fn get(&self, question: QuestionId) -> Option<&LocalAnswer> {
        self.entries.get(&question)
    }

    #[must_use]
    pub fn values(&self) -> BTreeMap<QuestionId, AnswerValue> {
        self.entries
            .iter()
            .map(|(question, entry)| (*question, entry.value.clone()))
            .collect()
    }

    /// Reconcile with a remote answer map.
    ///
    /// Pending local writes win; everything else takes the remote value,
    /// including removal of answers the remote no longer has.
    pub fn merge_remote(
        &mut self,
        remote: &BTreeMap<QuestionId, AnswerValue>,
        observed_at: DateTime<Utc>,
    ) -> MergeReport {
        let mut report = MergeReport::default();

        let before = self.entries.len();
        self.entries
            .retain(|question, entry| entry.is_pending() || remote.contains_key(question));
        report.dropped = before - self.entries.len();

        for (question, value) in remote {
            if let Some(entry) = self.entries.get(question) {
                if entry.is_pending() {
                    report.kept_local += 1;
                    continue;
                }
                if &entry.value == value {
                    continue;
                }
            }
            let seq = self.bump();
            self.entries.insert(
                *question,
                LocalAnswer {
                    value: value.clone(),
                    written_at: observed_at,
                    seq,
                    flushed_seq: Some(seq),
                },
            );
            report.adopted_remote += 1;
        }
        report
    }

    /// Replace everything with `remote`, for a session that can no longer change.
    pub fn replace_with_remote(
        &mut self,
        remote: &BTreeMap<QuestionId, AnswerValue>,
        observed_at: DateTime<Utc>,
    ) {
        self.entries.clear();
        for (question, value) in remote {
            let seq = self.bump();
            self.entries.insert(
                *question,
                LocalAnswer {
                    value: value.clone(),
                    written_at: observed_at,
                    seq,
                    flushed_seq: Some(seq),
                },
            );
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::time::fixed_now;

    fn q(id: u64) -> QuestionId {
        QuestionId::new(id)
    }

    #[test]
    fn newer_write_stays_pending_after_older_flush() {
        let mut ledger = AnswerLedger::new();
        let first = ledger.write(q(1), AnswerValue::Choice(0), fixed_now());
        ledger.write(q(1), AnswerValue::Choice(2), fixed_now());

        assert!(!ledger.mark_flushed(first));
        assert_eq!(ledger.pending_count(), 1);
        assert_eq!(ledger.pending()[0].1, AnswerValue::Choice(2));
    }

    #[test]
    fn merge_prefers_pending_local_writes() {
        let mut ledger = AnswerLedger::new();
        let flushed = ledger.write(q(1), AnswerValue::Choice(0), fixed_now());
        ledger.mark_flushed(flushed);
        ledger.write(q(2), AnswerValue::Choice(3), fixed_now());

        let remote = BTreeMap::from([
            (q(1), AnswerValue::Choice(1)),
            (q(2), AnswerValue::Choice(0)),
            (q(3), AnswerValue::Reference("https://files.example/a".into())),
        ]);
        let report = ledger.merge_remote(&remote, fixed_now());

        assert_eq!(report.kept_local, 1);
        assert_eq!(report.adopted_remote, 2);
        let values = ledger.values();
        assert_eq!(values[&q(1)], AnswerValue::Choice(1));
        assert_eq!(values[&q(2)], AnswerValue::Choice(3));
        assert_eq!(values.len(), 3);
        assert_eq!(ledger.pending_count(), 1);
    }

    #[test]
    fn merge_drops_flushed_answers_missing_remotely() {
        let mut ledger = AnswerLedger::new();
        let token = ledger.write(q(1), AnswerValue::Choice(0), fixed_now());
        ledger.mark_flushed(token);

        let report = ledger.merge_remote(&BTreeMap::new(), fixed_now());

        assert_eq!(report.dropped, 1);
        assert!(ledger.values().is_empty());
    }
}
