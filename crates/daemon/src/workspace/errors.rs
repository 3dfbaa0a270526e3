// Deduplicated, bounded error queue.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use forgepad_common::types::{ErrorRecord, ErrorSignal, ProcessId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Inserted,
    /// Same code already queued; its counter was bumped.
    Repeated { occurrence_count: u32 },
    /// Inserted after evicting the oldest record.
    Evicted { evicted_code: String },
}

#[derive(Debug, Clone)]
pub struct ErrorQueue {
    capacity: usize,
    records: VecDeque<ErrorRecord>,
}

impl ErrorQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, records: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, signal: ErrorSignal, process_id: Option<ProcessId>) -> PushOutcome {
        self.push_at(signal, process_id, Utc::now())
    }

    pub(crate) fn push_at(
        &mut self,
        signal: ErrorSignal,
        process_id: Option<ProcessId>,
        now: DateTime<Utc>,
    ) -> PushOutcome {
        if let Some(existing) = self.records.iter_mut().find(|record| record.code == signal.code) {
            existing.occurrence_count = existing.occurrence_count.saturating_add(1);
            existing.last_seen = now;
            existing.message = signal.message;
            return PushOutcome::Repeated { occurrence_count: existing.occurrence_count };
        }

        let evicted = if self.records.len() >= self.capacity {
            self.records.pop_front().map(|record| record.code)
        } else {
            None
        };

        self.records.push_back(ErrorRecord {
            message: signal.message,
            code: signal.code,
            severity: signal.severity,
            occurrence_count: 1,
            process_id,
            first_seen: now,
            last_seen: now,
        });

        match evicted {
            Some(evicted_code) => PushOutcome::Evicted { evicted_code },
            None => PushOutcome::Inserted,
        }
    }

    pub fn remove(&mut self, index: usize) -> Option<ErrorRecord> {
        self.records.remove(index)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
