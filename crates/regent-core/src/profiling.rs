// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Profiling hooks.
//!
//! The runtime reports scheduling milestones through a [`ProfilingSink`]
//! owned by the embedder. The default sink discards everything; tests and
//! tools install their own to count steals, watch retries, or export
//! timelines. Sink calls happen on scheduler and worker threads, so
//! implementations must be cheap and must not block.

use std::time::{Duration, Instant};

use regent_lowlevel::Processor;

use crate::ident::{DistributedId, UniqueOpId};

/// Milestone instants of one operation's life.
#[derive(Clone, Copy, Debug, Default)]
pub struct OperationTimeline {
    issued: Option<Instant>,
    ready: Option<Instant>,
    start: Option<Instant>,
    complete: Option<Instant>,
}

impl OperationTimeline {
    /// Stamps issue time; first call wins.
    pub fn mark_issued(&mut self) {
        self.issued.get_or_insert_with(Instant::now);
    }

    /// Stamps the instant all dependences resolved.
    pub fn mark_ready(&mut self) {
        self.ready.get_or_insert_with(Instant::now);
    }

    /// Stamps dispatch onto a processor.
    pub fn mark_start(&mut self) {
        self.start.get_or_insert_with(Instant::now);
    }

    /// Stamps completion.
    pub fn mark_complete(&mut self) {
        self.complete.get_or_insert_with(Instant::now);
    }

    /// Time from issue until ready.
    #[must_use]
    pub fn wait_time(&self) -> Option<Duration> {
        Some(self.ready?.duration_since(self.issued?))
    }

    /// Time from ready until dispatch.
    #[must_use]
    pub fn queue_time(&self) -> Option<Duration> {
        Some(self.start?.duration_since(self.ready?))
    }

    /// Time from dispatch until completion.
    #[must_use]
    pub fn run_time(&self) -> Option<Duration> {
        Some(self.complete?.duration_since(self.start?))
    }

    /// Time from issue until completion.
    #[must_use]
    pub fn total_time(&self) -> Option<Duration> {
        Some(self.complete?.duration_since(self.issued?))
    }
}

/// Receiver for scheduling milestones.
pub trait ProfilingSink: Send + Sync {
    /// An operation entered the pipeline.
    fn on_issued(&self, _op: UniqueOpId) {}

    /// All dependences of an operation resolved.
    fn on_ready(&self, _op: UniqueOpId) {}

    /// An operation was dispatched onto a processor.
    fn on_dispatched(&self, _op: UniqueOpId, _processor: Processor) {}

    /// An operation moved from one processor's queue to another's.
    fn on_stolen(&self, _op: UniqueOpId, _victim: Processor, _thief: Processor) {}

    /// A mapping attempt failed and will be retried.
    fn on_mapping_retry(&self, _op: UniqueOpId, _attempt: u32) {}

    /// An operation reached a terminal state.
    fn on_completed(&self, _op: UniqueOpId, _timeline: &OperationTimeline) {}

    /// A physical manager was collected.
    fn on_collected(&self, _manager: DistributedId) {}
}

/// Sink that discards every milestone.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProfilingSink;

impl ProfilingSink for NullProfilingSink {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_orders_durations() {
        let mut t = OperationTimeline::default();
        assert_eq!(t.total_time(), None);
        t.mark_issued();
        t.mark_ready();
        t.mark_start();
        t.mark_complete();
        let total = match t.total_time() {
            Some(d) => d,
            None => unreachable!("BUG: complete timeline has a total"),
        };
        for part in [t.wait_time(), t.queue_time(), t.run_time()] {
            match part {
                Some(d) => assert!(d <= total),
                None => unreachable!("BUG: complete timeline has all parts"),
            }
        }
    }

    #[test]
    fn first_stamp_wins() {
        let mut t = OperationTimeline::default();
        t.mark_issued();
        let first = t.issued;
        t.mark_issued();
        assert_eq!(t.issued, first);
    }
}
