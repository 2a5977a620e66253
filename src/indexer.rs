//! The indexing agent: tails the sent-message stream and fans every
//! fragment out to an ordered set of indexes. On construction each index is
//! caught up from its last durably indexed position, so a crash between the
//! journal and an index never requires a rebuild from zero.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::agent::{Agent, BackoffIdleStrategy};
use crate::error::{ErrorSink, Result};
use crate::journal::{FragmentHandler, FrameInfo, Journal, Subscription};

const POLL_LIMIT: usize = 20;

/// One consumer of the indexed fragment stream. The replay index is the
/// primary implementation; metrics or surveillance taps piggyback behind it.
pub trait Index: Send {
    fn on_fragment(&mut self, payload: &[u8], info: &FrameInfo);

    /// Housekeeping slice of the duty cycle.
    fn do_work(&mut self) -> usize {
        0
    }

    /// `(source_id, recording_id, position)` triples this index has durably
    /// indexed, for crash-consistent catch-up.
    fn read_last_positions(&self) -> Vec<(i32, i64, i64)>;

    fn close(&mut self) {}
}

/// Cooperative shutdown signal: set once the gateway has recorded every
/// publisher's final position.
#[derive(Default)]
pub struct CompletionPosition {
    completed: AtomicBool,
    positions: Mutex<HashMap<u32, i64>>,
}

impl CompletionPosition {
    pub fn complete(&self, positions: HashMap<u32, i64>) {
        *self.positions.lock() = positions;
        self.completed.store(true, Ordering::Release);
    }

    pub fn has_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn position_for(&self, source_id: u32) -> Option<i64> {
        self.positions.lock().get(&source_id).copied()
    }
}

pub struct Indexer {
    subscription: Subscription,
    indexes: Vec<Box<dyn Index>>,
    completion: Arc<CompletionPosition>,
    /// Completion was already signalled before catch-up finished; the final
    /// drain in `quiesce` must not run.
    completed_during_start: bool,
}

impl Indexer {
    pub fn new(
        journal: &Arc<Journal>,
        stream_id: u32,
        mut indexes: Vec<Box<dyn Index>>,
        completion: Arc<CompletionPosition>,
        error_sink: &Arc<dyn ErrorSink>,
    ) -> Result<Self> {
        // join the live stream first so nothing published after the stop
        // positions are read can fall between catch-up and live polling
        let subscription = journal.live_subscription(stream_id);
        for index in indexes.iter_mut() {
            if let Err(error) = Self::catch_up(journal, stream_id, index.as_mut()) {
                // an index that cannot catch up starts from live traffic only
                error_sink.on_error(&error);
            }
        }
        let completed_during_start = completion.has_completed();
        Ok(Self {
            subscription,
            indexes,
            completion,
            completed_during_start,
        })
    }

    /// Drain `[indexed position, stop position)` of every recording on the
    /// stream into the index before live polling begins.
    #[tracing::instrument(skip(journal, index))]
    fn catch_up(journal: &Arc<Journal>, stream_id: u32, mut index: &mut dyn Index) -> Result<()> {
        let mut indexed: HashMap<i64, i64> = HashMap::new();
        for (_, recording_id, position) in index.read_last_positions() {
            let entry = indexed.entry(recording_id).or_default();
            *entry = (*entry).max(position);
        }
        for descriptor in journal.recordings(stream_id) {
            let from = indexed
                .get(&descriptor.recording_id)
                .copied()
                .unwrap_or(0);
            let stop = descriptor.stop_position;
            if from >= stop {
                continue;
            }
            tracing::debug!(
                recording_id = descriptor.recording_id,
                from,
                stop,
                "catching up index"
            );
            let mut replay = journal.replay(descriptor.recording_id, from, stop - from)?;
            let mut idle = BackoffIdleStrategy::default();
            let mut handler = FanOut {
                indexes: std::slice::from_mut(&mut index),
            };
            while !replay.is_done() {
                let work = replay.poll(&mut handler, POLL_LIMIT);
                idle.idle(work);
            }
        }
        Ok(())
    }

    fn poll(&mut self, limit: usize) -> usize {
        let mut handler = FanOut {
            indexes: &mut self.indexes,
        };
        self.subscription.poll(&mut handler, limit)
    }

    /// Final drain on shutdown. Fragments past a publisher's recorded
    /// completed position were published after termination began and are
    /// dropped.
    pub fn quiesce(&mut self) {
        if self.completed_during_start {
            return;
        }
        let completion = self.completion.clone();
        let mut handler = BoundedFanOut {
            indexes: &mut self.indexes,
            completion: &completion,
        };
        while self.subscription.poll(&mut handler, POLL_LIMIT) > 0 {}
    }
}

struct FanOut<'a, I: AsMutIndex> {
    indexes: &'a mut [I],
}

/// Lets the fan-out run over both `Box<dyn Index>` lists and a single
/// borrowed index during catch-up.
trait AsMutIndex {
    fn as_mut_index(&mut self) -> &mut dyn Index;
}

impl AsMutIndex for Box<dyn Index> {
    fn as_mut_index(&mut self) -> &mut dyn Index {
        self.as_mut()
    }
}

impl AsMutIndex for &mut dyn Index {
    fn as_mut_index(&mut self) -> &mut dyn Index {
        &mut **self
    }
}

impl<I: AsMutIndex> FragmentHandler for FanOut<'_, I> {
    fn on_fragment(&mut self, payload: &[u8], info: &FrameInfo) {
        for index in self.indexes.iter_mut() {
            index.as_mut_index().on_fragment(payload, info);
        }
    }
}

struct BoundedFanOut<'a> {
    indexes: &'a mut [Box<dyn Index>],
    completion: &'a CompletionPosition,
}

impl FragmentHandler for BoundedFanOut<'_> {
    fn on_fragment(&mut self, payload: &[u8], info: &FrameInfo) {
        if let Some(final_position) = self.completion.position_for(info.source_id) {
            if info.end_position > final_position {
                tracing::debug!(
                    source_id = info.source_id,
                    position = info.end_position,
                    "dropping post-termination fragment"
                );
                return;
            }
        }
        for index in self.indexes.iter_mut() {
            index.on_fragment(payload, info);
        }
    }
}

impl Agent for Indexer {
    fn role_name(&self) -> &'static str {
        "indexer"
    }

    fn do_work(&mut self) -> usize {
        let mut work = self.poll(POLL_LIMIT);
        for index in self.indexes.iter_mut() {
            work += index.do_work();
        }
        work
    }

    fn on_close(&mut self) {
        if self.completion.has_completed() {
            self.quiesce();
        }
        for index in self.indexes.iter_mut() {
            index.close();
        }
    }
}
