//! Offline archive queries: enumerate a stream's recordings and replay
//! every recorded FIX message, reassembled from its fragments, into a
//! consumer. Runs outside the engine's duty cycles, typically from an
//! operator tool.

use std::sync::Arc;

use crate::agent::BackoffIdleStrategy;
use crate::config::Config;
use crate::error::Result;
use crate::journal::{
    FixMessageHeader, FragmentHandler, FrameInfo, Journal, FIX_MESSAGE_HEADER_LENGTH,
    FIX_MESSAGE_TEMPLATE_ID,
};
use zerocopy::FromBytes;

const POLL_LIMIT: usize = 20;

/// Which side of the gateway to read back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanDirection {
    Sent,
    Received,
}

impl ScanDirection {
    pub fn stream_id(&self, config: &Config) -> u32 {
        match self {
            ScanDirection::Sent => config.outbound_stream_id,
            ScanDirection::Received => config.inbound_stream_id,
        }
    }
}

pub trait FixMessageConsumer {
    fn on_message(&mut self, header: &FixMessageHeader, fix: &[u8], info: &FrameInfo);
}

/// Reassembles fragmented messages before handing them to the consumer.
/// Fragments of non-FIX messages are dropped once the message completes.
pub struct FragmentAssembler<'a> {
    consumer: &'a mut dyn FixMessageConsumer,
    buffer: Vec<u8>,
    in_flight: bool,
}

impl<'a> FragmentAssembler<'a> {
    pub fn new(consumer: &'a mut dyn FixMessageConsumer) -> Self {
        Self {
            consumer,
            buffer: Vec::new(),
            in_flight: false,
        }
    }
}

impl FragmentHandler for FragmentAssembler<'_> {
    fn on_fragment(&mut self, payload: &[u8], info: &FrameInfo) {
        if info.is_begin() {
            self.buffer.clear();
            self.in_flight = true;
        }
        if !self.in_flight {
            return;
        }
        self.buffer.extend_from_slice(payload);
        if info.is_end() {
            self.in_flight = false;
            let Some(header) = FixMessageHeader::read_from_prefix(&self.buffer) else {
                return;
            };
            if header.template_id.get() != FIX_MESSAGE_TEMPLATE_ID {
                return;
            }
            let body_length = header.body_length.get() as usize;
            if self.buffer.len() < FIX_MESSAGE_HEADER_LENGTH + body_length {
                return;
            }
            let fix = &self.buffer[FIX_MESSAGE_HEADER_LENGTH..FIX_MESSAGE_HEADER_LENGTH + body_length];
            self.consumer.on_message(&header, fix, info);
        }
    }
}

pub struct ArchiveScanner {
    journal: Arc<Journal>,
    config: Config,
}

impl ArchiveScanner {
    pub fn new(journal: Arc<Journal>, config: Config) -> Self {
        Self { journal, config }
    }

    /// Replay every recording of the chosen stream into `consumer`,
    /// completed recordings first, the still-active one last. Without
    /// `follow` the active recording is bounded by its stop position as of
    /// this call; with `follow` it is tailed until it completes. Returns
    /// the number of messages delivered.
    #[tracing::instrument(skip(self, consumer))]
    pub fn scan(
        &self,
        direction: ScanDirection,
        follow: bool,
        consumer: &mut dyn FixMessageConsumer,
    ) -> Result<usize> {
        let stream_id = direction.stream_id(&self.config);
        let mut recordings = self.journal.recordings(stream_id);
        recordings.sort_by_key(|r| (!r.completed, r.recording_id));

        let mut counting = CountingConsumer { inner: consumer, count: 0 };
        for descriptor in recordings {
            let open_ended = follow && !descriptor.completed;
            let length = if open_ended {
                i64::MAX
            } else {
                descriptor.stop_position
            };
            tracing::debug!(
                recording_id = descriptor.recording_id,
                length,
                open_ended,
                "replaying recording"
            );
            let mut replay = self.journal.replay(descriptor.recording_id, 0, length)?;
            let mut assembler = FragmentAssembler::new(&mut counting);
            let mut idle = BackoffIdleStrategy::default();
            while !replay.is_done() {
                let work = replay.poll(&mut assembler, POLL_LIMIT);
                idle.idle(work);
            }
        }
        Ok(counting.count)
    }
}

struct CountingConsumer<'a> {
    inner: &'a mut dyn FixMessageConsumer,
    count: usize,
}

impl FixMessageConsumer for CountingConsumer<'_> {
    fn on_message(&mut self, header: &FixMessageHeader, fix: &[u8], info: &FrameInfo) {
        self.count += 1;
        self.inner.on_message(header, fix, info);
    }
}
