//! In-process implementation of the durable ordered log the gateway records
//! to. The real transport is pluggable at deployment; this module provides
//! the exact surface the core consumes: fragmented publication, cursor-based
//! subscription polling, and bounded replay of a recording by id.
//!
//! Each stream owns a sequence of recordings. A recording is an append-only
//! buffer of framed fragments; fragment slots are aligned to
//! [`FRAME_ALIGNMENT`] so positions survive re-framing. A message offered
//! through a publication is written contiguously under the journal lock, so
//! `begin position + aligned length` arithmetic holds across fragments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use zerocopy::byteorder::little_endian::{I32, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};

pub const FRAME_ALIGNMENT: usize = 32;
pub const FRAME_HEADER_LENGTH: usize = std::mem::size_of::<FrameHeader>();
pub const FIX_MESSAGE_HEADER_LENGTH: usize = std::mem::size_of::<FixMessageHeader>();
pub const FIX_MESSAGE_TEMPLATE_ID: u16 = 1;

pub const FLAG_BEGIN: u8 = 0b0000_0001;
pub const FLAG_END: u8 = 0b0000_0010;
pub const FLAG_UNFRAGMENTED: u8 = FLAG_BEGIN | FLAG_END;
/// Slot released by an aborted claim; skipped by pollers.
pub const FLAG_PADDING: u8 = 0b1000_0000;

pub fn align(length: usize) -> usize {
    (length + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageStatus {
    Ok = 0,
    Replayed = 1,
    Invalid = 2,
}

impl MessageStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => MessageStatus::Ok,
            1 => MessageStatus::Replayed,
            _ => MessageStatus::Invalid,
        }
    }
}

/// Framing written ahead of the raw FIX bytes in every published message.
/// Only the first fragment of a message carries it.
#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes, FromZeroes)]
pub struct FixMessageHeader {
    pub block_length: U16,
    pub template_id: U16,
    pub session_id: U64,
    pub sequence_index: I32,
    pub body_length: U32,
    pub status: u8,
    _pad: [u8; 3],
}

impl FixMessageHeader {
    pub fn new(
        session_id: u64,
        sequence_index: i32,
        status: MessageStatus,
        body_length: u32,
    ) -> Self {
        Self {
            block_length: (FIX_MESSAGE_HEADER_LENGTH as u16).into(),
            template_id: FIX_MESSAGE_TEMPLATE_ID.into(),
            session_id: session_id.into(),
            sequence_index: sequence_index.into(),
            body_length: body_length.into(),
            status: status as u8,
            _pad: [0; 3],
        }
    }

    pub fn status(&self) -> MessageStatus {
        MessageStatus::from_u8(self.status)
    }
}

/// Build the payload for one FIX message: framing header plus raw bytes.
pub fn fix_message_payload(
    session_id: u64,
    sequence_index: i32,
    status: MessageStatus,
    fix: &[u8],
) -> Bytes {
    let header = FixMessageHeader::new(session_id, sequence_index, status, fix.len() as u32);
    let mut payload = BytesMut::with_capacity(FIX_MESSAGE_HEADER_LENGTH + fix.len());
    payload.extend_from_slice(header.as_bytes());
    payload.extend_from_slice(fix);
    payload.freeze()
}

#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes, FromZeroes)]
struct FrameHeader {
    /// Header plus payload, before alignment. Zero while a claim is open.
    frame_length: U32,
    flags: u8,
    _pad: [u8; 3],
    source_id: U32,
    stream_id: U32,
}

/// Everything a fragment handler learns about a fragment besides its bytes.
#[derive(Clone, Copy, Debug)]
pub struct FrameInfo {
    pub source_id: u32,
    pub stream_id: u32,
    pub recording_id: i64,
    /// Byte offset of the fragment's slot within the recording.
    pub begin_position: i64,
    /// One past the fragment's aligned slot.
    pub end_position: i64,
    pub flags: u8,
}

impl FrameInfo {
    pub fn is_begin(&self) -> bool {
        self.flags & FLAG_BEGIN != 0
    }

    pub fn is_end(&self) -> bool {
        self.flags & FLAG_END != 0
    }
}

pub trait FragmentHandler {
    fn on_fragment(&mut self, payload: &[u8], info: &FrameInfo);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordingDescriptor {
    pub recording_id: i64,
    pub stream_id: u32,
    pub stop_position: i64,
    pub completed: bool,
}

struct Recording {
    stream_id: u32,
    buf: Vec<u8>,
    completed: bool,
}

impl Recording {
    fn append_fragment(&mut self, source_id: u32, flags: u8, payload: &[u8]) -> i64 {
        let begin = self.buf.len();
        let frame_length = FRAME_HEADER_LENGTH + payload.len();
        let header = FrameHeader {
            frame_length: (frame_length as u32).into(),
            flags,
            _pad: [0; 3],
            source_id: source_id.into(),
            stream_id: self.stream_id.into(),
        };
        self.buf.extend_from_slice(header.as_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(begin + align(frame_length), 0);
        self.buf.len() as i64
    }
}

struct Inner {
    next_recording_id: i64,
    recordings: BTreeMap<i64, Recording>,
    /// Recording ids per stream in creation order; the last one is active
    /// unless completed.
    streams: HashMap<u32, Vec<i64>>,
    max_recording_len: usize,
}

impl Inner {
    fn active_recording(&mut self, stream_id: u32) -> i64 {
        let ids = self.streams.entry(stream_id).or_default();
        if let Some(&last) = ids.last() {
            if !self.recordings[&last].completed {
                return last;
            }
        }
        let id = self.next_recording_id;
        self.next_recording_id += 1;
        self.recordings.insert(
            id,
            Recording {
                stream_id,
                buf: Vec::new(),
                completed: false,
            },
        );
        ids.push(id);
        tracing::debug!(recording_id = id, stream_id, "recording started");
        id
    }
}

pub struct Journal {
    inner: Mutex<Inner>,
}

impl Journal {
    pub fn new(max_recording_len: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                next_recording_id: 1,
                recordings: BTreeMap::new(),
                streams: HashMap::new(),
                max_recording_len,
            }),
        })
    }

    pub fn publication(
        self: &Arc<Self>,
        stream_id: u32,
        source_id: u32,
        max_payload: usize,
    ) -> Publication {
        Publication {
            journal: self.clone(),
            stream_id,
            source_id,
            max_payload,
        }
    }

    pub fn subscription(self: &Arc<Self>, stream_id: u32) -> Subscription {
        Subscription {
            journal: self.clone(),
            stream_id,
            recording_cursor: 0,
            position: 0,
        }
    }

    /// Subscription joined at the stream's current stop position: it sees
    /// only fragments published after this call.
    pub fn live_subscription(self: &Arc<Self>, stream_id: u32) -> Subscription {
        let inner = self.inner.lock();
        let (recording_cursor, position) = match inner.streams.get(&stream_id) {
            Some(ids) if !ids.is_empty() => {
                let last = ids.len() - 1;
                (last, inner.recordings[&ids[last]].buf.len() as i64)
            }
            _ => (0, 0),
        };
        Subscription {
            journal: self.clone(),
            stream_id,
            recording_cursor,
            position,
        }
    }

    pub fn recordings(&self, stream_id: u32) -> Vec<RecordingDescriptor> {
        let inner = self.inner.lock();
        inner
            .streams
            .get(&stream_id)
            .into_iter()
            .flatten()
            .map(|id| {
                let rec = &inner.recordings[id];
                RecordingDescriptor {
                    recording_id: *id,
                    stream_id,
                    stop_position: rec.buf.len() as i64,
                    completed: rec.completed,
                }
            })
            .collect()
    }

    pub fn active_recording(&self, stream_id: u32) -> i64 {
        self.inner.lock().active_recording(stream_id)
    }

    /// Marks the stream's active recording completed; the next publication
    /// starts a fresh one. Returns the completed recording's id.
    pub fn close_recording(&self, stream_id: u32) -> Option<i64> {
        let mut inner = self.inner.lock();
        let id = *inner.streams.get(&stream_id)?.last()?;
        let rec = inner.recordings.get_mut(&id)?;
        if rec.completed {
            return None;
        }
        rec.completed = true;
        tracing::debug!(recording_id = id, stream_id, "recording completed");
        Some(id)
    }

    pub fn stop_position(&self, recording_id: i64) -> Result<i64> {
        let inner = self.inner.lock();
        let rec = inner
            .recordings
            .get(&recording_id)
            .ok_or(Error::UnknownRecording(recording_id))?;
        Ok(rec.buf.len() as i64)
    }

    /// Bounded cursor over `[position, position + length)` of one recording.
    /// `length == i64::MAX` follows the recording open-ended.
    pub fn replay(
        self: &Arc<Self>,
        recording_id: i64,
        position: i64,
        length: i64,
    ) -> Result<Replay> {
        let stream_id = {
            let inner = self.inner.lock();
            inner
                .recordings
                .get(&recording_id)
                .ok_or(Error::UnknownRecording(recording_id))?
                .stream_id
        };
        let end = if length == i64::MAX {
            i64::MAX
        } else {
            position + length
        };
        Ok(Replay {
            journal: self.clone(),
            recording_id,
            stream_id,
            position,
            end,
        })
    }

    /// Raw slot bytes, for re-reading an indexed message.
    pub fn read(&self, recording_id: i64, position: i64, length: i32) -> Result<Bytes> {
        let inner = self.inner.lock();
        let rec = inner
            .recordings
            .get(&recording_id)
            .ok_or(Error::UnknownRecording(recording_id))?;
        if position < 0 || length < 0 {
            return Err(Error::ReadOutOfBounds {
                recording_id,
                position,
                length,
            });
        }
        let begin = position as usize;
        let end = begin + length as usize;
        if end > rec.buf.len() {
            return Err(Error::ReadOutOfBounds {
                recording_id,
                position,
                length,
            });
        }
        Ok(Bytes::copy_from_slice(&rec.buf[begin..end]))
    }
}

fn read_frame(rec: &Recording, position: usize) -> Option<(FrameHeader, usize)> {
    if position + FRAME_HEADER_LENGTH > rec.buf.len() {
        return None;
    }
    let header = FrameHeader::read_from_prefix(&rec.buf[position..])
        .expect("frame header prefix is in bounds");
    let frame_length = header.frame_length.get() as usize;
    if frame_length < FRAME_HEADER_LENGTH {
        // open claim: nothing past this point is visible yet
        return None;
    }
    Some((header, frame_length))
}

pub struct Publication {
    journal: Arc<Journal>,
    stream_id: u32,
    source_id: u32,
    max_payload: usize,
}

impl Publication {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Current stop position of the stream's active recording.
    pub fn position(&self) -> i64 {
        let mut inner = self.journal.inner.lock();
        let id = inner.active_recording(self.stream_id);
        inner.recordings[&id].buf.len() as i64
    }

    /// Publish `payload` as one message, fragmenting past `max_payload`.
    /// Fragments are written contiguously under the journal lock. Returns
    /// the new stop position, or `None` on backpressure.
    pub fn offer(&self, payload: &[u8]) -> Option<i64> {
        let mut inner = self.journal.inner.lock();
        let id = inner.active_recording(self.stream_id);
        let max_recording_len = inner.max_recording_len;
        let rec = inner.recordings.get_mut(&id).expect("active recording");

        let fragments = payload.len().div_ceil(self.max_payload).max(1);
        let slots: usize = payload
            .chunks(self.max_payload)
            .map(|c| align(FRAME_HEADER_LENGTH + c.len()))
            .sum::<usize>()
            .max(align(FRAME_HEADER_LENGTH));
        if rec.buf.len() + slots > max_recording_len {
            tracing::trace!(stream_id = self.stream_id, "publication back-pressured");
            return None;
        }

        let mut end = rec.buf.len() as i64;
        if payload.is_empty() {
            end = rec.append_fragment(self.source_id, FLAG_UNFRAGMENTED, payload);
        } else {
            for (i, chunk) in payload.chunks(self.max_payload).enumerate() {
                let mut flags = 0;
                if i == 0 {
                    flags |= FLAG_BEGIN;
                }
                if i == fragments - 1 {
                    flags |= FLAG_END;
                }
                end = rec.append_fragment(self.source_id, flags, chunk);
            }
        }
        Some(end)
    }

    /// Claim space for a single unfragmented message of `payload_len` bytes.
    /// The claim's buffer is copied into the slot on commit; an uncommitted
    /// claim releases its slot as padding.
    pub fn try_claim(&self, payload_len: usize) -> Option<BufferClaim> {
        if payload_len > self.max_payload {
            return None;
        }
        let mut inner = self.journal.inner.lock();
        let id = inner.active_recording(self.stream_id);
        let max_recording_len = inner.max_recording_len;
        let rec = inner.recordings.get_mut(&id).expect("active recording");

        let frame_length = FRAME_HEADER_LENGTH + payload_len;
        let begin = rec.buf.len();
        if begin + align(frame_length) > max_recording_len {
            return None;
        }
        // reserve the slot with a zero frame length: invisible until commit
        rec.buf.resize(begin + align(frame_length), 0);
        Some(BufferClaim {
            journal: self.journal.clone(),
            recording_id: id,
            stream_id: self.stream_id,
            source_id: self.source_id,
            begin,
            buffer: BytesMut::zeroed(payload_len),
            committed: false,
        })
    }
}

pub struct BufferClaim {
    journal: Arc<Journal>,
    recording_id: i64,
    stream_id: u32,
    source_id: u32,
    begin: usize,
    buffer: BytesMut,
    committed: bool,
}

impl BufferClaim {
    pub fn buffer(&mut self) -> &mut [u8] {
        &mut self.buffer[..]
    }

    fn write_header(&self, flags: u8, payload: &[u8]) {
        let mut inner = self.journal.inner.lock();
        let rec = inner
            .recordings
            .get_mut(&self.recording_id)
            .expect("claimed recording");
        let frame_length = FRAME_HEADER_LENGTH + payload.len();
        let header = FrameHeader {
            frame_length: (frame_length as u32).into(),
            flags,
            _pad: [0; 3],
            source_id: self.source_id.into(),
            stream_id: self.stream_id.into(),
        };
        rec.buf[self.begin..self.begin + FRAME_HEADER_LENGTH]
            .copy_from_slice(header.as_bytes());
        rec.buf[self.begin + FRAME_HEADER_LENGTH..self.begin + frame_length]
            .copy_from_slice(payload);
    }

    /// Publish the claim. This is the final action on the slot: readers see
    /// the frame only once the header lands.
    pub fn commit(mut self) -> i64 {
        let payload = std::mem::take(&mut self.buffer);
        let end = (self.begin + align(FRAME_HEADER_LENGTH + payload.len())) as i64;
        self.write_header(FLAG_UNFRAGMENTED, &payload);
        self.committed = true;
        end
    }

    pub fn abort(self) {
        // Drop releases the slot.
    }
}

impl Drop for BufferClaim {
    fn drop(&mut self) {
        if !self.committed {
            let payload = std::mem::take(&mut self.buffer);
            self.write_header(FLAG_PADDING, &payload);
        }
    }
}

pub struct Subscription {
    journal: Arc<Journal>,
    stream_id: u32,
    recording_cursor: usize,
    position: i64,
}

impl Subscription {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn poll(&mut self, handler: &mut dyn FragmentHandler, limit: usize) -> usize {
        // Fragments are copied out under the lock and dispatched after it is
        // released, so handlers may publish back into the journal.
        let mut batch: Vec<(Bytes, FrameInfo)> = Vec::new();
        {
            let inner = self.journal.inner.lock();
            let ids: &[i64] = inner
                .streams
                .get(&self.stream_id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            while batch.len() < limit && self.recording_cursor < ids.len() {
                let recording_id = ids[self.recording_cursor];
                let rec = &inner.recordings[&recording_id];
                match read_frame(rec, self.position as usize) {
                    Some((header, frame_length)) => {
                        let begin = self.position;
                        let end = begin + align(frame_length) as i64;
                        self.position = end;
                        if header.flags & FLAG_PADDING != 0 {
                            continue;
                        }
                        let payload = Bytes::copy_from_slice(
                            &rec.buf
                                [begin as usize + FRAME_HEADER_LENGTH..begin as usize + frame_length],
                        );
                        batch.push((
                            payload,
                            FrameInfo {
                                source_id: header.source_id.get(),
                                stream_id: self.stream_id,
                                recording_id,
                                begin_position: begin,
                                end_position: end,
                                flags: header.flags,
                            },
                        ));
                    }
                    None => {
                        if rec.completed && self.position as usize >= rec.buf.len() {
                            self.recording_cursor += 1;
                            self.position = 0;
                            continue;
                        }
                        break;
                    }
                }
            }
        }
        for (payload, info) in &batch {
            handler.on_fragment(payload, info);
        }
        batch.len()
    }
}

pub struct Replay {
    journal: Arc<Journal>,
    recording_id: i64,
    stream_id: u32,
    position: i64,
    end: i64,
}

impl Replay {
    pub fn recording_id(&self) -> i64 {
        self.recording_id
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn poll(&mut self, handler: &mut dyn FragmentHandler, limit: usize) -> usize {
        let mut batch: Vec<(Bytes, FrameInfo)> = Vec::new();
        {
            let inner = self.journal.inner.lock();
            let rec = match inner.recordings.get(&self.recording_id) {
                Some(rec) => rec,
                None => return 0,
            };
            while batch.len() < limit && self.position < self.end {
                match read_frame(rec, self.position as usize) {
                    Some((header, frame_length)) => {
                        let begin = self.position;
                        let end = begin + align(frame_length) as i64;
                        self.position = end;
                        if header.flags & FLAG_PADDING != 0 {
                            continue;
                        }
                        let payload = Bytes::copy_from_slice(
                            &rec.buf
                                [begin as usize + FRAME_HEADER_LENGTH..begin as usize + frame_length],
                        );
                        batch.push((
                            payload,
                            FrameInfo {
                                source_id: header.source_id.get(),
                                stream_id: self.stream_id,
                                recording_id: self.recording_id,
                                begin_position: begin,
                                end_position: end,
                                flags: header.flags,
                            },
                        ));
                    }
                    None => break,
                }
            }
        }
        for (payload, info) in &batch {
            handler.on_fragment(payload, info);
        }
        batch.len()
    }

    pub fn is_done(&self) -> bool {
        if self.end != i64::MAX {
            return self.position >= self.end;
        }
        let inner = self.journal.inner.lock();
        match inner.recordings.get(&self.recording_id) {
            Some(rec) => rec.completed && self.position as usize >= rec.buf.len(),
            None => true,
        }
    }
}

/// Reassemble the raw slot bytes of one indexed message back into its
/// framing header and FIX bytes.
pub fn assemble_fix_message(blob: &[u8]) -> Result<(FixMessageHeader, Bytes)> {
    let mut payload = BytesMut::new();
    let mut position = 0;
    while position + FRAME_HEADER_LENGTH <= blob.len() {
        let header = FrameHeader::read_from_prefix(&blob[position..])
            .expect("frame header prefix is in bounds");
        let frame_length = header.frame_length.get() as usize;
        if frame_length < FRAME_HEADER_LENGTH || position + frame_length > blob.len() {
            return Err(Error::MalformedMessage("torn fragment slot"));
        }
        if header.flags & FLAG_PADDING == 0 {
            payload.extend_from_slice(&blob[position + FRAME_HEADER_LENGTH..position + frame_length]);
        }
        position += align(frame_length);
    }
    let payload = payload.freeze();
    let msg = FixMessageHeader::read_from_prefix(&payload)
        .ok_or(Error::MalformedMessage("missing message framing"))?;
    let body_length = msg.body_length.get() as usize;
    if payload.len() < FIX_MESSAGE_HEADER_LENGTH + body_length {
        return Err(Error::MalformedMessage("body shorter than framed length"));
    }
    Ok((
        msg,
        payload.slice(FIX_MESSAGE_HEADER_LENGTH..FIX_MESSAGE_HEADER_LENGTH + body_length),
    ))
}
