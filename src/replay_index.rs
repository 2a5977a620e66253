//! Per-session replay indexes: for every sent message, a fixed-size record
//! mapping `(sequence number, sequence index)` to the byte range of the
//! message in its journal recording.
//!
//! Each `(session id, stream id)` pair owns one memory-mapped ring whose
//! capacity is a power of two. There is exactly one writer (the indexer
//! agent); readers synchronise through a seqlock pair of change counters,
//! never through locks. When the ring wraps, the oldest records are
//! overwritten and resends older than the ring can no longer be served.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicI64, Ordering};
use std::sync::Arc;

use memmap2::{Mmap, MmapMut};
use zerocopy::byteorder::little_endian::{I32, I64, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, ErrorSink, Result};
use crate::fix;
use crate::indexer::Index;
use crate::journal::{
    FixMessageHeader, FrameInfo, MessageStatus, FIX_MESSAGE_HEADER_LENGTH,
    FIX_MESSAGE_TEMPLATE_ID,
};
use crate::sector::crc32;

const SCHEMA_ID: u16 = 102;
const POSITIONS_SCHEMA_ID: u16 = 103;
const TEMPLATE_ID: u16 = 1;
const SCHEMA_VERSION: u16 = 1;

const FILE_HEADER_SIZE: usize = std::mem::size_of::<FileHeader>();
const BEGIN_CHANGE_OFFSET: usize = 8;
const END_CHANGE_OFFSET: usize = 16;
/// Ring records start here; leaves the change counters on their own line.
pub const RECORD_RING_OFFSET: usize = 32;

pub const RECORD_LENGTH: usize = std::mem::size_of::<ReplayIndexRecord>();

const POSITIONS_HEADER_SIZE: usize = 8;
pub const POSITION_RECORD_LENGTH: usize = std::mem::size_of::<IndexedPositionRecord>();
/// CRC covers the record up to the checksum field itself.
const POSITION_CHECKSUM_RANGE: usize = 20;

pub fn replay_index_path(log_dir: &Path, session_id: u64, stream_id: u32) -> PathBuf {
    log_dir.join(format!("replay-index-{session_id}-{stream_id}"))
}

pub fn replay_positions_path(log_dir: &Path, stream_id: u32) -> PathBuf {
    log_dir.join(format!("replay-positions-{stream_id}"))
}

#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes, FromZeroes)]
struct FileHeader {
    schema_id: U16,
    template_id: U16,
    version: U16,
    block_length: U16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct ReplayIndexRecord {
    pub stream_id: I32,
    pub position: I64,
    pub sequence_number: I32,
    pub sequence_index: I32,
    pub recording_id: I64,
    pub length: I32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes, FromZeroes)]
struct IndexedPositionRecord {
    source_id: I32,
    recording_id: I64,
    position: I64,
    checksum: U32,
    reserved: [u8; 8],
}

fn write_file_header(buf: &mut [u8], schema_id: u16, block_length: u16) {
    let header = FileHeader {
        schema_id: schema_id.into(),
        template_id: TEMPLATE_ID.into(),
        version: SCHEMA_VERSION.into(),
        block_length: block_length.into(),
    };
    buf[..FILE_HEADER_SIZE].copy_from_slice(header.as_bytes());
}

fn validate_file_header(buf: &[u8], schema_id: u16, path: &Path) -> Result<()> {
    let header = FileHeader::read_from_prefix(buf).expect("file holds at least a header");
    let found = header.schema_id.get();
    if found != schema_id || header.version.get() != SCHEMA_VERSION {
        return Err(Error::SchemaMismatch {
            path: path.to_path_buf(),
            expected: schema_id,
            found,
        });
    }
    Ok(())
}

/// The change counters live inside the mapping. The mapping is page
/// aligned and both offsets are 8-byte aligned, so the cast is sound; the
/// returned reference borrows the mapping.
fn counter_at(buf: &[u8], offset: usize) -> &AtomicI64 {
    unsafe { &*(buf.as_ptr().add(offset) as *const AtomicI64) }
}

/// Single-writer side of one session's ring.
pub struct SessionIndexWriter {
    mmap: MmapMut,
    capacity: usize,
}

impl SessionIndexWriter {
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(Error::IndexCapacityNotPowerOfTwo(capacity));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let fresh = file.metadata()?.len() == 0;
        file.set_len((RECORD_RING_OFFSET + capacity) as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        if fresh {
            write_file_header(&mut mmap, SCHEMA_ID, RECORD_LENGTH as u16);
            mmap.flush_range(0, RECORD_RING_OFFSET)?;
        } else {
            validate_file_header(&mmap, SCHEMA_ID, path)?;
        }
        let this = Self { mmap, capacity };
        if !fresh {
            // Normalise an inherited ring: pulling both counters back into
            // [0, capacity) stops the first write after reopen from looking
            // like a wrap to readers.
            let begin = this.begin_change().load(Ordering::Relaxed);
            let normalised = begin & (capacity as i64 - 1);
            this.begin_change().store(normalised, Ordering::Relaxed);
            this.end_change().store(normalised, Ordering::Release);
        }
        Ok(this)
    }

    fn begin_change(&self) -> &AtomicI64 {
        counter_at(&self.mmap, BEGIN_CHANGE_OFFSET)
    }

    fn end_change(&self) -> &AtomicI64 {
        counter_at(&self.mmap, END_CHANGE_OFFSET)
    }

    /// Stage one record: publish the new tail optimistically, fence, then
    /// store the record bytes. Readers treat everything at or past the
    /// staged tail as in flux until [`commit_write`](Self::commit_write).
    pub fn begin_write(&mut self, record: &ReplayIndexRecord) -> i64 {
        let begin = self.begin_change().load(Ordering::Relaxed);
        let tail = begin + RECORD_LENGTH as i64;
        self.begin_change().store(tail, Ordering::Release);
        fence(Ordering::SeqCst);
        let offset = RECORD_RING_OFFSET + (begin as usize & (self.capacity - 1));
        // bulk store; the tail advance above is the only ordering point
        // readers synchronise with
        unsafe {
            std::ptr::copy_nonoverlapping(
                record.as_bytes().as_ptr(),
                self.mmap.as_mut_ptr().add(offset),
                RECORD_LENGTH,
            );
        }
        tail
    }

    pub fn commit_write(&mut self, tail: i64) {
        self.end_change().store(tail, Ordering::Release);
    }
}

impl Drop for SessionIndexWriter {
    fn drop(&mut self) {
        let _ = self.mmap.flush();
    }
}

/// Reader side; many may exist concurrently with the single writer.
pub struct SessionIndexReader {
    mmap: Mmap,
    capacity: usize,
}

impl SessionIndexReader {
    /// `Ok(None)` when the session has never been indexed on this stream.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len() as usize;
        let capacity = len.saturating_sub(RECORD_RING_OFFSET);
        if !capacity.is_power_of_two() {
            return Err(Error::IndexCapacityNotPowerOfTwo(capacity));
        }
        let mmap = unsafe { Mmap::map(&file)? };
        validate_file_header(&mmap, SCHEMA_ID, path)?;
        Ok(Some(Self { mmap, capacity }))
    }

    fn begin_change(&self) -> &AtomicI64 {
        counter_at(&self.mmap, BEGIN_CHANGE_OFFSET)
    }

    fn end_change(&self) -> &AtomicI64 {
        counter_at(&self.mmap, END_CHANGE_OFFSET)
    }

    /// All committed records with `begin_seq <= sequence_number <= end_seq`,
    /// ascending by `(sequence_index, sequence_number)`. A record whose ring
    /// slot is reclaimed mid-read invalidates the snapshot and the scan
    /// retries.
    pub fn query(&self, begin_seq: i32, end_seq: i32) -> Vec<ReplayIndexRecord> {
        'snapshot: loop {
            let end = self.end_change().load(Ordering::Acquire);
            let window_begin = (end - self.capacity as i64).max(0);
            let mut matches = Vec::new();
            let mut position = window_begin;
            while position < end {
                let offset = RECORD_RING_OFFSET + (position as usize & (self.capacity - 1));
                let record =
                    ReplayIndexRecord::read_from(&self.mmap[offset..offset + RECORD_LENGTH])
                        .expect("ring slot is record sized");
                let begin = self.begin_change().load(Ordering::Acquire);
                if begin > position + self.capacity as i64 {
                    // writer lapped this slot while we were reading it
                    continue 'snapshot;
                }
                let sequence_number = record.sequence_number.get();
                if sequence_number >= begin_seq
                    && sequence_number <= end_seq
                    && record.length.get() > 0
                {
                    matches.push(record);
                }
                position += RECORD_LENGTH as i64;
            }
            matches.sort_by_key(|r| (r.sequence_index.get(), r.sequence_number.get()));
            return matches;
        }
    }
}

/// Tracks, per `(source id, recording id)`, the highest journal position
/// whose indexing has completed. Written after every index record so a
/// restart resumes from here instead of rebuilding.
pub struct IndexedPositionWriter {
    mmap: MmapMut,
    slots: usize,
    by_key: HashMap<(i32, i64), usize>,
}

impl IndexedPositionWriter {
    pub fn open(path: &Path, slots: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let fresh = file.metadata()?.len() == 0;
        file.set_len((POSITIONS_HEADER_SIZE + slots * POSITION_RECORD_LENGTH) as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        if fresh {
            write_file_header(&mut mmap, POSITIONS_SCHEMA_ID, POSITION_RECORD_LENGTH as u16);
            mmap.flush_range(0, POSITIONS_HEADER_SIZE)?;
        } else {
            validate_file_header(&mmap, POSITIONS_SCHEMA_ID, path)?;
        }

        let mut by_key = HashMap::new();
        for slot in 0..slots {
            let offset = POSITIONS_HEADER_SIZE + slot * POSITION_RECORD_LENGTH;
            let record = IndexedPositionRecord::read_from(
                &mmap[offset..offset + POSITION_RECORD_LENGTH],
            )
            .expect("slot is record sized");
            if record.checksum.get() == crc32(&mmap[offset..offset + POSITION_CHECKSUM_RANGE]) {
                by_key.insert(
                    (record.source_id.get(), record.recording_id.get()),
                    slot,
                );
            }
        }
        Ok(Self {
            mmap,
            slots,
            by_key,
        })
    }

    pub fn indexed_up_to(
        &mut self,
        source_id: i32,
        recording_id: i64,
        position: i64,
    ) -> Result<()> {
        let slot = match self.by_key.get(&(source_id, recording_id)) {
            Some(slot) => *slot,
            None => {
                let slot = self.free_slot().ok_or(Error::OutOfSpace)?;
                self.by_key.insert((source_id, recording_id), slot);
                slot
            }
        };
        let offset = POSITIONS_HEADER_SIZE + slot * POSITION_RECORD_LENGTH;
        let mut record = IndexedPositionRecord {
            source_id: source_id.into(),
            recording_id: recording_id.into(),
            position: position.into(),
            checksum: 0.into(),
            reserved: [0; 8],
        };
        let checksum = crc32(&record.as_bytes()[..POSITION_CHECKSUM_RANGE]);
        record.checksum = checksum.into();
        self.mmap[offset..offset + POSITION_RECORD_LENGTH].copy_from_slice(record.as_bytes());
        self.mmap.flush_range(offset, POSITION_RECORD_LENGTH)?;
        Ok(())
    }

    fn free_slot(&self) -> Option<usize> {
        let used: std::collections::HashSet<usize> = self.by_key.values().copied().collect();
        (0..self.slots).find(|slot| !used.contains(slot))
    }
}

/// Catch-up side reader of a positions file.
pub struct IndexedPositionReader {
    mmap: Mmap,
    slots: usize,
}

impl IndexedPositionReader {
    pub fn open(path: &Path) -> Result<Option<Self>> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len() as usize;
        let mmap = unsafe { Mmap::map(&file)? };
        validate_file_header(&mmap, POSITIONS_SCHEMA_ID, path)?;
        Ok(Some(Self {
            mmap,
            slots: len.saturating_sub(POSITIONS_HEADER_SIZE) / POSITION_RECORD_LENGTH,
        }))
    }

    /// Yield every valid `(source_id, recording_id, position)` triple.
    /// Records that fail their checksum are skipped.
    pub fn read_last_position(&self, consumer: &mut dyn FnMut(i32, i64, i64)) {
        for slot in 0..self.slots {
            let offset = POSITIONS_HEADER_SIZE + slot * POSITION_RECORD_LENGTH;
            let record = IndexedPositionRecord::read_from(
                &self.mmap[offset..offset + POSITION_RECORD_LENGTH],
            )
            .expect("slot is record sized");
            if record.checksum.get()
                != crc32(&self.mmap[offset..offset + POSITION_CHECKSUM_RANGE])
            {
                continue;
            }
            consumer(
                record.source_id.get(),
                record.recording_id.get(),
                record.position.get(),
            );
        }
    }
}

/// Bounded set-associative cache of open per-session index writers. A hit
/// moves the entry to the front of its set; a miss evicts the set's least
/// recently used way, unmapping the victim's file.
pub struct SessionIndexCache {
    sets: usize,
    ways: usize,
    slots: Vec<Option<(u64, SessionIndexWriter)>>,
}

impl SessionIndexCache {
    pub fn new(sets: usize, ways: usize) -> Self {
        assert!(sets.is_power_of_two(), "cache sets must be a power of two");
        let mut slots = Vec::new();
        slots.resize_with(sets * ways, || None);
        Self { sets, ways, slots }
    }

    pub fn get_or_insert(
        &mut self,
        session_id: u64,
        open: impl FnOnce() -> Result<SessionIndexWriter>,
    ) -> Result<&mut SessionIndexWriter> {
        let base = (session_id as usize & (self.sets - 1)) * self.ways;
        let set = base..base + self.ways;
        if let Some(way) = self.slots[set.clone()]
            .iter()
            .position(|slot| matches!(slot, Some((id, _)) if *id == session_id))
        {
            self.slots[base..=base + way].rotate_right(1);
        } else {
            let writer = open()?;
            self.slots[set].rotate_right(1);
            if let Some((evicted, _)) = self.slots[base].replace((session_id, writer)) {
                tracing::debug!(session_id = evicted, "session index evicted");
            }
        }
        Ok(&mut self.slots[base].as_mut().expect("slot just filled").1)
    }

    pub fn close(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

struct ContinuedMessage {
    indexable: bool,
    session_id: u64,
    sequence_number: i32,
    sequence_index: i32,
    begin_position: i64,
}

/// The primary [`Index`]: writes one replay record per completed sent
/// message into the owning session's ring.
pub struct ReplayIndex {
    log_dir: PathBuf,
    stream_id: u32,
    capacity: usize,
    cache: SessionIndexCache,
    positions: IndexedPositionWriter,
    /// Fragmentation state of the message currently in flight. Per-agent:
    /// the indexer owns exactly one of these.
    continued: Option<ContinuedMessage>,
    error_sink: Arc<dyn ErrorSink>,
}

impl ReplayIndex {
    pub fn new(
        log_dir: &Path,
        stream_id: u32,
        capacity: usize,
        cache_sets: usize,
        cache_ways: usize,
        position_slots: usize,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(Error::IndexCapacityNotPowerOfTwo(capacity));
        }
        std::fs::create_dir_all(log_dir)?;
        let positions =
            IndexedPositionWriter::open(&replay_positions_path(log_dir, stream_id), position_slots)?;
        Ok(Self {
            log_dir: log_dir.to_path_buf(),
            stream_id,
            capacity,
            cache: SessionIndexCache::new(cache_sets, cache_ways),
            positions,
            continued: None,
            error_sink,
        })
    }

    fn index_completed_message(&mut self, message: ContinuedMessage, info: &FrameInfo) {
        let length = info.end_position - message.begin_position;
        let record = ReplayIndexRecord {
            stream_id: (info.stream_id as i32).into(),
            position: message.begin_position.into(),
            sequence_number: message.sequence_number.into(),
            sequence_index: message.sequence_index.into(),
            recording_id: info.recording_id.into(),
            length: (length as i32).into(),
        };
        let path = replay_index_path(&self.log_dir, message.session_id, self.stream_id);
        let capacity = self.capacity;
        let writer = match self
            .cache
            .get_or_insert(message.session_id, || SessionIndexWriter::open(&path, capacity))
        {
            Ok(writer) => writer,
            Err(error) => {
                self.error_sink.on_error(&error);
                return;
            }
        };
        let tail = writer.begin_write(&record);
        // durable progress lands between the record store and its commit
        if let Err(error) =
            self.positions
                .indexed_up_to(info.source_id as i32, info.recording_id, info.end_position)
        {
            self.error_sink.on_error(&error);
        }
        writer.commit_write(tail);
        tracing::trace!(
            session_id = message.session_id,
            sequence_number = message.sequence_number,
            position = message.begin_position,
            length,
            "indexed"
        );
    }
}

impl Index for ReplayIndex {
    fn on_fragment(&mut self, payload: &[u8], info: &FrameInfo) {
        if info.is_begin() {
            // only the first fragment carries the framing and FIX header
            self.continued = match FixMessageHeader::read_from_prefix(payload) {
                Some(message) if message.template_id.get() == FIX_MESSAGE_TEMPLATE_ID => {
                    let fix_bytes = &payload[FIX_MESSAGE_HEADER_LENGTH..];
                    let sequence_number = fix::scan(fix_bytes)
                        .msg_seq_num
                        .and_then(|f| fix::parse_int(f.value(fix_bytes)))
                        .unwrap_or(0) as i32;
                    Some(ContinuedMessage {
                        indexable: message.status() == MessageStatus::Ok && sequence_number > 0,
                        session_id: message.session_id.get(),
                        sequence_number,
                        sequence_index: message.sequence_index.get(),
                        begin_position: info.begin_position,
                    })
                }
                // not a FIX message; remember to skip its continuations
                _ => Some(ContinuedMessage {
                    indexable: false,
                    session_id: 0,
                    sequence_number: 0,
                    sequence_index: 0,
                    begin_position: info.begin_position,
                }),
            };
        }
        if info.is_end() {
            let Some(message) = self.continued.take() else {
                return;
            };
            if message.indexable {
                self.index_completed_message(message, info);
            }
        }
    }

    fn read_last_positions(&self) -> Vec<(i32, i64, i64)> {
        let mut out = Vec::new();
        match IndexedPositionReader::open(&replay_positions_path(&self.log_dir, self.stream_id)) {
            Ok(Some(reader)) => {
                reader.read_last_position(&mut |source_id, recording_id, position| {
                    out.push((source_id, recording_id, position));
                });
            }
            Ok(None) => {}
            Err(error) => self.error_sink.on_error(&error),
        }
        out
    }

    fn close(&mut self) {
        self.cache.close();
    }
}
