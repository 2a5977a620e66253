//! Durable session identity store: maps the FIX composite identity of a
//! counterparty to the numeric session id used everywhere else in the
//! engine, persisted in a sector-checksummed memory-mapped file.
//!
//! The file is append-only. Records are written once on first logon; only
//! the `sequence_index` and `logon_time` fields of a record are ever
//! rewritten in place. Recovery replays the file into memory and resumes
//! the id counter at `max(persisted) + 1`.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::MmapMut;
use zerocopy::byteorder::little_endian::{I32, I64, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, ErrorSink, Result};
use crate::fix::{self, HeaderFields};
use crate::sector::{self, SectorFramer, SECTOR_SIZE};

pub const NO_LOGON_TIME: i64 = i64::MIN;
pub const UNKNOWN_SEQUENCE_INDEX: i32 = -1;

const SCHEMA_ID: u16 = 101;
const TEMPLATE_ID: u16 = 1;
const SCHEMA_VERSION: u16 = 1;

pub const HEADER_SIZE: usize = std::mem::size_of::<FileHeader>();
pub const BLOCK_LENGTH: usize = std::mem::size_of::<RecordHeader>();

#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes, FromZeroes)]
struct FileHeader {
    schema_id: U16,
    template_id: U16,
    version: U16,
    block_length: U16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes, FromZeroes)]
struct RecordHeader {
    session_id: U64,
    sequence_index: I32,
    logon_time: I64,
    composite_key_length: U32,
}

/// The six identity components of a FIX session. Equality is exact byte
/// equality per component.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub sender_comp_id: Vec<u8>,
    pub sender_sub_id: Vec<u8>,
    pub sender_location_id: Vec<u8>,
    pub target_comp_id: Vec<u8>,
    pub target_sub_id: Vec<u8>,
    pub target_location_id: Vec<u8>,
}

impl CompositeKey {
    pub fn new(sender_comp_id: &[u8], target_comp_id: &[u8]) -> Self {
        Self {
            sender_comp_id: sender_comp_id.to_vec(),
            target_comp_id: target_comp_id.to_vec(),
            ..Self::default()
        }
    }

    /// Identity of a sent Logon, read from its standard header.
    pub fn from_header_fields(fields: &HeaderFields, buf: &[u8]) -> Self {
        let get = |f: Option<fix::Field>| f.map(|f| f.value(buf).to_vec()).unwrap_or_default();
        Self {
            sender_comp_id: get(fields.sender_comp_id),
            sender_sub_id: get(fields.sender_sub_id),
            sender_location_id: get(fields.sender_location_id),
            target_comp_id: get(fields.target_comp_id),
            target_sub_id: get(fields.target_sub_id),
            target_location_id: get(fields.target_location_id),
        }
    }

    fn components(&self) -> [&[u8]; 6] {
        [
            &self.sender_comp_id,
            &self.sender_sub_id,
            &self.sender_location_id,
            &self.target_comp_id,
            &self.target_sub_id,
            &self.target_location_id,
        ]
    }

    pub fn encoded_len(&self) -> usize {
        6 + self.components().iter().map(|c| c.len()).sum::<usize>()
    }

    /// One length-prefixed byte string per component.
    fn encode_into(&self, out: &mut [u8]) -> Result<()> {
        let mut at = 0;
        for component in self.components() {
            if component.len() > u8::MAX as usize {
                return Err(Error::CompositeKeyTooLarge(self.encoded_len()));
            }
            out[at] = component.len() as u8;
            at += 1;
            out[at..at + component.len()].copy_from_slice(component);
            at += component.len();
        }
        debug_assert_eq!(at, self.encoded_len());
        Ok(())
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        let mut key = Self::default();
        let mut at = 0;
        {
            let mut components = [
                &mut key.sender_comp_id,
                &mut key.sender_sub_id,
                &mut key.sender_location_id,
                &mut key.target_comp_id,
                &mut key.target_sub_id,
                &mut key.target_location_id,
            ];
            for component in components.iter_mut() {
                let len = *buf.get(at)? as usize;
                at += 1;
                if at + len > buf.len() {
                    return None;
                }
                component.extend_from_slice(&buf[at..at + len]);
                at += len;
            }
        }
        (at == buf.len()).then_some(key)
    }
}

/// In-memory view of one session's persisted identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: u64,
    pub sequence_index: i32,
    pub logon_time: i64,
    /// Byte offset of the record in the contexts file; `None` when the
    /// store was out of space and the session runs non-durable.
    pub file_position: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogonOutcome {
    Accepted(SessionContext),
    /// The composite key resolved to a session id that is already
    /// authenticated on another connection.
    Duplicate,
}

impl LogonOutcome {
    pub fn context(self) -> Option<SessionContext> {
        match self {
            LogonOutcome::Accepted(ctx) => Some(ctx),
            LogonOutcome::Duplicate => None,
        }
    }
}

pub struct SessionContexts {
    mmap: MmapMut,
    path: PathBuf,
    capacity: usize,
    framer: SectorFramer,
    /// Next session id to assign.
    counter: u64,
    /// Next free byte in the file's record space.
    write_position: usize,
    by_key: HashMap<CompositeKey, SessionContext>,
    key_by_id: HashMap<u64, CompositeKey>,
    recorded_sessions: HashSet<u64>,
    authenticated: HashSet<u64>,
    error_sink: Arc<dyn ErrorSink>,
}

impl SessionContexts {
    #[tracing::instrument(skip(error_sink), err)]
    pub fn open(path: &Path, file_size: usize, error_sink: Arc<dyn ErrorSink>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let existing_len = file.metadata()?.len() as usize;
        let fresh = existing_len == 0;
        let capacity = if fresh {
            let capacity = file_size - file_size % SECTOR_SIZE;
            file.set_len(capacity as u64)?;
            capacity
        } else {
            existing_len - existing_len % SECTOR_SIZE
        };
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let mut this = Self {
            mmap,
            path: path.to_path_buf(),
            capacity,
            framer: SectorFramer::new(capacity),
            counter: 1,
            write_position: HEADER_SIZE,
            by_key: HashMap::new(),
            key_by_id: HashMap::new(),
            recorded_sessions: HashSet::new(),
            authenticated: HashSet::new(),
            error_sink,
        };
        if fresh {
            this.write_header()?;
        } else {
            this.validate_header()?;
            this.recover();
        }
        Ok(this)
    }

    fn write_header(&mut self) -> Result<()> {
        let header = FileHeader {
            schema_id: SCHEMA_ID.into(),
            template_id: TEMPLATE_ID.into(),
            version: SCHEMA_VERSION.into(),
            block_length: (BLOCK_LENGTH as u16).into(),
        };
        self.mmap[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        sector::reframe_sector(&mut self.mmap, 0);
        self.mmap.flush_range(0, SECTOR_SIZE)?;
        Ok(())
    }

    fn validate_header(&self) -> Result<()> {
        let header =
            FileHeader::read_from_prefix(&self.mmap[..]).expect("file is at least one sector");
        let found = header.schema_id.get();
        if found != SCHEMA_ID || header.version.get() != SCHEMA_VERSION {
            return Err(Error::SchemaMismatch {
                path: self.path.clone(),
                expected: SCHEMA_ID,
                found,
            });
        }
        Ok(())
    }

    /// Replay the file into memory. Corrupt sectors are reported through the
    /// error sink but do not stop the scan.
    #[tracing::instrument(skip_all)]
    fn recover(&mut self) {
        let mut position = HEADER_SIZE;
        let mut validated_sector = usize::MAX;
        loop {
            if position + BLOCK_LENGTH > SectorFramer::checksum_offset(position) {
                position = SectorFramer::sector_start(position) + SECTOR_SIZE;
            }
            if position + BLOCK_LENGTH > self.capacity {
                break;
            }

            let sector_start = SectorFramer::sector_start(position);
            if sector_start != validated_sector {
                validated_sector = sector_start;
                let data = &self.mmap[sector_start..sector_start + sector::SECTOR_DATA_LENGTH];
                if data.iter().any(|b| *b != 0) {
                    if let Err(error) = sector::validate_sector(&self.mmap, position) {
                        self.error_sink.on_error(&error);
                    }
                }
            }

            let header = RecordHeader::read_from_prefix(&self.mmap[position..])
                .expect("record header fits before the sector trailer");
            let session_id = header.session_id.get();
            if session_id == 0 {
                // end of data within this sector; a record may continue at
                // the start of the next one
                let next = sector_start + SECTOR_SIZE;
                if next + BLOCK_LENGTH > self.capacity {
                    break;
                }
                let peek = RecordHeader::read_from_prefix(&self.mmap[next..])
                    .expect("record header fits before the sector trailer");
                if peek.session_id.get() == 0 {
                    break;
                }
                position = next;
                continue;
            }

            let key_length = header.composite_key_length.get() as usize;
            let key_end = position + BLOCK_LENGTH + key_length;
            if key_end > SectorFramer::checksum_offset(position) {
                self.error_sink
                    .on_error(&Error::MalformedContextRecord { position });
                break;
            }
            match CompositeKey::decode(&self.mmap[position + BLOCK_LENGTH..key_end]) {
                Some(key) => {
                    let context = SessionContext {
                        session_id,
                        sequence_index: header.sequence_index.get(),
                        logon_time: header.logon_time.get(),
                        file_position: Some(position as u32),
                    };
                    self.key_by_id.insert(session_id, key.clone());
                    self.by_key.insert(key, context);
                    self.recorded_sessions.insert(session_id);
                    self.counter = self.counter.max(session_id + 1);
                }
                None => {
                    self.error_sink
                        .on_error(&Error::MalformedContextRecord { position });
                    break;
                }
            }
            position = key_end;
        }
        self.write_position = position;
        tracing::debug!(
            sessions = self.by_key.len(),
            next_session_id = self.counter,
            "session contexts recovered"
        );
    }

    /// First logon of a connection. Allocates and persists a new context for
    /// an unknown key; refuses a key whose session id is already
    /// authenticated elsewhere.
    pub fn on_logon(&mut self, key: CompositeKey, logon_time: i64) -> LogonOutcome {
        let context = match self.by_key.get(&key).cloned() {
            Some(mut context) => {
                context.logon_time = logon_time;
                if let Some(position) = context.file_position {
                    self.update_saved_data(position, context.sequence_index, logon_time);
                }
                self.by_key.insert(key, context.clone());
                context
            }
            None => {
                let session_id = self.counter;
                self.counter += 1;
                let file_position = self.persist(&key, session_id, 0, logon_time);
                let context = SessionContext {
                    session_id,
                    sequence_index: 0,
                    logon_time,
                    file_position,
                };
                self.by_key.insert(key.clone(), context.clone());
                self.key_by_id.insert(session_id, key);
                context
            }
        };
        if !self.authenticated.insert(context.session_id) {
            tracing::debug!(session_id = context.session_id, "duplicate logon refused");
            return LogonOutcome::Duplicate;
        }
        LogonOutcome::Accepted(context)
    }

    pub fn on_disconnect(&mut self, session_id: u64) {
        self.authenticated.remove(&session_id);
    }

    /// The session's sequence numbers restart at 1; bump the sequence index
    /// so replay can tell the epochs apart.
    pub fn sequence_reset(&mut self, session_id: u64) {
        let Some(key) = self.key_by_id.get(&session_id).cloned() else {
            return;
        };
        let Some(context) = self.by_key.get_mut(&key) else {
            return;
        };
        context.sequence_index += 1;
        let (file_position, sequence_index, logon_time) = (
            context.file_position,
            context.sequence_index,
            context.logon_time,
        );
        if let Some(position) = file_position {
            self.update_saved_data(position, sequence_index, logon_time);
        }
    }

    /// Rewrite the two mutable fields of a persisted record and reseal its
    /// sector.
    pub fn update_saved_data(&mut self, file_position: u32, sequence_index: i32, logon_time: i64) {
        let at = file_position as usize;
        self.mmap[at + 8..at + 12].copy_from_slice(&sequence_index.to_le_bytes());
        self.mmap[at + 12..at + 20].copy_from_slice(&logon_time.to_le_bytes());
        sector::reframe_sector(&mut self.mmap, at);
        self.force(at);
    }

    /// Follower-side bookkeeping: a sent message observed on the cluster
    /// stream may be a Logon carrying a session id the leader chose.
    pub fn on_sent_follower_message(
        &mut self,
        session_id: u64,
        sequence_index: i32,
        fix: &[u8],
    ) {
        let fields = fix::scan(fix);
        if !fields.is_message_type(fix, fix::MSG_TYPE_LOGON) {
            return;
        }
        self.on_sent_follower_logon(&fields, fix, session_id, sequence_index);
    }

    pub fn on_sent_follower_logon(
        &mut self,
        fields: &HeaderFields,
        fix: &[u8],
        session_id: u64,
        sequence_index: i32,
    ) {
        let key = CompositeKey::from_header_fields(fields, fix);
        match self.by_key.get_mut(&key) {
            Some(context) => {
                context.sequence_index = sequence_index;
                let (file_position, logon_time) = (context.file_position, context.logon_time);
                if let Some(position) = file_position {
                    self.update_saved_data(position, sequence_index, logon_time);
                }
            }
            None => {
                let file_position = self.persist(&key, session_id, sequence_index, NO_LOGON_TIME);
                let context = SessionContext {
                    session_id,
                    sequence_index,
                    logon_time: NO_LOGON_TIME,
                    file_position,
                };
                self.by_key.insert(key.clone(), context);
                self.key_by_id.insert(session_id, key);
            }
        }
        // a later leadership takeover must not re-assign this id
        self.counter = self.counter.max(session_id + 1);
    }

    pub fn lookup_session_id(&self, key: &CompositeKey) -> Option<u64> {
        self.by_key.get(key).map(|c| c.session_id)
    }

    pub fn is_authenticated(&self, session_id: u64) -> bool {
        self.authenticated.contains(&session_id)
    }

    pub fn is_known_session_id(&self, session_id: u64) -> bool {
        self.key_by_id.contains_key(&session_id)
    }

    pub fn has_recorded_session(&self, session_id: u64) -> bool {
        self.recorded_sessions.contains(&session_id)
    }

    /// Copy the file aside and re-initialise. Refused while any session is
    /// authenticated.
    #[tracing::instrument(skip(self), err)]
    pub fn reset(&mut self, backup: &Path) -> Result<()> {
        if !self.authenticated.is_empty() {
            return Err(Error::SessionsStillAuthenticated(self.authenticated.len()));
        }
        self.mmap.flush()?;
        std::fs::copy(&self.path, backup)?;
        self.mmap.fill(0);
        self.write_header()?;
        self.mmap.flush()?;
        self.by_key.clear();
        self.key_by_id.clear();
        self.recorded_sessions.clear();
        self.counter = 1;
        self.write_position = HEADER_SIZE;
        Ok(())
    }

    fn persist(
        &mut self,
        key: &CompositeKey,
        session_id: u64,
        sequence_index: i32,
        logon_time: i64,
    ) -> Option<u32> {
        let key_length = key.encoded_len();
        let total = BLOCK_LENGTH + key_length;
        let position = match self.framer.claim(self.write_position, total) {
            Ok(position) => position,
            Err(error) => {
                tracing::warn!(session_id, %error, "session context not persisted");
                self.error_sink.on_error(&error);
                return None;
            }
        };
        let header = RecordHeader {
            session_id: session_id.into(),
            sequence_index: sequence_index.into(),
            logon_time: logon_time.into(),
            composite_key_length: (key_length as u32).into(),
        };
        self.mmap[position..position + BLOCK_LENGTH].copy_from_slice(header.as_bytes());
        if let Err(error) =
            key.encode_into(&mut self.mmap[position + BLOCK_LENGTH..position + total])
        {
            self.mmap[position..position + total].fill(0);
            sector::reframe_sector(&mut self.mmap, position);
            self.error_sink.on_error(&error);
            return None;
        }
        sector::reframe_sector(&mut self.mmap, position);
        self.force(position);
        self.write_position = position + total;
        self.recorded_sessions.insert(session_id);
        Some(position as u32)
    }

    fn force(&self, position: usize) {
        let start = SectorFramer::sector_start(position);
        if let Err(error) = self.mmap.flush_range(start, SECTOR_SIZE) {
            self.error_sink.on_error(&error.into());
        }
    }
}
