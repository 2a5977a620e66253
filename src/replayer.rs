//! Services `ResendRequest`: looks the requested range up in the replay
//! index, re-reads the recorded bytes from the journal, marks them as
//! possible duplicates and re-publishes them on the outbound stream.
//!
//! Replayed copies carry `MessageStatus::Replayed` so the indexer never
//! indexes them a second time.

use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::{Agent, BackoffIdleStrategy};
use crate::config::Config;
use crate::error::{Error, ErrorSink, Result};
use crate::fix::{self, encode_checksum, SOH};
use crate::journal::{
    assemble_fix_message, fix_message_payload, FixMessageHeader, FragmentHandler, FrameInfo,
    Journal, MessageStatus, Publication, Subscription, FIX_MESSAGE_HEADER_LENGTH,
    FIX_MESSAGE_TEMPLATE_ID,
};
use crate::replay_index::{replay_index_path, ReplayIndexRecord, SessionIndexReader};
use zerocopy::FromBytes;

const POLL_LIMIT: usize = 10;

/// Rewrite a recorded message as a possible duplicate.
///
/// With `PossDupFlag` absent the field is injected immediately before
/// `SendingTime`, `OrigSendingTime` is stamped with the original
/// `SendingTime`, and `BodyLength` plus `CheckSum` are recomputed. With the
/// flag present only its value byte is flipped; the field widths are
/// unchanged so `BodyLength` stands, but the flipped byte still changes the
/// byte sum and `CheckSum` is re-encoded.
pub fn rewrite_poss_dup(original: &[u8]) -> Result<Vec<u8>> {
    let fields = fix::scan(original);
    let checksum_field = fields
        .checksum
        .ok_or(Error::MalformedMessage("missing CheckSum"))?;
    if checksum_field.value_len != 3 {
        return Err(Error::MalformedMessage("CheckSum is not three digits"));
    }

    match fields.poss_dup_flag {
        Some(poss_dup) => {
            if poss_dup.value_len == 0 {
                return Err(Error::MalformedMessage("empty PossDupFlag"));
            }
            let mut out = original.to_vec();
            out[poss_dup.value_offset] = b'Y';
            let checksum = fix::checksum(&out[..checksum_field.tag_offset]);
            let mut digits = [0u8; 3];
            encode_checksum(&mut digits, checksum);
            out[checksum_field.value_offset..checksum_field.value_offset + 3]
                .copy_from_slice(&digits);
            Ok(out)
        }
        None => {
            let sending_time = fields
                .sending_time
                .ok_or(Error::MalformedMessage("missing SendingTime"))?;
            let body_length_field = fields
                .body_length
                .ok_or(Error::MalformedMessage("missing BodyLength"))?;
            let body_start = body_length_field.end();
            let old_body_len = checksum_field.tag_offset - body_start;
            // "43=Y|" plus "122=<SendingTime>|"
            let injected = 5 + 4 + sending_time.value_len + 1;
            let new_body_len = old_body_len + injected;

            let mut out = Vec::with_capacity(original.len() + injected + 4);
            out.extend_from_slice(&original[..body_length_field.value_offset]);
            out.extend_from_slice(new_body_len.to_string().as_bytes());
            out.push(SOH);
            out.extend_from_slice(&original[body_start..sending_time.tag_offset]);
            out.extend_from_slice(b"43=Y\x01");
            out.extend_from_slice(&original[sending_time.tag_offset..sending_time.end()]);
            out.extend_from_slice(b"122=");
            out.extend_from_slice(sending_time.value(original));
            out.push(SOH);
            out.extend_from_slice(&original[sending_time.end()..checksum_field.tag_offset]);

            let checksum = fix::checksum(&out);
            let mut digits = [0u8; 3];
            encode_checksum(&mut digits, checksum);
            out.extend_from_slice(b"10=");
            out.extend_from_slice(&digits);
            out.push(SOH);
            Ok(out)
        }
    }
}

pub struct Replayer {
    journal: Arc<Journal>,
    inbound: Subscription,
    outbound: Publication,
    log_dir: PathBuf,
    outbound_stream_id: u32,
    idle: BackoffIdleStrategy,
    error_sink: Arc<dyn ErrorSink>,
}

impl Replayer {
    pub fn new(
        journal: &Arc<Journal>,
        config: &Config,
        source_id: u32,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            journal: journal.clone(),
            inbound: journal.live_subscription(config.inbound_stream_id),
            outbound: journal.publication(config.outbound_stream_id, source_id, config.max_payload),
            log_dir: config.log_dir.clone(),
            outbound_stream_id: config.outbound_stream_id,
            idle: BackoffIdleStrategy::default(),
            error_sink,
        }
    }

    /// Replay `[begin, end]` for one session in `(sequence index, sequence
    /// number)` order. `end == 0` means "through the latest". Returns the
    /// number of messages replayed.
    #[tracing::instrument(skip(self))]
    pub fn on_resend_request(&mut self, session_id: u64, begin: i32, end: i32) -> usize {
        if end != 0 && end < begin {
            return 0;
        }
        let end = if end == 0 { i32::MAX } else { end };

        let path = replay_index_path(&self.log_dir, session_id, self.outbound_stream_id);
        let reader = match SessionIndexReader::open(&path) {
            Ok(Some(reader)) => reader,
            Ok(None) => {
                tracing::debug!(session_id, "no replay index for session");
                return 0;
            }
            Err(error) => {
                self.error_sink.on_error(&error);
                return 0;
            }
        };

        let mut replayed = 0;
        for record in reader.query(begin, end) {
            match self.replay_one(session_id, &record) {
                Ok(()) => replayed += 1,
                Err(error) => self.error_sink.on_error(&error),
            }
        }
        tracing::debug!(session_id, begin, end, replayed, "resend serviced");
        replayed
    }

    fn replay_one(&mut self, session_id: u64, record: &ReplayIndexRecord) -> Result<()> {
        let blob = self.journal.read(
            record.recording_id.get(),
            record.position.get(),
            record.length.get(),
        )?;
        let (header, fix_bytes) = assemble_fix_message(&blob)?;
        let rewritten = rewrite_poss_dup(&fix_bytes)?;
        let payload = fix_message_payload(
            session_id,
            header.sequence_index.get(),
            MessageStatus::Replayed,
            &rewritten,
        );
        self.publish(&payload);
        Ok(())
    }

    /// Claim, copy, commit. Back-pressure spins through the idle strategy;
    /// the commit is always the final action on the claim.
    fn publish(&mut self, payload: &[u8]) {
        loop {
            match self.outbound.try_claim(payload.len()) {
                Some(mut claim) => {
                    claim.buffer().copy_from_slice(payload);
                    claim.commit();
                    break;
                }
                // oversized for a single claim, or back-pressured
                None => {
                    if self.outbound.offer(payload).is_some() {
                        break;
                    }
                    self.idle.idle(0);
                }
            }
        }
        self.idle.reset();
    }
}

#[derive(Default)]
struct ResendRequests {
    requests: Vec<(u64, i32, i32)>,
}

impl FragmentHandler for ResendRequests {
    fn on_fragment(&mut self, payload: &[u8], info: &FrameInfo) {
        if !info.is_begin() {
            return;
        }
        let Some(header) = FixMessageHeader::read_from_prefix(payload) else {
            return;
        };
        if header.template_id.get() != FIX_MESSAGE_TEMPLATE_ID
            || header.status() != MessageStatus::Ok
        {
            return;
        }
        let fix_bytes = &payload[FIX_MESSAGE_HEADER_LENGTH..];
        let fields = fix::scan(fix_bytes);
        if !fields.is_message_type(fix_bytes, fix::MSG_TYPE_RESEND_REQUEST) {
            return;
        }
        let begin = fields
            .begin_seq_no
            .and_then(|f| fix::parse_int(f.value(fix_bytes)));
        let end = fields
            .end_seq_no
            .and_then(|f| fix::parse_int(f.value(fix_bytes)));
        if let (Some(begin), Some(end)) = (begin, end) {
            self.requests
                .push((header.session_id.get(), begin as i32, end as i32));
        }
    }
}

impl Agent for Replayer {
    fn role_name(&self) -> &'static str {
        "replayer"
    }

    fn do_work(&mut self) -> usize {
        let mut handler = ResendRequests::default();
        let mut work = self.inbound.poll(&mut handler, POLL_LIMIT);
        for (session_id, begin, end) in handler.requests {
            work += self.on_resend_request(session_id, begin, end);
        }
        work
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::{tag, MessageBuilder};
    use crate::error::CollectingErrorSink;
    use crate::replay_index::SessionIndexWriter;

    fn business_message(seq: u32, poss_dup: Option<&[u8]>) -> Vec<u8> {
        let mut builder = MessageBuilder::new(b"8")
            .field(tag::SENDER_COMP_ID, b"GW")
            .field(tag::TARGET_COMP_ID, b"CP")
            .field(tag::MSG_SEQ_NUM, seq.to_string().as_bytes());
        if let Some(value) = poss_dup {
            builder = builder.field(tag::POSS_DUP_FLAG, value);
        }
        builder
            .field(tag::SENDING_TIME, b"20260801-12:00:00.000")
            .field(55, b"EURUSD")
            .field(44, b"1.0842")
            .build()
    }

    fn assert_valid(msg: &[u8]) {
        let fields = fix::scan(msg);
        let body_length = fields.body_length.unwrap();
        let checksum = fields.checksum.unwrap();
        assert_eq!(
            fix::parse_int(body_length.value(msg)).unwrap() as usize,
            checksum.tag_offset - body_length.end()
        );
        assert_eq!(
            fix::parse_int(checksum.value(msg)).unwrap() as u8,
            fix::checksum(&msg[..checksum.tag_offset])
        );
    }

    #[test]
    fn injects_poss_dup_before_sending_time() {
        let original = business_message(5, None);
        let rewritten = rewrite_poss_dup(&original).unwrap();
        assert_valid(&rewritten);

        let fields = fix::scan(&rewritten);
        let poss_dup = fields.poss_dup_flag.expect("flag injected");
        assert_eq!(poss_dup.value(&rewritten), b"Y");
        let sending_time = fields.sending_time.unwrap();
        assert!(poss_dup.tag_offset < sending_time.tag_offset);

        // OrigSendingTime carries the original timestamp
        let orig = fix::scan(&rewritten);
        let needle = b"122=20260801-12:00:00.000\x01";
        assert!(rewritten
            .windows(needle.len())
            .any(|w| w == needle.as_slice()));
        assert_eq!(
            orig.sending_time.unwrap().value(&rewritten),
            b"20260801-12:00:00.000"
        );
    }

    #[test]
    fn flips_an_existing_poss_dup_in_place() {
        let original = business_message(5, Some(b"N"));
        let rewritten = rewrite_poss_dup(&original).unwrap();
        assert_eq!(rewritten.len(), original.len());
        assert_valid(&rewritten);

        let fields = fix::scan(&rewritten);
        assert_eq!(fields.poss_dup_flag.unwrap().value(&rewritten), b"Y");
        // everything but the flag byte and the checksum digits is untouched
        let diff: Vec<usize> = original
            .iter()
            .zip(rewritten.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect();
        let poss_dup_offset = fields.poss_dup_flag.unwrap().value_offset;
        for i in diff {
            let in_checksum = i >= fields.checksum.unwrap().value_offset;
            assert!(i == poss_dup_offset || in_checksum);
        }
    }

    #[test]
    fn rewrite_of_an_already_flagged_message_is_idempotent() {
        let original = business_message(9, Some(b"Y"));
        let rewritten = rewrite_poss_dup(&original).unwrap();
        assert_eq!(rewritten, original);
    }

    #[test]
    fn resend_request_replays_the_range_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            log_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let journal = Journal::new(1 << 20);
        let errors = Arc::new(CollectingErrorSink::default());

        // the "framer" records ten sent messages
        let sent = journal.publication(config.outbound_stream_id, 1, config.max_payload);
        let recording_id = journal.active_recording(config.outbound_stream_id);
        let mut writer = SessionIndexWriter::open(
            &replay_index_path(dir.path(), 42, config.outbound_stream_id),
            config.replay_index_capacity,
        )
        .unwrap();
        for seq in 1..=10u32 {
            let fix_bytes = business_message(seq, None);
            let begin = sent.position();
            let end = sent
                .offer(&fix_message_payload(42, 0, MessageStatus::Ok, &fix_bytes))
                .unwrap();
            let tail = writer.begin_write(&ReplayIndexRecord {
                stream_id: (config.outbound_stream_id as i32).into(),
                position: begin.into(),
                sequence_number: (seq as i32).into(),
                sequence_index: 0.into(),
                recording_id: recording_id.into(),
                length: ((end - begin) as i32).into(),
            });
            writer.commit_write(tail);
        }

        let mut replayer = Replayer::new(&journal, &config, 9, errors.clone());
        let mut outbound_tail = journal.live_subscription(config.outbound_stream_id);

        // counterparty asks for 2..4
        let request = MessageBuilder::new(fix::MSG_TYPE_RESEND_REQUEST)
            .field(tag::BEGIN_SEQ_NO, b"2")
            .field(tag::END_SEQ_NO, b"4")
            .field(tag::MSG_SEQ_NUM, b"11")
            .field(tag::SENDING_TIME, b"20260801-12:01:00.000")
            .build();
        journal
            .publication(config.inbound_stream_id, 2, config.max_payload)
            .offer(&fix_message_payload(42, 0, MessageStatus::Ok, &request))
            .unwrap();

        assert!(replayer.do_work() >= 4);
        assert!(errors.is_empty(), "{:?}", errors.drain());

        struct Replayed(Vec<(u64, Vec<u8>)>);
        impl FragmentHandler for Replayed {
            fn on_fragment(&mut self, payload: &[u8], _info: &FrameInfo) {
                let header = FixMessageHeader::read_from_prefix(payload).unwrap();
                assert_eq!(header.status(), MessageStatus::Replayed);
                self.0.push((
                    header.session_id.get(),
                    payload[FIX_MESSAGE_HEADER_LENGTH..].to_vec(),
                ));
            }
        }
        let mut replayed = Replayed(Vec::new());
        outbound_tail.poll(&mut replayed, 64);

        assert_eq!(replayed.0.len(), 3);
        for (i, (session_id, fix_bytes)) in replayed.0.iter().enumerate() {
            assert_eq!(*session_id, 42);
            assert_valid(fix_bytes);
            let fields = fix::scan(fix_bytes);
            assert_eq!(
                fix::parse_int(fields.msg_seq_num.unwrap().value(fix_bytes)).unwrap(),
                i as i64 + 2
            );
            assert_eq!(fields.poss_dup_flag.unwrap().value(fix_bytes), b"Y");
        }
    }

    #[test]
    fn end_before_begin_is_a_no_op_and_zero_means_latest() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            log_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let journal = Journal::new(1 << 20);
        let errors = Arc::new(CollectingErrorSink::default());

        let sent = journal.publication(config.outbound_stream_id, 1, config.max_payload);
        let recording_id = journal.active_recording(config.outbound_stream_id);
        let mut writer = SessionIndexWriter::open(
            &replay_index_path(dir.path(), 7, config.outbound_stream_id),
            config.replay_index_capacity,
        )
        .unwrap();
        for seq in 1..=3u32 {
            let begin = sent.position();
            let end = sent
                .offer(&fix_message_payload(
                    7,
                    0,
                    MessageStatus::Ok,
                    &business_message(seq, None),
                ))
                .unwrap();
            let tail = writer.begin_write(&ReplayIndexRecord {
                stream_id: (config.outbound_stream_id as i32).into(),
                position: begin.into(),
                sequence_number: (seq as i32).into(),
                sequence_index: 0.into(),
                recording_id: recording_id.into(),
                length: ((end - begin) as i32).into(),
            });
            writer.commit_write(tail);
        }

        let mut replayer = Replayer::new(&journal, &config, 9, errors);
        assert_eq!(replayer.on_resend_request(7, 5, 2), 0);
        assert_eq!(replayer.on_resend_request(7, 2, 0), 2);
    }
}
