//! Full-pipeline scenarios: session store, indexer, replay index, replayer
//! and archive scanner wired together over one journal.

use std::collections::HashMap;
use std::sync::Arc;

use fixlog::agent::Agent;
use fixlog::archive::{ArchiveScanner, FixMessageConsumer, ScanDirection};
use fixlog::config::Config;
use fixlog::contexts::{CompositeKey, SessionContexts};
use fixlog::error::CollectingErrorSink;
use fixlog::fix::{self, tag, MessageBuilder};
use fixlog::indexer::{CompletionPosition, Indexer};
use fixlog::journal::{
    fix_message_payload, FixMessageHeader, FragmentHandler, FrameInfo, Journal, MessageStatus,
    FIX_MESSAGE_HEADER_LENGTH,
};
use fixlog::replay_index::ReplayIndex;
use fixlog::replayer::Replayer;
use zerocopy::FromBytes;

const FRAMER_SOURCE: u32 = 1;
const COUNTERPARTY_SOURCE: u32 = 2;
const REPLAYER_SOURCE: u32 = 3;

/// Log output is off by default; run with RUST_LOG=fixlog=trace to watch
/// the agents work.
fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct Harness {
    _dir: tempfile::TempDir,
    config: Config,
    journal: Arc<Journal>,
    errors: Arc<CollectingErrorSink>,
}

impl Harness {
    fn new(replay_index_capacity: usize) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            log_dir: dir.path().to_path_buf(),
            replay_index_capacity,
            ..Config::default()
        };
        Self {
            _dir: dir,
            config,
            journal: Journal::new(1 << 22),
            errors: Arc::new(CollectingErrorSink::default()),
        }
    }

    fn contexts(&self) -> SessionContexts {
        SessionContexts::open(
            &self.config.session_contexts_path(),
            self.config.sector_file_size,
            self.errors.clone(),
        )
        .unwrap()
    }

    fn indexer(&self) -> Indexer {
        self.indexer_with_completion(Arc::new(CompletionPosition::default()))
    }

    fn indexer_with_completion(&self, completion: Arc<CompletionPosition>) -> Indexer {
        let replay_index = ReplayIndex::new(
            &self.config.log_dir,
            self.config.outbound_stream_id,
            self.config.replay_index_capacity,
            self.config.index_cache_sets,
            self.config.index_cache_ways,
            64,
            self.errors.clone(),
        )
        .unwrap();
        let sink: Arc<dyn fixlog::ErrorSink> = self.errors.clone();
        Indexer::new(
            &self.journal,
            self.config.outbound_stream_id,
            vec![Box::new(replay_index)],
            completion,
            &sink,
        )
        .unwrap()
    }

    fn replayer(&self) -> Replayer {
        Replayer::new(
            &self.journal,
            &self.config,
            REPLAYER_SOURCE,
            self.errors.clone(),
        )
    }

    fn send_business_message(&self, session_id: u64, sequence_index: i32, seq: u32) {
        let fix_bytes = business_message(seq);
        self.journal
            .publication(
                self.config.outbound_stream_id,
                FRAMER_SOURCE,
                self.config.max_payload,
            )
            .offer(&fix_message_payload(
                session_id,
                sequence_index,
                MessageStatus::Ok,
                &fix_bytes,
            ))
            .unwrap();
    }

    fn send_resend_request(&self, session_id: u64, begin: u32, end: u32) {
        let request = MessageBuilder::new(fix::MSG_TYPE_RESEND_REQUEST)
            .field(tag::BEGIN_SEQ_NO, begin.to_string().as_bytes())
            .field(tag::END_SEQ_NO, end.to_string().as_bytes())
            .field(tag::MSG_SEQ_NUM, b"99")
            .field(tag::SENDING_TIME, b"20260801-15:00:00.000")
            .build();
        self.journal
            .publication(
                self.config.inbound_stream_id,
                COUNTERPARTY_SOURCE,
                self.config.max_payload,
            )
            .offer(&fix_message_payload(
                session_id,
                0,
                MessageStatus::Ok,
                &request,
            ))
            .unwrap();
    }

    fn assert_no_errors(&self) {
        assert!(self.errors.is_empty(), "{:?}", self.errors.drain());
    }
}

fn business_message(seq: u32) -> Vec<u8> {
    MessageBuilder::new(b"8")
        .field(tag::SENDER_COMP_ID, b"GATEWAY")
        .field(tag::TARGET_COMP_ID, b"COUNTERPARTY")
        .field(tag::MSG_SEQ_NUM, seq.to_string().as_bytes())
        .field(tag::SENDING_TIME, b"20260801-14:30:00.000")
        .field(55, b"EURUSD")
        .field(38, b"1000000")
        .build()
}

fn drain(agent: &mut dyn Agent) {
    let mut quiet = 0;
    while quiet < 3 {
        if agent.do_work() == 0 {
            quiet += 1;
        } else {
            quiet = 0;
        }
    }
}

#[derive(Default)]
struct ReplayedMessages {
    messages: Vec<Vec<u8>>,
}

impl FragmentHandler for ReplayedMessages {
    fn on_fragment(&mut self, payload: &[u8], _info: &FrameInfo) {
        let header = FixMessageHeader::read_from_prefix(payload).unwrap();
        if header.status() == MessageStatus::Replayed {
            self.messages
                .push(payload[FIX_MESSAGE_HEADER_LENGTH..].to_vec());
        }
    }
}

fn assert_well_formed(msg: &[u8]) {
    let fields = fix::scan(msg);
    let body_length = fields.body_length.unwrap();
    let checksum = fields.checksum.unwrap();
    assert_eq!(
        fix::parse_int(body_length.value(msg)).unwrap() as usize,
        checksum.tag_offset - body_length.end(),
        "BodyLength covers the rewritten body"
    );
    assert_eq!(
        fix::parse_int(checksum.value(msg)).unwrap() as u8,
        fix::checksum(&msg[..checksum.tag_offset]),
        "CheckSum matches the rewritten bytes"
    );
}

#[test]
fn logon_index_and_resend_round_trip() {
    let harness = Harness::new(64 * 1024);

    // logon establishes the session identity
    let mut contexts = harness.contexts();
    let key = CompositeKey::new(b"GATEWAY", b"COUNTERPARTY");
    let ctx = contexts.on_logon(key.clone(), 1_700_000_000).context().unwrap();
    assert_eq!(ctx.session_id, 1);

    // the gateway sends seq 1..=10 and they get indexed
    for seq in 1..=10 {
        harness.send_business_message(ctx.session_id, ctx.sequence_index, seq);
    }
    let mut indexer = harness.indexer();
    drain(&mut indexer);

    // counterparty asks for 2..4
    let mut replayer = harness.replayer();
    let mut outbound_tail = harness
        .journal
        .live_subscription(harness.config.outbound_stream_id);
    harness.send_resend_request(ctx.session_id, 2, 4);
    drain(&mut replayer);
    harness.assert_no_errors();

    let mut replayed = ReplayedMessages::default();
    while outbound_tail.poll(&mut replayed, 64) > 0 {}
    assert_eq!(replayed.messages.len(), 3);

    for (i, msg) in replayed.messages.iter().enumerate() {
        assert_well_formed(msg);
        let fields = fix::scan(msg);
        let seq = fix::parse_int(fields.msg_seq_num.unwrap().value(msg)).unwrap();
        assert_eq!(seq, i as i64 + 2, "ascending sequence order");

        // PossDupFlag injected immediately before SendingTime
        let poss_dup = fields.poss_dup_flag.unwrap();
        let sending_time = fields.sending_time.unwrap();
        assert_eq!(poss_dup.value(msg), b"Y");
        assert_eq!(poss_dup.end(), sending_time.tag_offset);
        assert_eq!(sending_time.value(msg), b"20260801-14:30:00.000");

        // OrigSendingTime mirrors the original SendingTime
        let needle = b"122=20260801-14:30:00.000\x01";
        assert!(msg.windows(needle.len()).any(|w| w == needle.as_slice()));
    }

    // the replayed copies were not re-indexed: a second identical request
    // still replays exactly three messages
    drain(&mut indexer);
    let mut second_tail = harness
        .journal
        .live_subscription(harness.config.outbound_stream_id);
    harness.send_resend_request(ctx.session_id, 2, 4);
    drain(&mut replayer);
    let mut second = ReplayedMessages::default();
    while second_tail.poll(&mut second, 64) > 0 {}
    assert_eq!(second.messages.len(), 3);
}

#[test]
fn ring_wrap_drops_the_oldest_sequence_numbers() {
    // four records per session ring
    let harness = Harness::new(4 * fixlog::replay_index::RECORD_LENGTH);

    for seq in 1..=6 {
        harness.send_business_message(11, 0, seq);
    }
    let mut indexer = harness.indexer();
    drain(&mut indexer);

    let mut replayer = harness.replayer();
    let mut outbound_tail = harness
        .journal
        .live_subscription(harness.config.outbound_stream_id);

    // seq 1 has been overwritten by the wrap
    harness.send_resend_request(11, 1, 1);
    drain(&mut replayer);
    let mut replayed = ReplayedMessages::default();
    while outbound_tail.poll(&mut replayed, 64) > 0 {}
    assert!(replayed.messages.is_empty());

    // 3..6 survive with their original bytes
    harness.send_resend_request(11, 3, 6);
    drain(&mut replayer);
    let mut replayed = ReplayedMessages::default();
    while outbound_tail.poll(&mut replayed, 64) > 0 {}
    assert_eq!(replayed.messages.len(), 4);
    for (msg, seq) in replayed.messages.iter().zip(3i64..) {
        let fields = fix::scan(msg);
        assert_eq!(fix::parse_int(fields.msg_seq_num.unwrap().value(msg)).unwrap(), seq);
    }
    harness.assert_no_errors();
}

#[test]
fn indexer_catches_up_after_a_crash() {
    let harness = Harness::new(64 * 1024);

    // first life: seq 1..=60 get indexed, then the indexer "crashes"
    for seq in 1..=60 {
        harness.send_business_message(21, 0, seq);
    }
    {
        let mut indexer = harness.indexer();
        drain(&mut indexer);
        indexer.on_close();
    }

    // the gateway keeps sending while the indexer is down
    for seq in 61..=100 {
        harness.send_business_message(21, 0, seq);
    }

    // second life: catch-up replays the recording from the durably indexed
    // position; no work is required from the live subscription
    let mut indexer = harness.indexer();
    drain(&mut indexer);

    let mut replayer = harness.replayer();
    let mut outbound_tail = harness
        .journal
        .live_subscription(harness.config.outbound_stream_id);
    harness.send_resend_request(21, 1, 0); // 0 = through latest
    drain(&mut replayer);
    harness.assert_no_errors();

    let mut replayed = ReplayedMessages::default();
    while outbound_tail.poll(&mut replayed, 256) > 0 {}
    assert_eq!(replayed.messages.len(), 100);
    for (msg, seq) in replayed.messages.iter().zip(1i64..) {
        let fields = fix::scan(msg);
        assert_eq!(fix::parse_int(fields.msg_seq_num.unwrap().value(msg)).unwrap(), seq);
    }
}

#[test]
fn resend_spans_sequence_resets_in_index_order() {
    let harness = Harness::new(64 * 1024);

    let mut contexts = harness.contexts();
    let ctx = contexts
        .on_logon(CompositeKey::new(b"GATEWAY", b"COUNTERPARTY"), 0)
        .context()
        .unwrap();

    // seq 5..=6 before the reset, 1..=2 after it
    for seq in 5..=6 {
        harness.send_business_message(ctx.session_id, 0, seq);
    }
    contexts.sequence_reset(ctx.session_id);
    for seq in 1..=2 {
        harness.send_business_message(ctx.session_id, 1, seq);
    }

    let mut indexer = harness.indexer();
    drain(&mut indexer);

    let mut replayer = harness.replayer();
    let mut outbound_tail = harness
        .journal
        .live_subscription(harness.config.outbound_stream_id);
    harness.send_resend_request(ctx.session_id, 1, 0);
    drain(&mut replayer);
    harness.assert_no_errors();

    let mut replayed = ReplayedMessages::default();
    while outbound_tail.poll(&mut replayed, 64) > 0 {}
    let sequence: Vec<i64> = replayed
        .messages
        .iter()
        .map(|msg| {
            let fields = fix::scan(msg);
            fix::parse_int(fields.msg_seq_num.unwrap().value(msg)).unwrap()
        })
        .collect();
    // ascending (sequence_index, sequence_number)
    assert_eq!(sequence, vec![5, 6, 1, 2]);
}

#[test]
fn archive_scanner_reads_back_both_directions() {
    let harness = Harness::new(64 * 1024);

    for seq in 1..=3 {
        harness.send_business_message(31, 0, seq);
    }
    harness
        .journal
        .close_recording(harness.config.outbound_stream_id);
    for seq in 4..=5 {
        harness.send_business_message(31, 0, seq);
    }
    harness.send_resend_request(31, 1, 1);

    #[derive(Default)]
    struct Seqs(Vec<i64>);
    impl FixMessageConsumer for Seqs {
        fn on_message(&mut self, _header: &FixMessageHeader, fix_bytes: &[u8], _info: &FrameInfo) {
            let fields = fix::scan(fix_bytes);
            if let Some(f) = fields.msg_seq_num {
                self.0
                    .push(fix::parse_int(f.value(fix_bytes)).unwrap_or_default());
            }
        }
    }

    let scanner = ArchiveScanner::new(harness.journal.clone(), harness.config.clone());
    let mut sent = Seqs::default();
    let delivered = scanner
        .scan(ScanDirection::Sent, false, &mut sent)
        .unwrap();
    assert_eq!(delivered, 5);
    // the completed recording comes back before the active one
    assert_eq!(sent.0, vec![1, 2, 3, 4, 5]);

    let mut received = Seqs::default();
    assert_eq!(
        scanner
            .scan(ScanDirection::Received, false, &mut received)
            .unwrap(),
        1
    );
    harness.assert_no_errors();
}

#[test]
fn fragmented_messages_replay_byte_for_byte() {
    let mut harness = Harness::new(64 * 1024);
    // fragments the 400-byte body while the standard header still fits in
    // the first fragment
    harness.config.max_payload = 128;

    let big_field = vec![b'X'; 400];
    let fix_bytes = MessageBuilder::new(b"8")
        .field(tag::SENDER_COMP_ID, b"GATEWAY")
        .field(tag::TARGET_COMP_ID, b"COUNTERPARTY")
        .field(tag::MSG_SEQ_NUM, b"7")
        .field(tag::SENDING_TIME, b"20260801-14:30:00.000")
        .field(58, &big_field)
        .build();
    harness
        .journal
        .publication(harness.config.outbound_stream_id, FRAMER_SOURCE, 128)
        .offer(&fix_message_payload(41, 0, MessageStatus::Ok, &fix_bytes))
        .unwrap();

    let mut indexer = harness.indexer();
    drain(&mut indexer);

    let mut replayer = harness.replayer();
    let mut outbound_tail = harness
        .journal
        .live_subscription(harness.config.outbound_stream_id);
    harness.send_resend_request(41, 7, 7);
    drain(&mut replayer);
    harness.assert_no_errors();

    struct Assembled(Vec<Vec<u8>>);
    impl FixMessageConsumer for Assembled {
        fn on_message(&mut self, header: &FixMessageHeader, fix_bytes: &[u8], _info: &FrameInfo) {
            if header.status() == MessageStatus::Replayed {
                self.0.push(fix_bytes.to_vec());
            }
        }
    }
    // drain the tail through an assembler since the replay is fragmented too
    let mut assembled = Assembled(Vec::new());
    {
        let mut assembler = fixlog::archive::FragmentAssembler::new(&mut assembled);
        while outbound_tail.poll(&mut assembler, 64) > 0 {}
    }

    assert_eq!(assembled.0.len(), 1);
    let replayed = &assembled.0[0];
    assert_well_formed(replayed);
    let fields = fix::scan(replayed);
    assert_eq!(fields.poss_dup_flag.unwrap().value(replayed), b"Y");
    // the big body survives untouched
    assert!(replayed
        .windows(big_field.len())
        .any(|w| w == big_field.as_slice()));
}

#[test]
fn quiesce_bounds_the_final_drain() {
    let harness = Harness::new(64 * 1024);

    let publication = harness.journal.publication(
        harness.config.outbound_stream_id,
        FRAMER_SOURCE,
        harness.config.max_payload,
    );
    let final_position = publication
        .offer(&fix_message_payload(
            51,
            0,
            MessageStatus::Ok,
            &business_message(1),
        ))
        .unwrap();

    let completion = Arc::new(CompletionPosition::default());
    let mut indexer = harness.indexer_with_completion(completion.clone());

    completion.complete(HashMap::from([(FRAMER_SOURCE, final_position)]));
    // published after termination was declared: must not be indexed
    publication
        .offer(&fix_message_payload(
            51,
            0,
            MessageStatus::Ok,
            &business_message(2),
        ))
        .unwrap();
    indexer.on_close();

    let mut replayer = harness.replayer();
    assert_eq!(replayer.on_resend_request(51, 1, 0), 1);
    harness.assert_no_errors();
}
