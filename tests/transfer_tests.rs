//! Integration tests for the transfer core
//!
//! These drive `TransferManager` through the mock transport with a manual
//! clock: scheduling, resume integrity, swarming, push fallback and
//! failure recovery.


use gosh_swarm::persist::{decode_records, encode_records};
use gosh_swarm::{
    ByteRange, ConnectionId, ContentRange, FileAssembly, FileSpec, Giv, NewSource, PeerAttributes,
    RangeSet, RemoteQueue, ResponseInfo, ResumeMismatchPolicy, SourceStatus, TransferError,
    TransferEvent,
};
use std::net::SocketAddr;
use std::time::Duration;
use test_helpers::*;

fn count_events(events: &[TransferEvent], pred: impl Fn(&TransferEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

// =============================================================================
// Resume and overlap
// =============================================================================

#[test]
fn test_resume_accepts_overlapping_range() {
    let mut h = Harness::new(test_config().overlap_size(64));
    let data = content(1000);
    let (file, assembly) = h.partial_file("song.ogg", 1000, &data[..500]);
    let id = h.source(file, anonymous(1), 3);

    assert_eq!(h.tick_and_connect(), vec![id]);
    let (conn, plan) = h.net.last_request();
    assert_eq!((plan.start, plan.end, plan.overlap), (436, 999, 64));
    assert_eq!(plan.file_index, 3);

    h.serve(id, ContentRange::new(436, 999, Some(1000)), &data);

    assert_eq!(h.status(id), SourceStatus::VerifyWait);
    assert_eq!(assembly.0.lock().data(), &data[..]);
    assert!(h.net.was_closed(conn));
    assert_eq!(h.manager.buffer_pool().outstanding(), 0);

    let events = h.events();
    assert!(events.contains(&TransferEvent::OverlapVerified { source: id, bytes: 64 }));
    assert!(events.contains(&TransferEvent::FileCompleted { file }));
    assert_eq!(h.net.log.lock().verifications.len(), 1);
    h.assert_consistent();
}

#[test]
fn test_resume_rejects_range_from_zero() {
    let mut h = Harness::new(test_config().overlap_size(64));
    let data = content(1000);
    let (file, _) = h.partial_file("song.ogg", 1000, &data[..500]);
    let id = h.source(file, anonymous(1), 3);
    h.tick_and_connect();

    h.manager
        .on_response(id, ResponseInfo::partial(ContentRange::new(0, 999, Some(1000))));

    assert_eq!(h.status(id), SourceStatus::Error);
    let events = h.events();
    assert_eq!(
        count_events(&events, |e| matches!(e, TransferEvent::MeshRemoval { .. })),
        1
    );
    h.assert_consistent();
}

#[test]
fn test_size_mismatch_is_protocol_error() {
    let mut h = Harness::with_defaults();
    let file = h.file("clip.avi", 1000, false);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();

    h.manager
        .on_response(id, ResponseInfo::partial(ContentRange::new(0, 999, Some(1200))));
    assert_eq!(h.status(id), SourceStatus::Error);
}

#[test]
fn test_overlap_mismatch_truncates() {
    let policy = ResumeMismatchPolicy {
        truncate_probability: 1.0,
        truncate_window: 100,
    };
    let mut h = Harness::new(test_config().overlap_size(64).mismatch_policy(policy));
    let data = content(1000);
    let mut stored = data[..500].to_vec();
    stored[470] ^= 0xff;
    let (file, assembly) = h.partial_file("song.ogg", 1000, &stored);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();

    h.serve(id, ContentRange::new(436, 999, Some(1000)), &data);

    assert_eq!(h.status(id), SourceStatus::TimeoutWait);
    {
        let assembly = assembly.0.lock();
        assert!(assembly.done().covers(&ByteRange::new(0, 400)));
        assert!(!assembly.done().covers(&ByteRange::new(400, 401)));
        assert!(!assembly.done().covers(&ByteRange::new(500, 501)));
    }
    assert_eq!(h.manager.buffer_pool().outstanding(), 0);
    assert!(h
        .events()
        .iter()
        .any(|e| matches!(e, TransferEvent::MeshRemoval { .. })));

    // The retry resumes before the truncated window
    h.advance(2);
    h.tick_and_connect();
    let (_, plan) = h.net.last_request();
    assert_eq!((plan.start, plan.overlap), (336, 64));
    h.assert_consistent();
}

#[test]
fn test_overlap_mismatch_rejects() {
    let policy = ResumeMismatchPolicy {
        truncate_probability: 0.0,
        truncate_window: 100,
    };
    let mut h = Harness::new(test_config().overlap_size(64).mismatch_policy(policy));
    let data = content(1000);
    let mut stored = data[..500].to_vec();
    stored[440] ^= 0xff;
    let (file, assembly) = h.partial_file("song.ogg", 1000, &stored);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();

    let now = h.manager.now();
    h.serve(id, ContentRange::new(436, 999, Some(1000)), &data);

    // Rejected for now and retried after a backoff; nothing is truncated
    assert_eq!(h.status(id), SourceStatus::TimeoutWait);
    let source = h.manager.source(id).unwrap();
    assert_eq!(source.retry_after(), now + Duration::from_secs(1));
    assert!(source.last_reason().unwrap().starts_with("Rejected: Resume mismatch"));
    assert!(assembly.0.lock().done().covers(&ByteRange::new(0, 500)));
    assert!(!assembly.0.lock().done().covers(&ByteRange::new(500, 501)));
    assert_eq!(h.manager.buffer_pool().outstanding(), 0);
    assert!(h
        .events()
        .iter()
        .any(|e| matches!(e, TransferEvent::MeshRemoval { .. })));

    h.advance(1);
    h.tick_and_connect();
    let (_, plan) = h.net.last_request();
    assert_eq!((plan.start, plan.overlap), (436, 64));
    h.assert_consistent();
}

#[test]
fn test_early_close_keeps_received_bytes() {
    let mut h = Harness::new(test_config().overlap_size(0));
    let data = content(1000);
    let file = h.file("talk.mp3", 1000, false);
    let assembly = h.files.get("talk.mp3").unwrap();
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();

    let conn = h.conn_of(id);
    h.manager
        .on_response(id, ResponseInfo::partial(ContentRange::new(0, 999, Some(1000))));
    h.manager.on_data(id, &data[..300]);
    h.manager.on_closed(conn, None);

    assert_eq!(h.status(id), SourceStatus::TimeoutWait);
    assert!(assembly.0.lock().done().covers(&ByteRange::new(0, 300)));
    assert_eq!(h.manager.buffer_pool().outstanding(), 0);

    h.advance(2);
    h.tick_and_connect();
    assert_eq!(h.net.last_request().1.start, 300);
}

// =============================================================================
// Scheduling
// =============================================================================

#[test]
fn test_global_running_cap() {
    let mut h = Harness::new(test_config().max_running(2));
    let mut ids = Vec::new();
    for n in 1..=5u8 {
        let file = h.file(&format!("file{}.bin", n), 1000, false);
        ids.push(h.source(file, anonymous(n), 0));
    }

    assert_eq!(h.manager.tick().promoted.len(), 2);
    assert_eq!(h.manager.running_count(), 2);
    assert!(h.manager.tick().promoted.is_empty());
    assert_eq!(h.manager.running_count(), 2);

    let running: Vec<_> = ids
        .iter()
        .copied()
        .filter(|id| h.status(*id).is_running())
        .collect();
    h.manager.stop(running[0], "user").unwrap();
    assert_eq!(h.manager.tick().promoted.len(), 1);
    assert_eq!(h.manager.running_count(), 2);
    h.assert_consistent();
}

#[test]
fn test_connector_refusing_stops_the_pass() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    h.source(file, anonymous(1), 0);
    h.net.settings.lock().can_connect = false;
    assert!(h.manager.tick().promoted.is_empty());

    h.net.settings.lock().can_connect = true;
    assert_eq!(h.manager.tick().promoted.len(), 1);
}

#[test]
fn test_one_source_per_peer_per_tick() {
    let mut config = test_config();
    config.max_running_per_peer = 4;
    let mut h = Harness::new(config);
    let a = h.file("a.bin", 1000, false);
    let b = h.file("b.bin", 1000, false);
    let first = h.source(a, anonymous(1), 0);
    let second = h.source(b, anonymous(1), 1);

    assert_eq!(h.manager.tick().promoted, vec![first]);
    assert_eq!(h.manager.tick().promoted, vec![second]);
}

#[test]
fn test_non_swarming_file_runs_one_source() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    h.source(file, anonymous(1), 0);
    h.source(file, anonymous(2), 0);

    assert_eq!(h.manager.tick().promoted.len(), 1);
    assert!(h.manager.tick().promoted.is_empty());
}

#[test]
fn test_suspended_source_is_skipped() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);

    h.manager.suspend(id, true).unwrap();
    assert!(h.manager.tick().promoted.is_empty());

    h.manager.suspend(id, false).unwrap();
    assert_eq!(h.manager.tick().promoted, vec![id]);
}

#[test]
fn test_stop_is_idempotent() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);
    h.manager.tick();
    h.events();

    h.manager.stop(id, "user").unwrap();
    h.manager.stop(id, "user again").unwrap();

    let events = h.events();
    assert_eq!(
        count_events(&events, |e| matches!(e, TransferEvent::Stopped { .. })),
        1
    );
    assert_eq!(h.status(id), SourceStatus::Aborted);
    assert_eq!(h.manager.running_count(), 0);
    h.assert_consistent();
}

#[test]
fn test_lists_stay_consistent_through_churn() {
    let mut h = Harness::new(test_config().max_running(3));
    let a = h.file("a.bin", 3000, true);
    let b = h.file("b.bin", 1000, false);
    let s1 = h.source(a, servent(1), 0);
    let s2 = h.source(a, anonymous(2), 0);
    let s3 = h.source(b, servent(1), 1);
    h.assert_consistent();

    h.tick_and_connect();
    h.assert_consistent();

    h.manager.queue_delay(s3, Duration::from_secs(5), "later").unwrap();
    h.assert_consistent();

    h.manager.remove_source(s2).unwrap();
    h.assert_consistent();

    h.manager.stop(s1, "done").unwrap();
    h.assert_consistent();

    h.advance(6);
    h.tick_and_connect();
    h.assert_consistent();

    h.manager.remove_source(s1).unwrap();
    h.manager.remove_source(s3).unwrap();
    h.assert_consistent();
    assert_eq!(h.manager.running_count(), 0);
    assert_eq!(h.manager.buffer_pool().outstanding(), 0);

    // The second peer was already reclaimed by the previous tick
    let retired = h.manager.tick().retired;
    assert_eq!(retired.len(), 1);
    assert!(h.manager.registry().is_empty());
}

#[test]
fn test_hold_blocks_every_source_of_a_peer() {
    let mut h = Harness::with_defaults();
    let a = h.file("a.bin", 1000, false);
    let b = h.file("b.bin", 1000, false);
    let s1 = h.source(a, anonymous(1), 0);
    let s2 = h.source(b, anonymous(1), 1);

    h.manager.queue_hold(s1, Duration::from_secs(60), "banned").unwrap();
    assert!(h.manager.tick().promoted.is_empty());

    h.advance(61);
    assert_eq!(h.manager.tick().promoted, vec![s2]);
    h.assert_consistent();
}

#[test]
fn test_rejected_hold_leaves_peer_untouched() {
    let mut h = Harness::new(test_config().overlap_size(0));
    let data = content(1000);
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();
    h.serve(id, ContentRange::new(0, 999, Some(1000)), &data);
    assert!(h.manager.file(file).unwrap().is_completed());

    let peer = h.manager.source(id).unwrap().peer();
    let before = h.manager.peer(peer).unwrap().hold_until();
    assert!(matches!(
        h.manager.queue_hold(id, Duration::from_secs(600), "banned"),
        Err(TransferError::InvalidState { .. })
    ));
    assert_eq!(h.manager.peer(peer).unwrap().hold_until(), before);
    assert_eq!(h.status(id), SourceStatus::VerifyWait);
    h.assert_consistent();
}

#[test]
fn test_delay_only_affects_one_source() {
    let mut h = Harness::with_defaults();
    let a = h.file("a.bin", 1000, false);
    let b = h.file("b.bin", 1000, false);
    let s1 = h.source(a, anonymous(1), 0);
    let s2 = h.source(b, anonymous(1), 1);

    h.manager.queue_delay(s1, Duration::from_secs(60), "later").unwrap();
    assert_eq!(h.manager.tick().promoted, vec![s2]);
}

#[test]
fn test_request_spacing_defers_peer() {
    let mut config = test_config().min_request_spacing(30);
    config.max_running_per_peer = 2;
    let mut h = Harness::new(config);
    let a = h.file("a.bin", 1000, false);
    let b = h.file("b.bin", 1000, false);
    let s1 = h.source(a, anonymous(1), 0);
    let s2 = h.source(b, anonymous(1), 1);

    assert_eq!(h.manager.tick().promoted, vec![s1]);
    h.advance(10);
    assert!(h.manager.tick().promoted.is_empty());
    h.advance(21);
    assert_eq!(h.manager.tick().promoted, vec![s2]);
}

// =============================================================================
// Swarming and keep-alive
// =============================================================================

#[test]
fn test_keep_alive_chains_attempts() {
    let mut h = Harness::new(test_config().overlap_size(0).swarm_chunk_size(1000));
    let data = content(3000);
    let file = h.file("big.iso", 3000, true);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();

    let (conn, first) = h.net.last_request();
    assert_eq!((first.start, first.end), (0, 999));
    h.serve(id, ContentRange::new(0, 999, Some(3000)), &data);

    let (next_conn, second) = h.net.last_request();
    assert_eq!(next_conn, conn);
    assert_eq!((second.start, second.end), (1000, 1999));
    assert_ne!(second.attempt, first.attempt);
    assert_eq!(h.status(id), SourceStatus::Headers);
    let events = h.events();
    let completed = events
        .iter()
        .position(|e| {
            *e == TransferEvent::AttemptCompleted {
                source: id,
                attempt: first.attempt,
                range: ByteRange::new(0, 1000),
            }
        })
        .expect("attempt completed");
    // Reported once the body is flushed and the buffers are back
    let left_receiving = events
        .iter()
        .position(|e| {
            matches!(
                e,
                TransferEvent::StateChanged {
                    old_state: SourceStatus::Receiving,
                    ..
                }
            )
        })
        .expect("left Receiving");
    assert!(completed > left_receiving);

    h.serve(id, ContentRange::new(1000, 1999, Some(3000)), &data);
    h.serve(id, ContentRange::new(2000, 2999, Some(3000)), &data);
    assert_eq!(h.status(id), SourceStatus::VerifyWait);
    assert_eq!(h.net.request_count(), 3);
    assert!(h.net.was_closed(conn));
    h.assert_consistent();
}

#[test]
fn test_overflow_disables_keep_alive() {
    let mut h = Harness::new(test_config().overlap_size(0).swarm_chunk_size(1000));
    let data = content(3000);
    let file = h.file("big.iso", 3000, true);
    let assembly = h.files.get("big.iso").unwrap();
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();
    let conn = h.conn_of(id);

    h.manager
        .on_response(id, ResponseInfo::partial(ContentRange::new(0, 999, Some(3000))));
    h.manager.on_data(id, &data[..1200]);

    assert!(assembly.0.lock().done().covers(&ByteRange::new(0, 1000)));
    assert!(!assembly.0.lock().done().covers(&ByteRange::new(1000, 1001)));
    assert!(h.net.was_closed(conn));
    assert_eq!(h.status(id), SourceStatus::Queued);
    let peer = h.manager.source(id).unwrap().peer();
    assert!(h.manager.peer(peer).unwrap().has(PeerAttributes::NO_KEEPALIVE));
}

#[test]
fn test_partial_availability_constrains_next_request() {
    let mut h = Harness::new(test_config().overlap_size(0).swarm_chunk_size(1000));
    let file = h.file("big.iso", 3000, true);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();
    let conn = h.conn_of(id);

    let available = RangeSet::from_ranges([ByteRange::new(2000, 3000)]);
    h.manager.on_response(
        id,
        ResponseInfo::new(416, "Requested Range Not Satisfiable")
            .with_keep_alive(true)
            .with_available(available),
    );

    let (next_conn, plan) = h.net.last_request();
    assert_eq!(next_conn, conn);
    assert_eq!((plan.start, plan.end), (2000, 2999));
    assert_eq!(h.status(id), SourceStatus::Headers);
}

#[test]
fn test_completion_stops_siblings() {
    let mut h = Harness::new(test_config().overlap_size(0));
    let data = content(1000);
    let file = h.file("a.bin", 1000, true);
    let s1 = h.source(file, anonymous(1), 0);
    let s2 = h.source(file, anonymous(2), 0);
    h.manager.tick();

    // Both run on a swarmed file; the first one fetches everything
    let conn = h.conn_of(s1);
    h.manager.on_connected(conn);
    h.serve(s1, ContentRange::new(0, 999, Some(1000)), &data);

    assert_eq!(h.status(s1), SourceStatus::VerifyWait);
    assert_eq!(h.status(s2), SourceStatus::Aborted);
    assert!(matches!(
        h.manager.add_source(file, NewSource::new(anonymous(3), 0)),
        Err(TransferError::InvalidState { .. })
    ));
    h.assert_consistent();
}

#[test]
fn test_nothing_left_is_an_error() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let s1 = h.source(file, anonymous(1), 0);
    let s2 = h.source(file, anonymous(2), 0);
    // Filled in by someone else since the sources were added
    h.files
        .get("a.bin")
        .unwrap()
        .mark_done(ByteRange::new(0, 1000));

    let promoted = h.manager.tick().promoted;
    assert_eq!(promoted.len(), 1);
    let (ran, sibling) = if promoted[0] == s1 { (s1, s2) } else { (s2, s1) };

    assert_eq!(h.status(ran), SourceStatus::Error);
    assert!(h
        .manager
        .source(ran)
        .unwrap()
        .last_reason()
        .unwrap()
        .contains("Nothing left"));
    assert_eq!(h.status(sibling), SourceStatus::Aborted);
    assert!(h.net.log.lock().connects.is_empty());
    assert_eq!(h.manager.running_count(), 0);
    h.assert_consistent();
}

#[test]
fn test_buffer_exhaustion_requeues() {
    let mut config = test_config().max_running(2);
    config.buffers.max_chunks = 7;
    let mut h = Harness::new(config);
    let a = h.file("a.bin", 1000, false);
    let b = h.file("b.bin", 1000, false);
    let s1 = h.source(a, anonymous(1), 0);
    let s2 = h.source(b, anonymous(2), 0);
    h.tick_and_connect();

    h.manager
        .on_response(s1, ResponseInfo::partial(ContentRange::new(0, 999, Some(1000))));
    h.manager
        .on_response(s2, ResponseInfo::partial(ContentRange::new(0, 999, Some(1000))));

    assert_eq!(h.status(s1), SourceStatus::Receiving);
    assert_eq!(h.status(s2), SourceStatus::Queued);
    assert!(h
        .manager
        .source(s2)
        .unwrap()
        .last_reason()
        .unwrap()
        .contains("Resource limit exceeded: buffers (limit: 7)"));
    assert_eq!(h.manager.buffer_pool().available(), 0);
}

// =============================================================================
// Remote queueing and refusals
// =============================================================================

#[test]
fn test_active_queue_keeps_connection() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();
    let conn = h.conn_of(id);

    h.manager.on_response(
        id,
        ResponseInfo::new(503, "Queued")
            .with_keep_alive(true)
            .with_queue(RemoteQueue {
                id: "q-1".into(),
                position: 3,
                length: 10,
                retry_after: Duration::from_secs(30),
                active: true,
            }),
    );
    assert_eq!(h.status(id), SourceStatus::ActiveQueued);
    assert!(!h.net.was_closed(conn));

    h.advance(31);
    h.manager.tick();
    assert_eq!(h.status(id), SourceStatus::Headers);
    assert_eq!(h.net.request_count(), 2);
    assert_eq!(h.net.last_request().0, conn);
}

#[test]
fn test_passive_queue_is_persisted() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();

    h.manager.on_response(
        id,
        ResponseInfo::new(503, "Queued").with_queue(RemoteQueue {
            id: "q-7".into(),
            position: 1,
            length: 2,
            retry_after: Duration::from_secs(45),
            active: false,
        }),
    );
    assert_eq!(h.status(id), SourceStatus::PassiveQueued);
    let records = h.manager.snapshot_records();
    assert_eq!(records[0].queue_id.as_deref(), Some("q-7"));
}

#[test]
fn test_refusal_bans_foreign_servent() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();
    let now = h.manager.now();

    h.manager.on_response(
        id,
        ResponseInfo::new(403, "Forbidden").with_server("OtherServent/2.0"),
    );

    let peer = h.manager.peer(h.manager.source(id).unwrap().peer()).unwrap();
    assert!(peer.has(PeerAttributes::BANNING));
    assert!(peer.has(PeerAttributes::MINIMAL_REQUESTS));
    assert_eq!(peer.hold_until(), now + Duration::from_secs(600));
    assert_eq!(h.status(id), SourceStatus::Queued);

    h.advance(601);
    h.tick_and_connect();
    assert!(h.net.last_request().1.minimal);
}

#[test]
fn test_refusal_from_same_vendor_is_busy() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();
    let now = h.manager.now();

    h.manager
        .on_response(id, ResponseInfo::new(403, "Forbidden").with_server("gosh/0.3"));

    let source = h.manager.source(id).unwrap();
    let peer = h.manager.peer(source.peer()).unwrap();
    assert!(!peer.has(PeerAttributes::BANNING));
    assert_eq!(source.retry_after(), now + Duration::from_secs(10));
}

#[test]
fn test_not_found_stops_source() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();

    h.manager.on_response(id, ResponseInfo::new(404, "Not Found"));
    assert_eq!(h.status(id), SourceStatus::Error);
    assert!(h
        .events()
        .iter()
        .any(|e| matches!(e, TransferEvent::MeshRemoval { .. })));
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_backoff_doubles_between_failures() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);
    h.net.settings.lock().refuse_connect = true;

    h.manager.tick();
    let first = h.manager.source(id).unwrap().retry_after();
    assert_eq!(first, h.manager.now() + Duration::from_secs(1));

    h.advance(1);
    h.manager.tick();
    let second = h.manager.source(id).unwrap().retry_after();
    assert_eq!(second, h.manager.now() + Duration::from_secs(2));
    assert_eq!(h.status(id), SourceStatus::TimeoutWait);
    assert_eq!(h.manager.source(id).unwrap().retries(), 2);
}

#[test]
fn test_peer_unavailable_after_max_failures() {
    let mut config = test_config();
    config.retry.max_failures = 2;
    let mut h = Harness::new(config);
    let a = h.file("a.bin", 1000, false);
    let b = h.file("b.bin", 1000, false);
    let s1 = h.source(a, anonymous(1), 0);
    let s2 = h.source(b, anonymous(1), 1);
    h.net.settings.lock().refuse_connect = true;

    assert_eq!(h.manager.tick().promoted, vec![s1]);
    assert_eq!(h.status(s1), SourceStatus::TimeoutWait);

    assert_eq!(h.manager.tick().promoted, vec![s2]);
    assert_eq!(h.status(s1), SourceStatus::Error);
    assert_eq!(h.status(s2), SourceStatus::Error);

    let peer = h.manager.source(s1).unwrap().peer();
    assert!(h.manager.peer(peer).unwrap().has(PeerAttributes::UNAVAILABLE));
    assert!(h.events().contains(&TransferEvent::PeerUnavailable { peer }));
    h.assert_consistent();

    // A fresh source is new evidence the peer exists
    let c = h.file("c.bin", 1000, false);
    h.source(c, anonymous(1), 2);
    assert!(!h.manager.peer(peer).unwrap().has(PeerAttributes::UNAVAILABLE));
}

#[test]
fn test_header_timeout_is_transient() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();
    let conn = h.conn_of(id);

    h.advance(61);
    let report = h.manager.tick();
    assert_eq!(report.timed_out, vec![id]);
    assert_eq!(h.status(id), SourceStatus::TimeoutWait);
    assert!(h.net.was_closed(conn));
}

#[test]
fn test_backoff_doubles_after_connect_timeouts() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);

    let mut delays = Vec::new();
    for _ in 0..4 {
        assert_eq!(h.manager.tick().promoted, vec![id]);
        assert_eq!(h.status(id), SourceStatus::Connecting);
        h.advance(30);
        assert_eq!(h.manager.tick().timed_out, vec![id]);
        assert_eq!(h.status(id), SourceStatus::TimeoutWait);

        let retry_after = h.manager.source(id).unwrap().retry_after();
        let delay = (1..=60)
            .find(|d| h.manager.now() + Duration::from_secs(*d) == retry_after)
            .expect("delay within bounds");
        delays.push(delay);
        h.advance(delay);
    }
    assert_eq!(delays, vec![1, 2, 4, 8]);
    h.assert_consistent();
}

#[test]
fn test_backoff_doubles_after_header_timeouts() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);

    let mut delays = Vec::new();
    for _ in 0..3 {
        assert_eq!(h.tick_and_connect(), vec![id]);
        assert_eq!(h.status(id), SourceStatus::Headers);
        h.advance(60);
        assert_eq!(h.manager.tick().timed_out, vec![id]);

        let retry_after = h.manager.source(id).unwrap().retry_after();
        let delay = (1..=60)
            .find(|d| h.manager.now() + Duration::from_secs(*d) == retry_after)
            .expect("delay within bounds");
        delays.push(delay);
        h.advance(delay);
    }
    assert_eq!(delays, vec![1, 2, 4]);
}

#[test]
fn test_failed_request_closes_connection_once() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);
    h.net.settings.lock().fail_requests = true;

    h.manager.tick();
    let conn = h.conn_of(id);
    h.manager.on_connected(conn);

    assert_eq!(h.status(id), SourceStatus::TimeoutWait);
    assert_eq!(h.net.close_count(conn), 1);
    h.assert_consistent();
}

#[test]
fn test_local_write_failure_stops_source() {
    let mut h = Harness::new(test_config().overlap_size(0));
    let data = content(1000);
    let file = h.file("a.bin", 1000, false);
    h.files.get("a.bin").unwrap().0.lock().fail_writes("disk full");
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();

    h.serve(id, ContentRange::new(0, 999, Some(1000)), &data);
    assert_eq!(h.status(id), SourceStatus::Error);
    assert_eq!(h.manager.buffer_pool().outstanding(), 0);
    assert_eq!(
        count_events(&h.events(), |e| matches!(e, TransferEvent::AttemptCompleted { .. })),
        0
    );
}

// =============================================================================
// Push fallback
// =============================================================================

fn proxy(n: u8) -> SocketAddr {
    SocketAddr::from(([172, 16, 0, n], 6346))
}

#[test]
fn test_push_proxy_before_routed_push() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h
        .manager
        .add_source(
            file,
            NewSource::new(servent(5), 0)
                .firewalled()
                .with_push_proxies(vec![proxy(1)]),
        )
        .unwrap();

    h.manager.tick();
    assert_eq!(h.status(id), SourceStatus::PushSent);
    assert_eq!(h.net.log.lock().proxy_requests, vec![proxy(1)]);
    assert!(h.net.log.lock().routed_pushes.is_empty());
    assert!(h.net.log.lock().connects.is_empty());

    h.manager.on_proxy_result(id, proxy(1), false);
    assert_eq!(h.status(id), SourceStatus::PushSent);
    assert_eq!(h.net.log.lock().routed_pushes, vec![(guid(5), 0)]);

    let peer = h.manager.source(id).unwrap().peer();
    assert!(h.manager.peer(peer).unwrap().push_proxies().is_empty());
}

#[test]
fn test_failing_proxy_is_skipped() {
    let mut h = Harness::with_defaults();
    h.net.settings.lock().failing_proxies.insert(proxy(1));
    let file = h.file("a.bin", 1000, false);
    let id = h
        .manager
        .add_source(
            file,
            NewSource::new(servent(5), 0)
                .firewalled()
                .with_push_proxies(vec![proxy(1), proxy(2)]),
        )
        .unwrap();

    h.manager.tick();
    assert_eq!(h.net.log.lock().proxy_requests, vec![proxy(1), proxy(2)]);
    assert_eq!(h.status(id), SourceStatus::PushSent);
}

#[test]
fn test_blank_guid_never_pushes() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h
        .manager
        .add_source(file, NewSource::new(anonymous(3), 0).firewalled())
        .unwrap();

    h.manager.tick();
    assert_eq!(h.status(id), SourceStatus::TimeoutWait);
    assert!(h.net.log.lock().routed_pushes.is_empty());
    assert!(h.net.log.lock().proxy_requests.is_empty());
}

#[test]
fn test_connect_timeout_falls_back_to_push() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h
        .manager
        .add_source(
            file,
            NewSource::new(servent(4), 0).with_push_proxies(vec![proxy(9)]),
        )
        .unwrap();

    h.manager.tick();
    let conn = h.conn_of(id);
    h.advance(31);
    let report = h.manager.tick();

    assert_eq!(report.timed_out, vec![id]);
    assert_eq!(h.status(id), SourceStatus::PushSent);
    assert_eq!(h.net.log.lock().proxy_requests, vec![proxy(9)]);
    assert!(h.net.was_closed(conn));
}

#[test]
fn test_routed_push_timeout_marks_peer() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h
        .manager
        .add_source(file, NewSource::new(servent(5), 0).firewalled())
        .unwrap();
    h.manager.tick();
    assert_eq!(h.status(id), SourceStatus::PushSent);

    h.advance(61);
    h.manager.tick();
    assert_eq!(h.status(id), SourceStatus::TimeoutWait);
    let peer = h.manager.source(id).unwrap().peer();
    assert!(h.manager.peer(peer).unwrap().has(PeerAttributes::PUSH_IGNORED));
}

#[test]
fn test_giv_prefers_source_expecting_push() {
    let mut h = Harness::with_defaults();
    let a = h.file("a.bin", 1000, false);
    let b = h.file("b.bin", 1000, false);
    let pushed = h
        .manager
        .add_source(a, NewSource::new(servent(5), 1).firewalled())
        .unwrap();
    let waiting = h
        .manager
        .add_source(b, NewSource::new(servent(5), 2).firewalled())
        .unwrap();
    h.manager.tick();
    assert_eq!(h.status(pushed), SourceStatus::PushSent);
    assert_eq!(h.status(waiting), SourceStatus::Queued);

    let giv = Giv {
        guid: guid(5),
        file_index: 2,
        addr: "10.0.0.5:40000".parse().unwrap(),
    };
    assert_eq!(h.manager.on_giv(giv, ConnectionId(900)), Some(pushed));
    assert_eq!(h.status(pushed), SourceStatus::Headers);
    assert_eq!(h.net.last_request().0, ConnectionId(900));
    h.assert_consistent();
}

#[test]
fn test_giv_promotes_waiting_source_in_place() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, servent(6), 4);

    let giv = Giv {
        guid: guid(6),
        file_index: 4,
        addr: "10.0.0.6:41000".parse().unwrap(),
    };
    assert_eq!(h.manager.on_giv(giv, ConnectionId(901)), Some(id));
    assert_eq!(h.status(id), SourceStatus::Headers);
    assert!(h.net.log.lock().connects.is_empty());
    assert_eq!(h.manager.running_count(), 1);
    h.assert_consistent();
}

#[test]
fn test_giv_declines_second_source_of_unswarmed_file() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let running = h.source(file, anonymous(1), 0);
    h.manager.tick();
    assert_eq!(h.status(running), SourceStatus::Connecting);
    let waiting = h.source(file, servent(6), 4);

    let giv = Giv {
        guid: guid(6),
        file_index: 4,
        addr: "10.0.0.6:41000".parse().unwrap(),
    };
    assert_eq!(h.manager.on_giv(giv, ConnectionId(904)), None);
    assert!(h.net.was_closed(ConnectionId(904)));
    assert_eq!(h.status(waiting), SourceStatus::Queued);
    assert_eq!(h.manager.running_count(), 1);
    assert_eq!(h.net.request_count(), 0);
    h.assert_consistent();
}

#[test]
fn test_giv_respects_global_running_cap() {
    let mut h = Harness::new(test_config().max_running(1));
    let a = h.file("a.bin", 1000, false);
    let b = h.file("b.bin", 1000, false);
    let running = h.source(a, anonymous(1), 0);
    h.manager.tick();
    assert_eq!(h.status(running), SourceStatus::Connecting);
    let waiting = h.source(b, servent(6), 4);

    let giv = Giv {
        guid: guid(6),
        file_index: 4,
        addr: "10.0.0.6:41000".parse().unwrap(),
    };
    assert_eq!(h.manager.on_giv(giv, ConnectionId(905)), None);
    assert!(h.net.was_closed(ConnectionId(905)));
    assert_eq!(h.status(waiting), SourceStatus::Queued);
    assert_eq!(h.manager.running_count(), 1);
    h.assert_consistent();
}

#[test]
fn test_giv_from_new_address_merges_peer() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, servent(7), 0);
    let stale = h.manager.source(id).unwrap().peer();

    let giv = Giv {
        guid: guid(7),
        file_index: 0,
        addr: "10.9.9.9:1234".parse().unwrap(),
    };
    assert_eq!(h.manager.on_giv(giv, ConnectionId(902)), Some(id));

    let peer = h.manager.source(id).unwrap().peer();
    assert_ne!(peer, stale);
    assert_eq!(
        h.manager.peer(peer).unwrap().identity().addr,
        "10.9.9.9:6346".parse::<SocketAddr>().unwrap()
    );
    assert!(h
        .events()
        .contains(&TransferEvent::PeerMerged { from: stale, into: peer }));
    h.assert_consistent();
}

#[test]
fn test_unmatched_giv_is_closed() {
    let mut h = Harness::with_defaults();
    let giv = Giv {
        guid: guid(9),
        file_index: 0,
        addr: "10.7.7.7:5000".parse().unwrap(),
    };
    assert_eq!(h.manager.on_giv(giv, ConnectionId(903)), None);
    assert!(h.net.was_closed(ConnectionId(903)));
}

// =============================================================================
// Peer registry
// =============================================================================

#[test]
fn test_address_change_moves_sources() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, servent(1), 0);
    let stale = h.manager.source(id).unwrap().peer();
    let new_addr: SocketAddr = "10.1.1.1:6346".parse().unwrap();

    let canonical = h.manager.merge_on_address_change(stale, new_addr).unwrap();
    assert_ne!(canonical, stale);
    assert_eq!(h.manager.source(id).unwrap().peer(), canonical);
    assert_eq!(h.manager.registry().find_by_addr(&new_addr), Some(canonical));
    assert_eq!(h.manager.peer(stale).unwrap().refcount(), 0);
    h.assert_consistent();

    assert_eq!(h.manager.tick().retired, vec![stale]);
    assert!(h.manager.peer(stale).is_none());
    h.assert_consistent();
}

#[test]
fn test_address_change_drops_duplicate_source() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let moving = h.source(file, servent(1), 0);
    let staying = h.source(file, servent(2), 0);
    let stale = h.manager.source(moving).unwrap().peer();
    let owner = h.manager.source(staying).unwrap().peer();

    let canonical = h.manager.merge_on_address_change(stale, addr(2)).unwrap();
    assert_eq!(canonical, owner);
    assert!(h.manager.source(moving).is_none());
    assert!(h.manager.source(staying).is_some());
    h.assert_consistent();
}

#[test]
fn test_duplicate_source_is_returned() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let first = h.source(file, anonymous(1), 0);
    let again = h.source(file, anonymous(1), 0);
    assert_eq!(first, again);
    assert_eq!(h.manager.source_ids().len(), 1);
}

#[test]
fn test_hostname_lookup_is_rate_limited() {
    let mut h = Harness::with_defaults();
    let file = h.file("a.bin", 1000, false);
    let id = h
        .manager
        .add_source(
            file,
            NewSource::new(anonymous(1), 0).with_hostname("peer.example.net"),
        )
        .unwrap();

    h.manager.tick();
    assert_eq!(h.net.log.lock().lookups.len(), 1);

    h.manager.stop(id, "again").unwrap();
    let b = h.file("b.bin", 1000, false);
    h.source(b, anonymous(1), 1);
    h.manager.tick();
    assert_eq!(h.net.log.lock().lookups.len(), 1);
    assert_eq!(h.net.log.lock().connects.len(), 2);
}

// =============================================================================
// Verification, relocation and persistence
// =============================================================================

#[test]
fn test_verified_file_is_moved() {
    let mut h = Harness::new(test_config().overlap_size(0));
    let data = content(1000);
    let file = h.file("a.bin", 1000, false);
    h.manager.set_destination(file, "/srv/done/a.bin").unwrap();
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();
    h.serve(id, ContentRange::new(0, 999, Some(1000)), &data);
    assert_eq!(h.status(id), SourceStatus::VerifyWait);

    h.manager.on_verify_start(file);
    assert_eq!(h.status(id), SourceStatus::Verifying);
    h.manager.on_verify_done(file, true);
    assert_eq!(h.status(id), SourceStatus::MoveWait);
    assert_eq!(h.net.log.lock().moves.len(), 1);

    h.manager.on_move_start(file);
    h.manager.on_move_done(file);
    assert_eq!(h.status(id), SourceStatus::Done);
    let events = h.events();
    assert!(events.contains(&TransferEvent::FileVerified { file, ok: true }));
    assert!(events.contains(&TransferEvent::FileMoved { file }));
    h.assert_consistent();
}

#[test]
fn test_failed_verification_is_an_error() {
    let mut h = Harness::new(test_config().overlap_size(0));
    let data = content(1000);
    let file = h.file("a.bin", 1000, false);
    let id = h.source(file, anonymous(1), 0);
    h.tick_and_connect();
    h.serve(id, ContentRange::new(0, 999, Some(1000)), &data);

    h.manager.on_verify_done(file, false);
    assert_eq!(h.status(id), SourceStatus::Error);
}

#[test]
fn test_records_restore_through_add_path() {
    let mut h = Harness::with_defaults();
    let a = h.file("a.ogg", 5000, true);
    h.source(a, servent(1), 0);
    h.manager
        .add_source(
            a,
            NewSource::new(anonymous(2), 3).with_hostname("peer.example.net"),
        )
        .unwrap();
    let unknown = h
        .manager
        .add_file(FileSpec {
            name: "b; live.ogg".into(),
            size: None,
            hash: Some("urn:sha1:ABC".into()),
            swarming: false,
        })
        .unwrap();
    h.source(unknown, anonymous(3), 1);

    let text = encode_records(&h.manager.snapshot_records());
    let records = decode_records(&text);
    assert_eq!(records.len(), 3);

    let mut restored = Harness::with_defaults();
    assert_eq!(restored.manager.restore(&records).unwrap(), 3);

    let a = restored.manager.file_by_name("a.ogg").unwrap();
    assert!(restored.manager.file(a).unwrap().swarming());
    assert_eq!(restored.manager.file(a).unwrap().sources().len(), 2);
    let b = restored.manager.file_by_name("b; live.ogg").unwrap();
    assert!(!restored.manager.file(b).unwrap().swarming());
    assert_eq!(restored.manager.file(b).unwrap().hash(), Some("urn:sha1:ABC"));

    let hosts: Vec<_> = restored
        .manager
        .registry()
        .iter()
        .filter_map(|p| p.hostname().map(str::to_string))
        .collect();
    assert_eq!(hosts, vec!["peer.example.net".to_string()]);
    restored.assert_consistent();
}
