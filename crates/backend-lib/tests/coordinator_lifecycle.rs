//! Session lifecycle scenarios against the in-memory store.
mod common;

use backend_lib::coordinator::{CoordinatorConfig, Registration};
use backend_lib::error::AppError;
use backend_lib::hub::Channel;
use backend_lib::messages::{ServerMessage, TempoDirection, TrackInfo};
use backend_lib::storage::WriteKind;
use backend_lib::telemetry::LifecycleKind;
use common::{drain, harness, harness_with};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

fn kinds(store: &backend_lib::storage::MemoryStore) -> Vec<WriteKind> {
    store.writes().iter().map(|w| w.kind).collect()
}

#[tokio::test(start_paused = true)]
async fn track_before_session_row_waits_for_gate() {
    let h = harness();
    h.store.set_session_insert_delay(Duration::from_millis(800));
    let dj = Uuid::new_v4();

    h.coordinator
        .register_session(dj, "s1", "DJ", None, None)
        .unwrap();
    h.coordinator
        .change_track(dj, "s1", TrackInfo::new("A", "B"))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.store.tracks().is_empty());
    assert_eq!(h.coordinator.gate().pending_waiters("s1"), 1);

    drain(&h.coordinator, "s1").await;
    assert_eq!(kinds(&h.store), vec![WriteKind::Session, WriteKind::PlayedTrack]);
    assert_eq!(h.coordinator.gate().pending_waiters("s1"), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_now_playing_is_persisted_once() {
    let h = harness();
    let dj = Uuid::new_v4();
    h.coordinator
        .register_session(dj, "s1", "DJ", None, None)
        .unwrap();

    for _ in 0..10 {
        h.coordinator
            .change_track(dj, "s1", TrackInfo::new("A", "B"))
            .unwrap();
    }
    drain(&h.coordinator, "s1").await;
    assert_eq!(h.store.tracks().len(), 1);

    h.coordinator
        .change_track(dj, "s1", TrackInfo::new("A", "C"))
        .unwrap();
    drain(&h.coordinator, "s1").await;

    let tracks = h.store.tracks();
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[1].track.title, "C");
    assert_eq!(
        h.coordinator.persistence().last_persisted_key("s1").as_deref(),
        Some("A:C")
    );
}

#[tokio::test(start_paused = true)]
async fn like_right_after_track_attaches_to_new_play() {
    let h = harness();
    let dj = Uuid::new_v4();
    let track = TrackInfo::new("A", "B");
    h.coordinator
        .register_session(dj, "s1", "DJ", None, Some(track.clone()))
        .unwrap();
    h.coordinator
        .change_track(dj, "s1", TrackInfo::new("X", "Y"))
        .unwrap();
    drain(&h.coordinator, "s1").await;

    // Replay A:B with a slow insert and like it straight away
    h.store.set_track_insert_delay(Duration::from_millis(300));
    h.coordinator.change_track(dj, "s1", track.clone()).unwrap();
    h.coordinator
        .record_like("s1", track, Some("client-1".to_string()))
        .unwrap();
    drain(&h.coordinator, "s1").await;

    let tracks = h.store.tracks();
    let newest = tracks.last().unwrap();
    assert_eq!(newest.track.dedup_key(), "A:B");
    assert_ne!(newest.id, tracks[0].id);

    let likes = h.store.likes();
    assert_eq!(likes.len(), 1);
    assert_eq!(likes[0].played_track_id, newest.id);
    assert_eq!(likes[0].client_id.as_deref(), Some("client-1"));
    assert_eq!(kinds(&h.store).last(), Some(&WriteKind::Like));
}

#[tokio::test(start_paused = true)]
async fn tempo_tally_is_flushed_on_track_change() {
    let h = harness();
    let dj = Uuid::new_v4();
    h.coordinator
        .register_session(dj, "s1", "DJ", None, Some(TrackInfo::new("A", "B")))
        .unwrap();

    h.coordinator
        .record_tempo_vote("s1", Some("c1"), TempoDirection::Faster)
        .unwrap();
    h.coordinator
        .record_tempo_vote("s1", Some("c2"), TempoDirection::Perfect)
        .unwrap();
    // Changing your mind moves the vote
    h.coordinator
        .record_tempo_vote("s1", Some("c1"), TempoDirection::Slower)
        .unwrap();

    // Same song again: not a boundary
    h.coordinator
        .change_track(dj, "s1", TrackInfo::new("A", "B"))
        .unwrap();
    assert_eq!(h.coordinator.tempo_counts("s1").total(), 2);

    h.coordinator
        .change_track(dj, "s1", TrackInfo::new("C", "D"))
        .unwrap();
    // No votes for C:D, so the next boundary writes nothing
    h.coordinator
        .change_track(dj, "s1", TrackInfo::new("E", "F"))
        .unwrap();
    drain(&h.coordinator, "s1").await;

    let rows = h.store.tempo_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].artist.as_str(), rows[0].title.as_str()), ("A", "B"));
    assert_eq!((rows[0].slower, rows[0].perfect, rows[0].faster), (1, 1, 0));
}

#[tokio::test(start_paused = true)]
async fn dj_disconnect_releases_every_session_structure() {
    let h = harness();
    let dj = Uuid::new_v4();
    let listener = Uuid::new_v4();
    h.coordinator
        .register_session(dj, "s1", "DJ", None, Some(TrackInfo::new("A", "B")))
        .unwrap();
    h.coordinator.subscribe_listener(listener, "s1").unwrap();
    h.coordinator
        .record_tempo_vote("s1", Some("c1"), TempoDirection::Faster)
        .unwrap();
    let poll_id = h
        .coordinator
        .start_poll(
            dj,
            "s1",
            "Next?".to_string(),
            vec!["House".to_string(), "Techno".to_string()],
            None,
        )
        .await
        .unwrap();
    h.coordinator
        .vote_on_poll("s1", poll_id, Some("c1"), 1)
        .unwrap();

    let mut discovery = h.hub.subscribe(&Channel::Discovery);
    h.coordinator.disconnect_dj(dj, "s1").await;

    assert!(!h.coordinator.retains_state("s1"));
    assert_eq!(h.coordinator.listener_count("s1"), 0);
    assert_eq!(h.hub.subscriber_count(&Channel::Session("s1".to_string())), 0);

    // Tally flushed against the track before the session was marked ended
    let order = kinds(&h.store);
    let tempo = order.iter().position(|k| *k == WriteKind::TempoVotes).unwrap();
    let ended = order.iter().position(|k| *k == WriteKind::SessionEnded).unwrap();
    assert!(tempo < ended);
    assert_eq!(h.store.tempo_rows()[0].title, "B");

    let polls = h.store.polls();
    assert!(polls[0].closed_at.is_some());
    assert_eq!(polls[0].votes, vec![0, 1]);

    assert_eq!(
        discovery.recv().await.unwrap(),
        ServerMessage::SessionEnded {
            session_id: "s1".to_string()
        }
    );

    tokio::task::yield_now().await;
    let events = h.telemetry.events();
    let last = events.last().unwrap();
    assert_eq!(last.kind, LifecycleKind::Disconnect);
    assert_eq!(last.reason.as_deref(), Some("disconnected"));
}

#[tokio::test(start_paused = true)]
async fn failed_session_insert_wakes_waiters_with_false() {
    let h = harness();
    h.store.fail_session_inserts(true);
    let dj = Uuid::new_v4();
    let start = Instant::now();

    h.coordinator
        .register_session(dj, "s1", "DJ", None, Some(TrackInfo::new("A", "B")))
        .unwrap();
    drain(&h.coordinator, "s1").await;

    // Resolved by the failure signal, not by the 4s timeout
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(h.store.tracks().is_empty());
    assert!(!h.coordinator.gate().is_persisted("s1"));

    let err = h
        .coordinator
        .start_poll(dj, "s1", "Q?".to_string(), vec!["a".into(), "b".into()], None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SessionNotReady(_)));
}

#[tokio::test(start_paused = true)]
async fn poll_creation_gives_up_after_poll_timeout() {
    let h = harness();
    h.store.set_session_insert_delay(Duration::from_secs(10));
    let dj = Uuid::new_v4();
    h.coordinator
        .register_session(dj, "s1", "DJ", None, None)
        .unwrap();

    let start = Instant::now();
    let err = h
        .coordinator
        .start_poll(dj, "s1", "Q?".to_string(), vec!["a".into(), "b".into()], None)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::SessionNotReady(_)));
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(3));
    assert!(waited < Duration::from_secs(4));
    assert_eq!(h.coordinator.gate().pending_waiters("s1"), 0);
    assert!(h.store.polls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn session_ending_before_its_row_lands_leaves_nothing_behind() {
    let h = harness();
    h.store.set_session_insert_delay(Duration::from_secs(10));
    let dj = Uuid::new_v4();
    h.coordinator
        .register_session(dj, "s1", "DJ", None, Some(TrackInfo::new("A", "B")))
        .unwrap();

    h.coordinator.end_session(dj, "s1").await.unwrap();
    assert!(!h.coordinator.is_live("s1"));

    // Let the slow insert finish
    tokio::time::sleep(Duration::from_secs(10)).await;
    tokio::task::yield_now().await;

    assert!(!h.coordinator.retains_state("s1"));
    assert_eq!(h.coordinator.gate().pending_waiters("s1"), 0);
    assert!(h.store.tracks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn bypass_mode_skips_the_wait() {
    let config = CoordinatorConfig {
        bypass_readiness: true,
        ..CoordinatorConfig::default()
    };
    let h = harness_with(config);
    h.store.set_session_insert_delay(Duration::from_secs(10));
    let dj = Uuid::new_v4();
    let start = Instant::now();

    h.coordinator
        .register_session(dj, "s1", "DJ", None, Some(TrackInfo::new("A", "B")))
        .unwrap();
    drain(&h.coordinator, "s1").await;

    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(h.store.tracks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn poll_closes_when_its_duration_elapses() {
    let h = harness();
    let dj = Uuid::new_v4();
    h.coordinator
        .register_session(dj, "s1", "DJ", None, None)
        .unwrap();
    let mut feed = h.hub.subscribe(&Channel::Session("s1".to_string()));

    let poll_id = h
        .coordinator
        .start_poll(
            dj,
            "s1",
            "Next?".to_string(),
            vec!["a".into(), "b".into(), "c".into()],
            Some(30),
        )
        .await
        .unwrap();
    assert!(matches!(
        feed.recv().await.unwrap(),
        ServerMessage::PollStarted { ends_at: Some(_), .. }
    ));

    // A second poll is refused while one is open
    assert!(h
        .coordinator
        .start_poll(dj, "s1", "Other?".to_string(), vec!["x".into(), "y".into()], None)
        .await
        .is_err());

    h.coordinator
        .vote_on_poll("s1", poll_id, Some("c1"), 2)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert!(h.coordinator.active_poll_id("s1").is_none());
    drain(&h.coordinator, "s1").await;
    let polls = h.store.polls();
    assert_eq!(polls.len(), 1);
    assert_eq!(polls[0].votes, vec![0, 0, 1]);
    assert!(polls[0].closed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_broadcasts_listener_counts() {
    let h = harness();
    h.coordinator
        .register_session(Uuid::new_v4(), "s1", "DJ", None, None)
        .unwrap();
    let mut feed = h.hub.subscribe(&Channel::Session("s1".to_string()));
    h.coordinator.subscribe_listener(Uuid::new_v4(), "s1").unwrap();
    let gone = Uuid::new_v4();
    h.coordinator.subscribe_listener(gone, "s1").unwrap();
    h.coordinator.remove_listener(gone, "s1");

    let heartbeat = h.coordinator.spawn_heartbeat(Duration::from_secs(10));
    assert_eq!(
        feed.recv().await.unwrap(),
        ServerMessage::ListenerCount {
            session_id: "s1".to_string(),
            count: 1
        }
    );
    heartbeat.abort();
}

#[tokio::test(start_paused = true)]
async fn shutdown_ends_every_live_session() {
    let h = harness();
    for id in ["s1", "s2", "s3"] {
        h.coordinator
            .register_session(Uuid::new_v4(), id, "DJ", None, None)
            .unwrap();
    }

    h.coordinator.shutdown().await;

    assert_eq!(h.coordinator.live_session_count(), 0);
    for id in ["s1", "s2", "s3"] {
        assert!(h.store.session(id).unwrap().ended_at.is_some());
        assert!(!h.coordinator.retains_state(id));
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_is_reported_and_keeps_readiness() {
    let h = harness();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    h.coordinator
        .register_session(first, "s1", "DJ", None, None)
        .unwrap();
    assert!(
        h.coordinator
            .gate()
            .ensure_ready("s1", Duration::from_secs(1))
            .await
    );

    h.coordinator
        .register_session(second, "s1", "DJ", None, None)
        .unwrap();
    assert!(h.coordinator.gate().is_persisted("s1"));
    assert!(matches!(
        h.coordinator
            .change_track(first, "s1", TrackInfo::new("A", "B")),
        Err(AppError::NotSessionOwner(_))
    ));

    tokio::task::yield_now().await;
    let kinds: Vec<LifecycleKind> = h.telemetry.events().iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![LifecycleKind::Connect, LifecycleKind::Reconnect]);
    assert_eq!(h.store.writes_of(WriteKind::Session).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn re_registering_while_teardown_drains_keeps_new_row_open() {
    let h = harness();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    h.coordinator
        .register_session(first, "s1", "DJ", None, None)
        .unwrap();
    drain(&h.coordinator, "s1").await;

    // Keep the lane busy so the end job is still queued
    h.store.set_track_insert_delay(Duration::from_millis(500));
    h.coordinator
        .change_track(first, "s1", TrackInfo::new("A", "B"))
        .unwrap();
    let coordinator = h.coordinator.clone();
    let teardown = tokio::spawn(async move { coordinator.disconnect_dj(first, "s1").await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!h.coordinator.is_live("s1"));

    let registration = h
        .coordinator
        .register_session(second, "s1", "DJ", None, None)
        .unwrap();
    assert_eq!(registration, Registration::Started);
    teardown.await.unwrap();
    drain(&h.coordinator, "s1").await;

    assert!(h.coordinator.is_live("s1"));
    assert!(h.store.session("s1").unwrap().ended_at.is_none());
    let order = kinds(&h.store);
    let ended = order.iter().position(|k| *k == WriteKind::SessionEnded).unwrap();
    let reinserted = order.iter().rposition(|k| *k == WriteKind::Session).unwrap();
    assert!(ended < reinserted, "{order:?}");

    // The previous session's dedup key does not carry over
    h.store.set_track_insert_delay(Duration::ZERO);
    h.coordinator
        .change_track(second, "s1", TrackInfo::new("A", "B"))
        .unwrap();
    drain(&h.coordinator, "s1").await;
    assert_eq!(h.store.tracks().len(), 2);

    h.coordinator.end_session(second, "s1").await.unwrap();
    assert!(h.store.session("s1").unwrap().ended_at.is_some());
    assert!(!h.coordinator.retains_state("s1"));
}

#[tokio::test(start_paused = true)]
async fn session_channel_does_not_outlive_teardown() {
    let h = harness();
    let dj = Uuid::new_v4();
    h.coordinator
        .register_session(dj, "s1", "DJ", None, None)
        .unwrap();
    let mut subscription = h
        .coordinator
        .subscribe_listener(Uuid::new_v4(), "s1")
        .unwrap();
    assert_eq!(h.hub.subscriber_count(&Channel::Session("s1".to_string())), 1);

    h.coordinator.disconnect_dj(dj, "s1").await;
    assert!(matches!(
        subscription.feed.recv().await,
        Ok(ServerMessage::SessionEnded { .. })
    ));
    assert!(subscription.feed.recv().await.is_err());

    // A late subscriber cannot bring the channel back
    assert!(matches!(
        h.coordinator.subscribe_listener(Uuid::new_v4(), "s1"),
        Err(AppError::SessionNotFound(_))
    ));
    assert!(matches!(
        h.coordinator.session_feed("s1"),
        Err(AppError::SessionNotFound(_))
    ));
    assert_eq!(h.hub.channel_count(), 0);
}
