//! Tracker pipeline: enrichment, sampling, exclusion, batching, retry, page view
//! durations and disposal.

use crate::common::{
    device, options, paths, RecordingTransport, TestPage, EDGE_WINDOWS_UA, START_MS,
};
use pretty_assertions::assert_eq;
use site_tracker::env::SystemRandom;
use site_tracker::session::get_session_data;
use site_tracker::{
    Environment, EventDraft, EventType, Headless, HostEnvironment, Storage, Tracker, TrackerState,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn payload_keeps_identity_and_time_of_enqueue() {
    let page = TestPage::new();
    let transport = RecordingTransport::new();
    let tracker = page.tracker(options(), transport.clone());
    let fingerprint = tracker.device_fingerprint().to_string();

    tracker.track(EventDraft::pageview("/posts/rust"));
    page.clock.advance(30_000);
    tracker.set_user_id("reader-7");
    tracker.track(EventDraft::pageview("/about"));
    page.clock.advance(30_000);
    assert_eq!(tracker.flush(), 2);
    tracker.settle().await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].session_id, tracker.session_id().as_str());
    assert_eq!(sent[0].user_id, fingerprint);
    assert_eq!(sent[0].timestamp, START_MS);
    assert_eq!(sent[1].user_id, "reader-7");
    assert_eq!(sent[1].timestamp, START_MS + 30_000);
    for event in &sent {
        assert!(!event.event_type.as_str().is_empty());
        assert!(!event.page_path.is_empty());
        assert!(!event.session_id.is_empty());
        assert!(!event.user_id.is_empty());
        assert!(event.timestamp > 0);
    }
    let ctx = &transport.contexts()[0];
    assert_eq!(ctx.session_id, *tracker.session_id());
    assert_eq!(ctx.device_fingerprint.as_str(), fingerprint);
}

#[tokio::test]
async fn dispose_twice_emits_one_final_pageview() {
    let page = TestPage::new();
    let transport = RecordingTransport::new();
    let tracker = page.tracker(options(), transport.clone());

    tracker.track_page_view("/posts/rust", None, None);
    page.clock.advance(7_900);
    tracker.dispose();
    tracker.dispose();
    tracker.settle().await;
    tracker.dispose();

    let last: Vec<_> = transport
        .sent()
        .into_iter()
        .filter(|e| e.meta_bool("is_last_page") == Some(true))
        .collect();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].event_type, EventType::Pageview);
    assert_eq!(last[0].page_path, "/posts/rust");
    assert_eq!(last[0].event_duration, Some(7));
    assert_eq!(transport.sent().len(), 2);
    assert_eq!(tracker.state(), TrackerState::Disposed);
}

#[tokio::test]
async fn dispose_without_open_page_only_flushes() {
    let page = TestPage::new();
    let transport = RecordingTransport::new();
    let tracker = page.tracker(options(), transport.clone());
    tracker.track(EventDraft::click("/"));
    tracker.shutdown().await;
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event_type, EventType::Click);
}

#[tokio::test]
async fn sampling_zero_drops_everything_and_one_keeps_everything() {
    let page = TestPage::new();
    let none = page.tracker(options().sampling(0.0).batch_size(1000), RecordingTransport::new());
    for i in 0..50 {
        none.track(EventDraft::pageview(format!("/p/{i}")));
    }
    assert_eq!(none.pending(), 0);
    assert!(none.drain_logs().is_empty(), "drops are debug-only");

    let env = HostEnvironment::new(device(EDGE_WINDOWS_UA)).with_random(Arc::new(SystemRandom::default()));
    let all = Tracker::new(options().sampling(1.0).batch_size(1000), Arc::new(env), RecordingTransport::new())
        .expect("tracker");
    for i in 0..200 {
        all.track(EventDraft::pageview(format!("/p/{i}")));
    }
    assert_eq!(all.pending(), 200);
}

#[tokio::test]
async fn exclude_paths_drop_matching_events_only() {
    let page = TestPage::new();
    let tracker = page.tracker(
        options().exclude_paths(["/admin*"]).batch_size(1000),
        RecordingTransport::new(),
    );
    for path in ["/admin", "/admin/posts/new", "/", "/posts/admin-tools", "/about"] {
        tracker.track(EventDraft::pageview(path));
    }
    assert_eq!(paths(&tracker.queued()), vec!["/", "/posts/admin-tools", "/about"]);
}

#[tokio::test]
async fn third_track_flushes_synchronously_with_batch_size_three() {
    let page = TestPage::new();
    let transport = RecordingTransport::new();
    let tracker = page.tracker(options().batch_size(3), transport.clone());

    tracker.track(EventDraft::click("/a"));
    tracker.track(EventDraft::click("/b"));
    assert_eq!(tracker.pending(), 2);
    tracker.track(EventDraft::click("/c"));
    assert_eq!(tracker.pending(), 0);

    tracker.settle().await;
    let batches = transport.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(paths(&batches[0]), vec!["/a", "/b", "/c"]);
}

#[tokio::test]
async fn page_view_duration_is_floored_seconds_since_previous_view() {
    let page = TestPage::new();
    let tracker = page.tracker(options().batch_size(1000), RecordingTransport::new());

    tracker.track_page_view("/", None, None);
    page.clock.advance(2_500);
    tracker.track_page_view("/posts/rust", None, None);
    page.clock.advance(999);
    page.navigate_document("/about");
    tracker.track_page_view("/about", Some("https://search.example/?q=rust blog"), None);

    let queued = tracker.queued();
    assert_eq!(queued[0].event_duration, None);
    assert_eq!(queued[1].event_duration, Some(2));
    assert_eq!(queued[2].event_duration, Some(0));
    assert_eq!(queued[2].referrer.as_deref(), Some("https://search.example/?q=rust%20blog"));
    assert_eq!(queued[0].meta_str("title"), Some("blog /"));
    assert_eq!(queued[0].meta_str("url"), Some("https://blog.example/"));
    assert_eq!(queued[2].meta_str("title"), Some("blog /about"));
}

#[tokio::test]
async fn failed_batch_is_requeued_before_newer_events() {
    let page = TestPage::new();
    let transport = RecordingTransport::failing();
    let tracker = page.tracker(options().batch_size(3), transport.clone());

    for path in ["/1", "/2", "/3"] {
        tracker.track(EventDraft::pageview(path));
    }
    assert_eq!(tracker.pending(), 0, "batch handed to the transport");
    // Tracked while the failing send is in flight.
    tracker.track(EventDraft::pageview("/4"));
    tracker.track(EventDraft::pageview("/5"));

    tracker.settle().await;
    assert_eq!(transport.attempts(), 1);
    assert_eq!(paths(&tracker.queued()), vec!["/1", "/2", "/3", "/4", "/5"]);
    assert!(tracker
        .drain_logs()
        .iter()
        .any(|l| l.contains("failed to send 3 events: HTTP error 503")));

    transport.set_failing(false);
    assert_eq!(tracker.flush(), 5);
    tracker.settle().await;
    assert_eq!(paths(&transport.sent()), vec!["/1", "/2", "/3", "/4", "/5"]);
    assert_eq!(tracker.pending(), 0);
}

#[tokio::test]
async fn two_failed_batches_in_flight_keep_tracking_order() {
    let page = TestPage::new();
    let transport = RecordingTransport::failing();
    let tracker = page.tracker(options().batch_size(3), transport.clone());

    for path in ["/1", "/2", "/3", "/4", "/5", "/6"] {
        tracker.track(EventDraft::pageview(path));
    }
    assert_eq!(tracker.pending(), 0, "both batches handed to the transport");
    tracker.track(EventDraft::pageview("/7"));

    tracker.settle().await;
    assert_eq!(transport.attempts(), 2);
    assert_eq!(
        paths(&tracker.queued()),
        vec!["/1", "/2", "/3", "/4", "/5", "/6", "/7"]
    );
}

#[tokio::test]
async fn earlier_batch_fails_while_later_batch_is_delivered() {
    let page = TestPage::new();
    let transport = RecordingTransport::new();
    transport.fail_next(1);
    let tracker = page.tracker(options().batch_size(3), transport.clone());

    for path in ["/1", "/2", "/3", "/4", "/5", "/6"] {
        tracker.track(EventDraft::pageview(path));
    }
    tracker.track(EventDraft::pageview("/7"));
    tracker.settle().await;

    assert_eq!(paths(&transport.sent()), vec!["/4", "/5", "/6"]);
    assert_eq!(paths(&tracker.queued()), vec!["/1", "/2", "/3", "/7"]);

    assert_eq!(tracker.flush(), 4);
    tracker.settle().await;
    let batches = transport.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(paths(&batches[1]), vec!["/1", "/2", "/3", "/7"]);
    assert_eq!(tracker.pending(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_failures_requeue_in_tracking_order() {
    let page = TestPage::new();
    let (transport, gate) = RecordingTransport::gated();
    transport.set_failing(true);
    let tracker = page.tracker(options().batch_size(2), transport.clone());

    for path in ["/1", "/2", "/3", "/4", "/5"] {
        tracker.track(EventDraft::pageview(path));
    }
    assert_eq!(paths(&tracker.queued()), vec!["/5"]);
    // Both held sends fail, in whichever order the workers run them.
    gate.add_permits(2);
    tracker.settle().await;

    assert_eq!(transport.attempts(), 2);
    assert_eq!(paths(&tracker.queued()), vec!["/1", "/2", "/3", "/4", "/5"]);
}

#[tokio::test]
async fn platform_is_resolved_from_user_agent() {
    let page = TestPage::with_env(HostEnvironment::new(device(EDGE_WINDOWS_UA)));
    let tracker = page.tracker(options(), RecordingTransport::new());
    tracker.track(EventDraft::pageview("/"));
    tracker.track(EventDraft::pageview("/").platform("Custom/Agent"));
    let queued = tracker.queued();
    assert_eq!(queued[0].platform.as_deref(), Some("Windows/Edge"));
    assert_eq!(queued[1].platform.as_deref(), Some("Custom/Agent"));
}

#[tokio::test]
async fn tracking_refreshes_session_activity() {
    let page = TestPage::new();
    let tracker = page.tracker(options(), RecordingTransport::new());
    page.clock.advance(12_000);
    tracker.track(EventDraft::pageview("/"));
    let keys = &tracker.options().storage_keys;
    let data = get_session_data(page.env.as_ref(), &keys.session_data, tracker.logger()).expect("session data");
    assert_eq!(data.id, tracker.session_id().as_str());
    assert_eq!(data.created, START_MS);
    assert_eq!(data.last_activity, START_MS + 12_000);
}

#[tokio::test]
async fn session_survives_navigation_and_ends_with_the_context() {
    let page = TestPage::new();
    let first = page.tracker(options(), RecordingTransport::new());
    let second = page.tracker(options(), RecordingTransport::new());
    assert_eq!(first.session_id(), second.session_id());
    assert_eq!(first.device_fingerprint(), second.device_fingerprint());

    page.env.session_storage().clear().expect("end browsing context");
    page.clock.advance(60_000);
    let third = page.tracker(options(), RecordingTransport::new());
    assert_ne!(third.session_id(), first.session_id());
    assert_eq!(third.device_fingerprint(), first.device_fingerprint());
}

#[tokio::test(start_paused = true)]
async fn timer_flushes_queued_events_each_interval() {
    let page = TestPage::new();
    let transport = RecordingTransport::new();
    let tracker = page.tracker(options().batch_interval(Duration::from_millis(5_000)), transport.clone());

    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(transport.attempts(), 0, "empty queue is not flushed");

    tracker.track(EventDraft::pageview("/"));
    tokio::time::sleep(Duration::from_millis(4_000)).await;
    assert_eq!(transport.attempts(), 0);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    tracker.settle().await;
    assert_eq!(transport.attempts(), 1);
    assert_eq!(tracker.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn timer_stops_after_dispose() {
    let page = TestPage::new();
    let transport = RecordingTransport::failing();
    let tracker = page.tracker(options(), transport.clone());
    tracker.track(EventDraft::pageview("/"));
    tracker.shutdown().await;
    assert_eq!(transport.attempts(), 1);
    assert_eq!(tracker.pending(), 1, "failed final flush stays queued");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test]
async fn headless_environment_never_tracks() {
    let transport = RecordingTransport::new();
    let tracker = Tracker::new(options().batch_size(1), Arc::new(Headless::new()), transport.clone())
        .expect("tracker");
    assert!(!tracker.env().is_browser());
    tracker.track_page_view("/", None, None);
    tracker.track(EventDraft::click("/"));
    tracker.shutdown().await;
    assert_eq!(transport.attempts(), 0);
    assert_eq!(tracker.device_fingerprint().as_str(), "server-side-rendering");
}
