// tests/batcher_test.rs
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use coalescer::batcher::{BatchInfo, Dispatch, DispatchHandler, MessageBatcher};
use coalescer::config::BatcherConfig;
use coalescer::error::BatcherError;
use envelope::{Attachment, Envelope};
use tokio::time::sleep;

/// Collects every dispatch it receives.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Dispatch>>,
}

impl Recorder {
    fn seen(&self) -> Vec<Dispatch> {
        self.seen.lock().unwrap().clone()
    }

    fn for_user(&self, user: &str) -> Vec<Dispatch> {
        self.seen()
            .into_iter()
            .filter(|d| d.envelope.sender_id == user)
            .collect()
    }
}

#[async_trait]
impl DispatchHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, envelope: Envelope, info: BatchInfo) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(Dispatch { envelope, info });
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl DispatchHandler for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    async fn handle(&self, _envelope: Envelope, _info: BatchInfo) -> anyhow::Result<()> {
        bail!("assistant unavailable")
    }
}

struct Panicking;

#[async_trait]
impl DispatchHandler for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn handle(&self, _envelope: Envelope, _info: BatchInfo) -> anyhow::Result<()> {
        panic!("handler bug")
    }
}

fn setup(config: BatcherConfig) -> (MessageBatcher, Arc<Recorder>) {
    let batcher = MessageBatcher::new(config).expect("valid config");
    let recorder = Arc::new(Recorder::default());
    batcher.add_handler(recorder.clone());
    batcher.start();
    (batcher, recorder)
}

fn default_setup() -> (MessageBatcher, Arc<Recorder>) {
    setup(BatcherConfig::default())
}

async fn send(batcher: &MessageBatcher, user: &str, text: &str) -> bool {
    batcher
        .process_message(Envelope::text(user, text))
        .await
        .expect("valid envelope")
}

#[tokio::test(start_paused = true)]
async fn burst_is_delivered_as_one_turn() {
    let (batcher, recorder) = default_setup();

    assert!(send(&batcher, "U1", "Hi").await);
    sleep(Duration::from_millis(300)).await;
    assert!(send(&batcher, "U1", "I need help").await);
    sleep(Duration::from_millis(400)).await;
    assert!(send(&batcher, "U1", "with my taxes").await);

    sleep(Duration::from_millis(1000)).await;
    assert!(recorder.seen().is_empty(), "window still open");

    sleep(Duration::from_millis(2000)).await;
    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].envelope.text.as_deref(), Some("Hi I need help with my taxes"));
    assert_eq!(seen[0].envelope.sender_id, "U1");
    assert!(seen[0].info.is_batched);
    assert_eq!(seen[0].info.message_count, 3);
    assert!(seen[0].info.batch_duration_seconds >= 3.0);
    assert_eq!(batcher.stats().active_batches, 0);
}

#[tokio::test(start_paused = true)]
async fn full_batch_flushes_when_next_message_arrives() {
    let (batcher, recorder) = default_setup();

    for i in 1..=5 {
        assert!(send(&batcher, "U1", &format!("m{i}")).await);
        sleep(Duration::from_millis(100)).await;
    }
    assert!(recorder.seen().is_empty(), "a full batch waits for the next message");

    assert!(send(&batcher, "U1", "m6").await);
    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].info.message_count, 5);
    assert_eq!(seen[0].envelope.text.as_deref(), Some("m1 m2 m3 m4 m5"));

    let stats = batcher.stats();
    assert_eq!(stats.active_batches, 1);
    assert_eq!(stats.batches[0].message_count, 1);

    // old timer (from m1) fires first and must not touch the new batch
    sleep(Duration::from_millis(2600)).await;
    assert_eq!(recorder.seen().len(), 1);

    sleep(Duration::from_millis(500)).await;
    let seen = recorder.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].envelope.text.as_deref(), Some("m6"));
    assert_eq!(seen[1].info.message_count, 1);
}

#[tokio::test(start_paused = true)]
async fn quick_reply_is_dispatched_alone() {
    let (batcher, recorder) = default_setup();

    let queued = batcher
        .process_message(Envelope::quick_reply("U2", "Yes", "YES"))
        .await
        .unwrap();
    assert!(!queued);

    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    assert!(!seen[0].info.is_batched);
    assert_eq!(seen[0].info.message_count, 1);
    assert_eq!(seen[0].envelope.payload.as_deref(), Some("YES"));
    assert_eq!(batcher.stats().active_batches, 0);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(recorder.seen().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn force_flush_then_timer_is_a_no_op() {
    let (batcher, recorder) = default_setup();

    send(&batcher, "U3", "first").await;
    send(&batcher, "U3", "second").await;

    assert!(batcher.force_process_user_batch("U3").await);
    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].info.message_count, 2);
    assert_eq!(batcher.stats().active_batches, 0);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(recorder.seen().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn force_flush_without_batch_returns_false() {
    let (batcher, recorder) = default_setup();

    assert!(!batcher.force_process_user_batch("nobody").await);
    assert!(recorder.seen().is_empty());
    assert_eq!(batcher.stats().tracked_locks, 0);
}

#[tokio::test(start_paused = true)]
async fn immediate_message_flushes_pending_batch_first() {
    let (batcher, recorder) = default_setup();

    send(&batcher, "U1", "Hi").await;
    send(&batcher, "U1", "there").await;
    let queued = batcher
        .process_message(Envelope::attachment(
            "U1",
            vec![Attachment::new("image", Some("https://cdn/bill.jpg".into()))],
        ))
        .await
        .unwrap();
    assert!(!queued);

    let seen = recorder.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].envelope.text.as_deref(), Some("Hi there"));
    assert!(seen[0].info.is_batched);
    assert_eq!(seen[0].info.message_count, 2);
    assert!(!seen[1].info.is_batched);
    assert_eq!(seen[1].envelope.attachments.as_ref().map(Vec::len), Some(1));

    sleep(Duration::from_secs(5)).await;
    assert_eq!(recorder.seen().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn urgent_keyword_skips_batching() {
    let (batcher, recorder) = default_setup();

    assert!(!send(&batcher, "U1", "Please cancel my appointment").await);
    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].envelope.text.as_deref(), Some("Please cancel my appointment"));
    assert!(!seen[0].info.is_batched);
}

#[tokio::test(start_paused = true)]
async fn users_never_merge() {
    let (batcher, recorder) = default_setup();

    send(&batcher, "A", "a1").await;
    send(&batcher, "B", "b1").await;
    send(&batcher, "A", "a2").await;
    send(&batcher, "B", "b2").await;
    send(&batcher, "B", "b3").await;

    sleep(Duration::from_secs(4)).await;

    let a = recorder.for_user("A");
    let b = recorder.for_user("B");
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_eq!(a[0].envelope.text.as_deref(), Some("a1 a2"));
    assert_eq!(b[0].envelope.text.as_deref(), Some("b1 b2 b3"));
    assert_eq!(b[0].info.message_count, 3);
}

#[tokio::test(start_paused = true)]
async fn window_is_fixed_from_first_message() {
    let (batcher, recorder) = default_setup();

    send(&batcher, "U1", "one").await;
    sleep(Duration::from_secs(2)).await;
    send(&batcher, "U1", "two").await;
    sleep(Duration::from_millis(1500)).await;

    // 3.5s after the first message: flushed even though "two" is only 1.5s old
    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].envelope.text.as_deref(), Some("one two"));

    send(&batcher, "U1", "three").await;
    sleep(Duration::from_secs(4)).await;
    let seen = recorder.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].envelope.text.as_deref(), Some("three"));
}

#[tokio::test(start_paused = true)]
async fn failing_handlers_do_not_block_others() {
    let batcher = MessageBatcher::new(BatcherConfig::default()).expect("valid config");
    let recorder = Arc::new(Recorder::default());
    batcher.add_handler(Arc::new(Failing));
    batcher.add_handler(Arc::new(Panicking));
    batcher.add_handler(recorder.clone());
    batcher.start();

    send(&batcher, "U1", "hello").await;
    sleep(Duration::from_secs(4)).await;
    assert_eq!(recorder.seen().len(), 1);

    // state survives the failures
    send(&batcher, "U1", "again").await;
    assert!(batcher.force_process_user_batch("U1").await);
    assert_eq!(recorder.seen().len(), 2);
    assert_eq!(batcher.stats().active_batches, 0);
}

#[tokio::test(start_paused = true)]
async fn missing_sender_is_rejected() {
    let (batcher, recorder) = default_setup();

    let envelope = Envelope::text("  ", "hello").with_message_id("mid.9");
    let err = batcher.process_message(envelope).await.unwrap_err();

    assert_eq!(
        err,
        BatcherError::MissingSenderId {
            message_id: "mid.9".into()
        }
    );
    assert!(recorder.seen().is_empty());
    assert_eq!(batcher.stats().tracked_locks, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_every_user_once() {
    let (batcher, recorder) = default_setup();

    send(&batcher, "A", "a1").await;
    send(&batcher, "B", "b1").await;
    send(&batcher, "B", "b2").await;
    send(&batcher, "C", "c1").await;

    batcher.shutdown().await;

    let seen = recorder.seen();
    assert_eq!(seen.len(), 3);
    let mut users: Vec<_> = seen.iter().map(|d| d.envelope.sender_id.clone()).collect();
    users.sort();
    assert_eq!(users, vec!["A", "B", "C"]);
    assert_eq!(recorder.for_user("B")[0].info.message_count, 2);

    let stats = batcher.stats();
    assert!(stats.shut_down);
    assert_eq!(stats.active_batches, 0);
    assert_eq!(stats.tracked_locks, 0);

    // no timer fires afterwards
    sleep(Duration::from_secs(120)).await;
    assert_eq!(recorder.seen().len(), 3);

    // a second shutdown is harmless
    batcher.shutdown().await;
    assert_eq!(recorder.seen().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn messages_after_shutdown_are_not_lost() {
    let (batcher, recorder) = default_setup();
    batcher.shutdown().await;

    assert!(!send(&batcher, "late", "still here?").await);
    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].envelope.text.as_deref(), Some("still here?"));
    assert!(!seen[0].info.is_batched);
    assert_eq!(batcher.stats().active_batches, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_users_keep_their_own_order() {
    let config = BatcherConfig {
        batch_timeout: Duration::from_secs(60),
        max_batch_size: 10,
        ..BatcherConfig::default()
    };
    let (batcher, recorder) = setup(config);

    let mut tasks = Vec::new();
    for user in 0..32 {
        let batcher = batcher.clone();
        tasks.push(tokio::spawn(async move {
            let user_id = format!("user-{user}");
            for i in 0..5 {
                batcher
                    .process_message(Envelope::text(user_id.clone(), format!("m{i}")))
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    assert_eq!(batcher.stats().active_batches, 32);
    batcher.shutdown().await;

    let seen = recorder.seen();
    assert_eq!(seen.len(), 32);
    for dispatch in seen {
        assert_eq!(dispatch.envelope.text.as_deref(), Some("m0 m1 m2 m3 m4"));
        assert_eq!(dispatch.info.message_count, 5);
    }
}
