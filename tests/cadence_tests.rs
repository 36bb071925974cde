//! Cadence behaviour of the send loop under a paused clock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};

use tg_wireprobe::cancel::cancellation;
use tg_wireprobe::client::{CallConfig, CallContext, MessageTransport};
use tg_wireprobe::errors::CallError;
use tg_wireprobe::hub::{LogEvent, LogSink, Severity};
use tg_wireprobe::worker::{LoopConfig, SendLoop};

/// Transport whose calls take scripted amounts of time.
struct FakeTransport {
    delays: Mutex<VecDeque<Duration>>,
    fallback: Duration,
    starts: Mutex<Vec<Instant>>,
}

impl FakeTransport {
    fn new(delays: &[Duration], fallback: Duration) -> Arc<Self> {
        Arc::new(Self {
            delays: Mutex::new(delays.iter().copied().collect()),
            fallback,
            starts: Mutex::new(Vec::new()),
        })
    }

    fn starts(&self) -> Vec<Instant> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageTransport for FakeTransport {
    async fn send(&self, _call: &CallConfig, _ctx: CallContext) -> Result<(), CallError> {
        self.starts.lock().unwrap().push(Instant::now());
        let delay = self
            .delays
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        sleep(delay).await;
        Ok(())
    }
}

fn loop_config(interval: Duration) -> LoopConfig {
    LoopConfig {
        call_timeout: Duration::from_secs(60),
        interval,
        chat_id: "-100123".to_string(),
        bot_token: "123:abc".to_string(),
        message_thread_id: None,
        proxy: None,
    }
}

fn drain(rx: &mut mpsc::Receiver<LogEvent>) -> Vec<LogEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn overrun_warnings(events: &[LogEvent]) -> usize {
    events
        .iter()
        .filter(|e| e.level == Severity::Warn && e.message.contains("proceeding immediately"))
        .count()
}

fn assert_near(actual: Duration, expected: Duration) {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= Duration::from_millis(5),
        "expected ~{:?}, got {:?}",
        expected,
        actual
    );
}

#[tokio::test(start_paused = true)]
async fn short_calls_keep_fixed_spacing() {
    let transport = FakeTransport::new(&[], Duration::from_secs(1));
    let (sink, mut rx) = LogSink::channel(4096);
    let (handle, signal) = cancellation();
    let run = tokio::spawn(
        SendLoop::new(loop_config(Duration::from_secs(3)), transport.clone(), sink).run(signal),
    );

    sleep(Duration::from_millis(7500)).await;
    handle.cancel();
    run.await.unwrap();

    let starts = transport.starts();
    assert_eq!(starts.len(), 3);
    for pair in starts.windows(2) {
        assert_near(pair[1] - pair[0], Duration::from_secs(3));
    }
    assert_eq!(overrun_warnings(&drain(&mut rx)), 0);
}

#[tokio::test(start_paused = true)]
async fn long_call_starts_next_cycle_immediately_with_one_warning() {
    let transport = FakeTransport::new(&[Duration::from_secs(5)], Duration::from_secs(1));
    let (sink, mut rx) = LogSink::channel(4096);
    let (handle, signal) = cancellation();
    let run = tokio::spawn(
        SendLoop::new(loop_config(Duration::from_secs(3)), transport.clone(), sink).run(signal),
    );

    // Second cycle starts at 5s, finishes at 6s and sleeps until 8s.
    sleep(Duration::from_secs(7)).await;
    handle.cancel();
    run.await.unwrap();

    let starts = transport.starts();
    assert_eq!(starts.len(), 2);
    assert_near(starts[1] - starts[0], Duration::from_secs(5));

    let events = drain(&mut rx);
    assert_eq!(overrun_warnings(&events), 1);
    assert!(events
        .iter()
        .any(|e| e.message == "cycle took 5000ms > interval 3000ms, proceeding immediately"));
}

#[tokio::test(start_paused = true)]
async fn stop_during_wait_ends_loop_without_another_cycle() {
    let transport = FakeTransport::new(&[], Duration::from_millis(500));
    let (sink, mut rx) = LogSink::channel(4096);
    let (handle, signal) = cancellation();
    let begin = Instant::now();
    let run = tokio::spawn(
        SendLoop::new(loop_config(Duration::from_secs(3)), transport.clone(), sink).run(signal),
    );

    sleep(Duration::from_secs(1)).await;
    handle.cancel();
    run.await.unwrap();

    assert_near(begin.elapsed(), Duration::from_secs(1));
    assert_eq!(transport.starts().len(), 1);

    let messages: Vec<String> = drain(&mut rx).into_iter().map(|e| e.message).collect();
    assert!(messages.contains(&"Stop signal received".to_string()));
    assert!(messages
        .iter()
        .any(|m| m == "========== SENDING STOPPED after 1 cycle(s) =========="));
}

#[tokio::test(start_paused = true)]
async fn stop_during_overrunning_call_is_seen_before_next_cycle() {
    let transport = FakeTransport::new(&[], Duration::from_secs(4));
    let (sink, mut rx) = LogSink::channel(4096);
    let (handle, signal) = cancellation();
    let run = tokio::spawn(
        SendLoop::new(loop_config(Duration::from_secs(3)), transport.clone(), sink).run(signal),
    );

    sleep(Duration::from_secs(2)).await;
    handle.cancel();
    run.await.unwrap();

    assert_eq!(transport.starts().len(), 1);
    assert_eq!(overrun_warnings(&drain(&mut rx)), 1);
}

#[tokio::test(start_paused = true)]
async fn cycle_logs_come_in_order() {
    let transport = FakeTransport::new(&[], Duration::from_millis(200));
    let (sink, mut rx) = LogSink::channel(4096);
    let (handle, signal) = cancellation();
    let run = tokio::spawn(
        SendLoop::new(loop_config(Duration::from_secs(1)), transport, sink).run(signal),
    );

    sleep(Duration::from_millis(500)).await;
    handle.cancel();
    run.await.unwrap();

    let messages: Vec<String> = drain(&mut rx).into_iter().map(|e| e.message).collect();
    let position = |needle: &str| {
        messages
            .iter()
            .position(|m| m.contains(needle))
            .unwrap_or_else(|| panic!("missing log line containing {:?}", needle))
    };
    let banner = position("SENDING STARTED");
    let cycle = position("Cycle #1 started at");
    let generated = position("Message generated (");
    let result = position("RESULT #1: SUCCESS in");
    let waiting = position("before next cycle...");
    assert!(banner < cycle && cycle < generated && generated < result && result < waiting);
}
