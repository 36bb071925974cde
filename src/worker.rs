use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::cancel::{CancelSignal, Wake};
use crate::client::{CallConfig, CallContext, MessageTransport};
use crate::clock::{as_millis, clock_time, fmt_duration, wall_now, Stopwatch};
use crate::hub::LogSink;
use crate::metrics::{
    CADENCE_OVERRUNS_TOTAL, CALL_DURATION_SECONDS, CALL_OUTCOMES_TOTAL, CYCLES_TOTAL,
};
use crate::payload;

/// Configuration for one run of the send loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Per-call deadline, measured from the start of each cycle.
    pub call_timeout: Duration,
    /// Target spacing between cycle starts.
    pub interval: Duration,
    pub chat_id: String,
    pub bot_token: String,
    pub message_thread_id: Option<String>,
    /// Redacted proxy URL for the banner.
    pub proxy: Option<String>,
}

/// Repeats one call per cycle at a fixed cadence until cancelled.
pub struct SendLoop {
    config: LoopConfig,
    transport: Arc<dyn MessageTransport>,
    sink: LogSink,
}

impl SendLoop {
    pub fn new(config: LoopConfig, transport: Arc<dyn MessageTransport>, sink: LogSink) -> Self {
        Self {
            config,
            transport,
            sink,
        }
    }

    /// Runs cycles until `cancel` fires.
    ///
    /// Each cycle is anchored to its own start: a call shorter than the
    /// interval is followed by a cancellable sleep to the next slot, a call
    /// that used up the interval is followed by a warning and the next cycle
    /// right away. Call failures are logged and never end the loop.
    pub async fn run(self, mut cancel: CancelSignal) {
        let cfg = &self.config;
        info!(
            interval = %fmt_duration(cfg.interval),
            timeout = %fmt_duration(cfg.call_timeout),
            "Send loop starting"
        );
        self.log_banner();

        let mut cycle: u64 = 0;
        loop {
            cycle += 1;
            let started = Stopwatch::start();
            CYCLES_TOTAL.inc();

            self.sink.info(format!(
                "---------- Cycle #{} started at {} ----------",
                cycle,
                clock_time(&wall_now())
            ));

            let deadline = started.started_at() + cfg.call_timeout;
            self.sink.info(format!(
                "Call deadline set: {} from cycle start",
                fmt_duration(cfg.call_timeout)
            ));

            let text = payload::random_message();
            self.sink
                .info(format!("Message generated ({} bytes)", text.len()));

            let call = CallConfig {
                chat_id: cfg.chat_id.clone(),
                bot_token: cfg.bot_token.clone(),
                message_thread_id: cfg.message_thread_id.clone(),
                text,
                timeout: cfg.call_timeout,
            };
            let ctx = CallContext::with_deadline(deadline, cfg.call_timeout, cancel.clone());
            let result = self.transport.send(&call, ctx).await;

            let elapsed = started.elapsed();
            CALL_DURATION_SECONDS.observe(elapsed.as_secs_f64());
            match result {
                Ok(()) => {
                    CALL_OUTCOMES_TOTAL.with_label_values(&["success"]).inc();
                    self.sink.info(format!(
                        "RESULT #{}: SUCCESS in {}",
                        cycle,
                        fmt_duration(elapsed)
                    ));
                }
                Err(e) => {
                    CALL_OUTCOMES_TOTAL
                        .with_label_values(&[e.kind().label()])
                        .inc();
                    self.sink.error(format!(
                        "RESULT #{}: FAILURE in {}",
                        cycle,
                        fmt_duration(elapsed)
                    ));
                    self.sink.error(format!("Error details: {}", e));
                    if cancel.is_cancelled() {
                        self.sink.error("Parent context: canceled (stop requested)");
                    }
                }
            }

            if elapsed < cfg.interval {
                let next = started.started_at() + cfg.interval;
                self.sink.info(format!(
                    "Waiting {} before next cycle...",
                    fmt_duration(next.saturating_duration_since(Instant::now()))
                ));
                if cancel.sleep_until_or_cancel(next).await == Wake::Cancelled {
                    break;
                }
            } else {
                CADENCE_OVERRUNS_TOTAL.inc();
                self.sink.warn(format!(
                    "cycle took {}ms > interval {}ms, proceeding immediately",
                    as_millis(elapsed),
                    as_millis(cfg.interval)
                ));
                if cancel.is_cancelled() {
                    break;
                }
            }
        }

        self.sink.info("Stop signal received");
        self.log_summary(cycle);
        debug!(cycles = cycle, "Send loop finished");
    }

    fn log_banner(&self) {
        let cfg = &self.config;
        self.sink.info("========== SENDING STARTED ==========");
        self.sink.info(format!(
            "Configuration: timeout={}, interval={}",
            fmt_duration(cfg.call_timeout),
            fmt_duration(cfg.interval)
        ));
        self.sink.info(format!("Chat ID: {}", cfg.chat_id));
        if let Some(thread) = cfg.message_thread_id.as_deref().filter(|t| !t.is_empty()) {
            self.sink.info(format!("Message thread ID: {}", thread));
        }
        self.sink.info(format!(
            "Proxy: {}",
            cfg.proxy.as_deref().unwrap_or("not used")
        ));
    }

    fn log_summary(&self, cycles: u64) {
        self.sink.info(format!(
            "========== SENDING STOPPED after {} cycle(s) ==========",
            cycles
        ));
        if let Some(stats) = self.transport.connection_stats() {
            self.sink
                .info(format!("Connection reuse: {}", stats.format()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use crate::errors::CallError;
    use crate::hub::{LogEvent, Severity};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct Scripted {
        delay: Duration,
        fail: bool,
        calls: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl MessageTransport for Scripted {
        async fn send(&self, _call: &CallConfig, _ctx: CallContext) -> Result<(), CallError> {
            self.calls.lock().unwrap().push(Instant::now());
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(CallError::RemoteRejected {
                    status: 500,
                    body: "boom".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn config(interval: Duration) -> LoopConfig {
        LoopConfig {
            call_timeout: Duration::from_secs(60),
            interval,
            chat_id: "42".to_string(),
            bot_token: "1:x".to_string(),
            message_thread_id: None,
            proxy: None,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<LogEvent>) -> Vec<LogEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let transport = Arc::new(Scripted {
            delay: Duration::from_millis(100),
            fail: true,
            calls: Mutex::new(Vec::new()),
        });
        let (sink, mut rx) = LogSink::channel(1024);
        let (handle, signal) = cancellation();
        let run = tokio::spawn(
            SendLoop::new(config(Duration::from_secs(1)), transport.clone(), sink).run(signal),
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        handle.cancel();
        run.await.unwrap();

        assert_eq!(transport.calls.lock().unwrap().len(), 4);
        let events = drain(&mut rx);
        let failures = events
            .iter()
            .filter(|e| e.level == Severity::Error && e.message.contains("FAILURE"))
            .count();
        assert_eq!(failures, 4);
        assert!(events
            .iter()
            .any(|e| e.message.contains("SENDING STOPPED after 4 cycle(s)")));
    }

    #[tokio::test(start_paused = true)]
    async fn banner_mentions_proxy_state() {
        let transport = Arc::new(Scripted {
            delay: Duration::ZERO,
            fail: false,
            calls: Mutex::new(Vec::new()),
        });
        let (sink, mut rx) = LogSink::channel(256);
        let (handle, signal) = cancellation();
        let mut cfg = config(Duration::from_secs(1));
        cfg.proxy = Some("socks5://127.0.0.1:1080".to_string());
        handle.cancel();
        SendLoop::new(cfg, transport, sink).run(signal).await;

        let messages: Vec<String> = drain(&mut rx).into_iter().map(|e| e.message).collect();
        assert!(messages.contains(&"Proxy: socks5://127.0.0.1:1080".to_string()));
        assert!(messages.contains(&"Chat ID: 42".to_string()));
    }
}
