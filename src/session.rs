//! Control surface: the active configuration and the (at most one) running
//! send loop, behind one lock.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use crate::cancel::{cancellation, CancelHandle};
use crate::client::{MessageTransport, TracingClient};
use crate::config::ProbeConfig;
use crate::errors::ControlError;
use crate::hub::LogSink;
use crate::worker::SendLoop;

/// Builds the transport a run will use.
pub type TransportFactory = Arc<
    dyn Fn(&ProbeConfig, LogSink) -> Result<Arc<dyn MessageTransport>, ControlError>
        + Send
        + Sync,
>;

/// Factory producing a [`TracingClient`] for the configuration.
pub fn tracing_client_factory() -> TransportFactory {
    Arc::new(
        |config: &ProbeConfig, sink: LogSink| -> Result<Arc<dyn MessageTransport>, ControlError> {
            let client = TracingClient::new(config.client_config()?, sink)?;
            Ok(Arc::new(client))
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub running: bool,
}

struct ActiveRun {
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

struct SessionState {
    config: Arc<ProbeConfig>,
    run: Option<ActiveRun>,
}

pub struct Session {
    state: RwLock<SessionState>,
    sink: LogSink,
    factory: TransportFactory,
}

impl Session {
    pub fn new(config: ProbeConfig, sink: LogSink) -> Self {
        Self::with_transport_factory(config, sink, tracing_client_factory())
    }

    pub fn with_transport_factory(
        config: ProbeConfig,
        sink: LogSink,
        factory: TransportFactory,
    ) -> Self {
        Self {
            state: RwLock::new(SessionState {
                config: Arc::new(config),
                run: None,
            }),
            sink,
            factory,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> Arc<ProbeConfig> {
        self.read().config.clone()
    }

    /// Replaces the configuration wholesale after validating it. A running
    /// loop keeps the configuration it was started with.
    pub fn update_config(&self, config: ProbeConfig) -> Result<(), ControlError> {
        config.validate()?;
        self.write().config = Arc::new(config);
        self.sink.info("Configuration updated");
        info!("Configuration updated");
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            running: self.read().run.is_some(),
        }
    }

    /// Starts a send loop, optionally applying `config` first. The
    /// configuration is only committed once the transport for it is built.
    pub fn start(&self, config: Option<ProbeConfig>) -> Result<(), ControlError> {
        let supplied = config.is_some();
        let candidate = {
            let state = self.read();
            if state.run.is_some() {
                return Err(ControlError::AlreadyRunning);
            }
            match config {
                Some(config) => Arc::new(config),
                None => state.config.clone(),
            }
        };
        candidate.validate()?;

        // Certificate loading may block; keep it outside the lock.
        let transport = (self.factory)(&candidate, self.sink.clone())?;

        let mut state = self.write();
        if state.run.is_some() {
            return Err(ControlError::AlreadyRunning);
        }
        if supplied {
            state.config = candidate.clone();
            self.sink.info("Configuration updated");
        }

        let (cancel, signal) = cancellation();
        let send_loop = SendLoop::new(candidate.loop_config(), transport, self.sink.clone());
        let task = tokio::spawn(send_loop.run(signal));
        state.run = Some(ActiveRun { cancel, task });

        self.sink.info("Sending started");
        info!(chat_id = %candidate.chat_id, "Sending started");
        Ok(())
    }

    /// Cancels the running loop. The returned handle completes once the
    /// loop has wound down.
    pub fn stop(&self) -> Result<JoinHandle<()>, ControlError> {
        let run = self.write().run.take().ok_or(ControlError::NotRunning)?;
        run.cancel.cancel();
        self.sink.info("Sending stopped");
        info!("Sending stopped");
        Ok(run.task)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = state.run.take() {
            run.cancel.cancel();
        }
    }
}
