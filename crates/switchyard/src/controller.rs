//! Multi-switch orchestration.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use switch_transport::Connector;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{ControllerSettings, SessionConfig};
use crate::countdown::Countdown;
use crate::election::ElectionIdGenerator;
use crate::events::{EventRegistry, SwitchEvent};
use crate::session::{SessionError, SwitchSession};
use crate::supervisor::panic_message;

/// Process exit status used when fail-fast escalation terminates the process.
pub const FAIL_FAST_EXIT_CODE: i32 = 99;

tokio::task_local! {
    static CURRENT: Controller;
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("session '{name}' failed: {source}")]
    FailFast {
        name: String,
        #[source]
        source: SessionError,
    },
    #[error("session '{name}' panicked: {message}")]
    Panicked { name: String, message: String },
    #[error("session '{0}' is already registered")]
    Duplicate(String),
    #[error("controller is already running")]
    AlreadyRunning,
}

impl ControllerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ControllerError::FailFast { .. } | ControllerError::Panicked { .. } => {
                FAIL_FAST_EXIT_CODE
            }
            _ => 1,
        }
    }

    /// Log and terminate the process.
    pub fn exit(&self) -> ! {
        error!(target: "switchyard::controller", error = %self, code = self.exit_code(), "terminating");
        std::process::exit(self.exit_code())
    }
}

/// Carry the calling task's controller into a future that will be spawned
/// elsewhere.
pub(crate) fn inherit_current<F>(job: F) -> BoxFuture<'static, F::Output>
where
    F: Future + Send + 'static,
{
    match Controller::current() {
        Some(controller) => CURRENT.scope(controller, job).boxed(),
        None => job.boxed(),
    }
}

/// Completion signal for a removed session.
#[derive(Debug, Clone)]
pub struct Removal {
    done: watch::Receiver<bool>,
}

impl Removal {
    fn completed() -> Self {
        let (_, done) = watch::channel(true);
        Self { done }
    }

    pub fn is_complete(&self) -> bool {
        *self.done.borrow() || self.done.has_changed().is_err()
    }

    /// Resolve once the session's run task has fully exited.
    pub async fn wait(mut self) {
        let _ = self.done.wait_for(|done| *done).await;
    }
}

struct Running {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

struct Entry {
    session: SwitchSession,
    running: Option<Running>,
}

#[derive(Default)]
struct Registry {
    sessions: BTreeMap<String, Entry>,
    pending: HashMap<String, watch::Receiver<bool>>,
}

struct RunState {
    stop: CancellationToken,
    countdown: Countdown,
    fatal: mpsc::UnboundedSender<ControllerError>,
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    settings: ControllerSettings,
    events: Arc<EventRegistry>,
    election_ids: ElectionIdGenerator,
    registry: Mutex<Registry>,
    run: Mutex<Option<RunState>>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("sessions", &self.names())
            .field("pending", &self.inner.registry.lock().pending.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new(ControllerSettings::default())
    }
}

impl Controller {
    pub fn new(settings: ControllerSettings) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                settings,
                events: Arc::new(EventRegistry::new()),
                election_ids: ElectionIdGenerator::new(),
                registry: Mutex::new(Registry::default()),
                run: Mutex::new(None),
            }),
        }
    }

    /// The controller whose task is calling. Session jobs and spawning event
    /// listeners inherit it; tasks started with plain `tokio::spawn` do not.
    pub fn current() -> Option<Controller> {
        CURRENT.try_with(Controller::clone).ok()
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.inner.settings
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.inner.events
    }

    pub fn election_ids(&self) -> &ElectionIdGenerator {
        &self.inner.election_ids
    }

    /// Build a session wired to this controller's settings and listeners.
    pub fn new_session(
        &self,
        name: impl Into<String>,
        address: impl Into<String>,
        config: impl Into<Arc<SessionConfig>>,
        connector: Arc<dyn Connector>,
    ) -> SwitchSession {
        SwitchSession::builder(name, address, config, connector)
            .settings(self.inner.settings.session)
            .events(self.inner.events.clone())
            .build()
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.lock().is_some()
    }

    /// Registered sessions plus removed ones still shutting down.
    pub fn len(&self) -> usize {
        let registry = self.inner.registry.lock();
        registry.sessions.len() + registry.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.registry.lock().sessions.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<SwitchSession> {
        self.inner
            .registry
            .lock()
            .sessions
            .get(name)
            .map(|entry| entry.session.clone())
    }

    pub fn sessions(&self) -> Vec<SwitchSession> {
        self.inner
            .registry
            .lock()
            .sessions
            .values()
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Register a session; it starts right away if the controller is running.
    pub fn add(&self, session: SwitchSession) -> Result<(), ControllerError> {
        let name = session.name().to_string();
        let run = self.inner.run.lock();
        let mut registry = self.inner.registry.lock();
        if registry.sessions.contains_key(&name) || registry.pending.contains_key(&name) {
            return Err(ControllerError::Duplicate(name));
        }
        let running = run.as_ref().map(|run| self.spawn_session(run, &session));
        registry.sessions.insert(name, Entry { session, running });
        Ok(())
    }

    /// Unregister a session. While running, the returned signal is set only
    /// once the session's task has exited; `None` for an unknown name.
    pub fn remove(&self, name: &str) -> Option<Removal> {
        let mut registry = self.inner.registry.lock();
        let entry = registry.sessions.remove(name)?;
        match entry.running {
            Some(running) => {
                info!(target: "switchyard::controller", session = %name, "removing running session");
                running.token.cancel();
                if *running.done.borrow() {
                    return Some(Removal::completed());
                }
                registry
                    .pending
                    .insert(name.to_string(), running.done.clone());
                Some(Removal { done: running.done })
            }
            None => Some(Removal::completed()),
        }
    }

    /// Run every registered session until [`stop`](Self::stop) is called or a
    /// session fails under fail-fast or panics. A failure cancels the other
    /// sessions and is returned once all of them have exited.
    pub async fn run(&self) -> Result<(), ControllerError> {
        let stop = CancellationToken::new();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let countdown = Countdown::with_cancel_hook({
            let stop = stop.clone();
            move || stop.cancel()
        });
        {
            let mut run = self.inner.run.lock();
            if run.is_some() {
                return Err(ControllerError::AlreadyRunning);
            }
            let state = RunState {
                stop: stop.clone(),
                countdown: countdown.clone(),
                fatal: fatal_tx,
            };
            let mut registry = self.inner.registry.lock();
            for entry in registry.sessions.values_mut() {
                entry.running = Some(self.spawn_session(&state, &entry.session));
            }
            *run = Some(state);
        }
        info!(target: "switchyard::controller", sessions = self.len(), "controller running");

        let fatal = tokio::select! {
            fatal = fatal_rx.recv() => fatal,
            _ = stop.cancelled() => None,
        };
        if fatal.is_some() {
            stop.cancel();
        }

        countdown.wait_or_cancel(&stop).await;
        *self.inner.run.lock() = None;
        {
            let mut registry = self.inner.registry.lock();
            registry.pending.clear();
            for entry in registry.sessions.values_mut() {
                entry.running = None;
            }
        }
        info!(target: "switchyard::controller", "controller stopped");

        match fatal.or_else(|| fatal_rx.try_recv().ok()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Install the global tracing subscriber with the configured filter.
    pub fn init_logging(&self) {
        crate::logging::init_tracing(&self.inner.settings.log_filter);
    }

    /// Process entry point: install logging, then [`run`](Self::run). A
    /// fail-fast failure ends the process with [`FAIL_FAST_EXIT_CODE`].
    pub async fn run_or_exit(&self) {
        self.init_logging();
        if let Err(err) = self.run().await {
            err.exit();
        }
    }

    /// Ask a running controller to cancel all sessions; `run` returns once
    /// every session has exited.
    pub fn stop(&self) {
        if let Some(run) = self.inner.run.lock().as_ref() {
            info!(target: "switchyard::controller", "stop requested");
            run.stop.cancel();
        }
    }

    fn spawn_session(&self, run: &RunState, session: &SwitchSession) -> Running {
        let token = run.stop.child_token();
        let (done_tx, done) = watch::channel(false);
        let guard = run.countdown.enter();
        let fatal = run.fatal.clone();
        let controller = self.clone();
        let session = session.clone();
        let session_token = token.clone();

        tokio::spawn(CURRENT.scope(self.clone(), async move {
            let name = session.name().to_string();
            let outcome = AssertUnwindSafe(async {
                session.emit(SwitchEvent::ControllerEnter {
                    session: session.clone(),
                });
                if let Err(err) = session.run(session_token).await {
                    error!(target: "switchyard::controller", session = %name, error = %err, "session failed");
                    if err.is_fatal() {
                        let _ = fatal.send(ControllerError::FailFast {
                            name: name.clone(),
                            source: err,
                        });
                    }
                }
                session.emit(SwitchEvent::ControllerLeave {
                    session: session.clone(),
                });
            })
            .catch_unwind()
            .await;
            if let Err(panic) = outcome {
                let message = panic_message(panic.as_ref());
                error!(target: "switchyard::controller", session = %name, %message, "session panicked");
                let _ = fatal.send(ControllerError::Panicked {
                    name: name.clone(),
                    message,
                });
            }

            let mut registry = controller.inner.registry.lock();
            registry.pending.remove(&name);
            let _ = done_tx.send(true);
            drop(registry);
            drop(guard);
        }));

        Running { token, done }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use switch_transport::loopback::loopback;

    #[tokio::test]
    async fn removing_an_exited_session_leaves_nothing_pending() {
        let controller = Controller::default();
        controller
            .events()
            .on(EventKind::ControllerEnter, |_: &SwitchEvent| panic!("enter listener broke"));
        let (connector, _switch) = loopback();
        let session = controller.new_session(
            "tor9",
            "tor9:9559",
            SessionConfig::builder().build(),
            Arc::new(connector),
        );

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let state = RunState {
            stop: CancellationToken::new(),
            countdown: Countdown::new(),
            fatal: fatal_tx,
        };
        let running = controller.spawn_session(&state, &session);
        controller.inner.registry.lock().sessions.insert(
            "tor9".to_string(),
            Entry {
                session,
                running: Some(running),
            },
        );

        match fatal_rx.recv().await {
            Some(ControllerError::Panicked { name, message }) => {
                assert_eq!(name, "tor9");
                assert!(message.contains("enter listener broke"));
            }
            other => panic!("unexpected escalation: {other:?}"),
        }
        state.countdown.wait().await;

        let removal = controller.remove("tor9").expect("registered");
        assert!(removal.is_complete());
        assert!(controller.is_empty());
        assert!(controller.inner.registry.lock().pending.is_empty());
    }
}
