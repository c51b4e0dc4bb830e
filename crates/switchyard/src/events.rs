//! Lifecycle events raised to the hosting application.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use switch_transport::{PortStatus, StreamErrorReport};
use tracing::{debug, error};

use crate::session::SwitchSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ControllerEnter,
    ControllerLeave,
    SessionStart,
    SessionStop,
    ChannelUp,
    ChannelDown,
    ChannelReady,
    BecomePrimary,
    BecomeBackup,
    PortUp,
    PortDown,
    StreamError,
}

#[derive(Clone)]
pub enum SwitchEvent {
    ControllerEnter { session: SwitchSession },
    ControllerLeave { session: SwitchSession },
    SessionStart { session: SwitchSession },
    SessionStop { session: SwitchSession },
    ChannelUp { session: SwitchSession },
    ChannelDown { session: SwitchSession },
    ChannelReady { session: SwitchSession },
    BecomePrimary { session: SwitchSession },
    BecomeBackup { session: SwitchSession },
    PortUp { session: SwitchSession, port: PortStatus },
    PortDown { session: SwitchSession, port: PortStatus },
    StreamError { session: SwitchSession, report: StreamErrorReport },
}

impl SwitchEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SwitchEvent::ControllerEnter { .. } => EventKind::ControllerEnter,
            SwitchEvent::ControllerLeave { .. } => EventKind::ControllerLeave,
            SwitchEvent::SessionStart { .. } => EventKind::SessionStart,
            SwitchEvent::SessionStop { .. } => EventKind::SessionStop,
            SwitchEvent::ChannelUp { .. } => EventKind::ChannelUp,
            SwitchEvent::ChannelDown { .. } => EventKind::ChannelDown,
            SwitchEvent::ChannelReady { .. } => EventKind::ChannelReady,
            SwitchEvent::BecomePrimary { .. } => EventKind::BecomePrimary,
            SwitchEvent::BecomeBackup { .. } => EventKind::BecomeBackup,
            SwitchEvent::PortUp { .. } => EventKind::PortUp,
            SwitchEvent::PortDown { .. } => EventKind::PortDown,
            SwitchEvent::StreamError { .. } => EventKind::StreamError,
        }
    }

    pub fn session(&self) -> &SwitchSession {
        match self {
            SwitchEvent::ControllerEnter { session }
            | SwitchEvent::ControllerLeave { session }
            | SwitchEvent::SessionStart { session }
            | SwitchEvent::SessionStop { session }
            | SwitchEvent::ChannelUp { session }
            | SwitchEvent::ChannelDown { session }
            | SwitchEvent::ChannelReady { session }
            | SwitchEvent::BecomePrimary { session }
            | SwitchEvent::BecomeBackup { session }
            | SwitchEvent::PortUp { session, .. }
            | SwitchEvent::PortDown { session, .. }
            | SwitchEvent::StreamError { session, .. } => session,
        }
    }
}

impl fmt::Debug for SwitchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("SwitchEvent");
        out.field("kind", &self.kind())
            .field("session", &self.session().name());
        match self {
            SwitchEvent::PortUp { port, .. } | SwitchEvent::PortDown { port, .. } => {
                out.field("port", port);
            }
            SwitchEvent::StreamError { report, .. } => {
                out.field("report", report);
            }
            _ => {}
        }
        out.finish()
    }
}

pub type Listener = Arc<dyn Fn(&SwitchEvent) + Send + Sync>;
pub type SpawningListener =
    Arc<dyn Fn(SwitchEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
enum Registered {
    Inline(Listener),
    Spawn(SpawningListener),
}

/// Typed listener registry. Listeners for one kind run in registration order.
#[derive(Default)]
pub struct EventRegistry {
    listeners: RwLock<HashMap<EventKind, Vec<Registered>>>,
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        f.debug_map()
            .entries(listeners.iter().map(|(kind, list)| (kind, list.len())))
            .finish()
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `listener` synchronously inside `emit`.
    pub fn on(&self, kind: EventKind, listener: impl Fn(&SwitchEvent) + Send + Sync + 'static) {
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Registered::Inline(Arc::new(listener)));
    }

    /// Spawn a new task running `listener` for every matching event.
    pub fn on_spawn<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(SwitchEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Registered::Spawn(Arc::new(listener)));
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn emit(&self, event: SwitchEvent) {
        let kind = event.kind();
        let listeners = match self.listeners.read().get(&kind) {
            Some(list) => list.clone(),
            None => return,
        };
        debug!(
            target: "switchyard::session",
            session = %event.session().name(),
            ?kind,
            listeners = listeners.len(),
            "emitting event"
        );
        for listener in listeners {
            match listener {
                Registered::Inline(listener) => listener(&event),
                Registered::Spawn(listener) => {
                    let job = crate::controller::inherit_current(listener(event.clone()));
                    tokio::spawn(async move {
                        if let Err(err) = job.await {
                            error!(target: "switchyard::session", ?kind, error = ?err, "event listener failed");
                        }
                    });
                }
            }
        }
    }
}
