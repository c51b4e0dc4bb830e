//! Per-switch session: reconnect loop, election, pipeline sync and dispatch.
//!
//! A [`SwitchSession`] is a cheap handle; clones share the same session. Its
//! [`run`](SwitchSession::run) loop owns the connection, and every helper on
//! the handle works against whichever connection is current.

mod dispatch;
mod run;
mod state;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use switch_transport::{
    Connector, DeviceId, DigestList, ElectionId, IdleTimeoutNotification, PacketIn, PacketOut,
    PortStatus, ReadRequest, StreamRequest, Update, UpdateKind, UnaryRequest, UnaryResponse,
    WriteRequest,
};
use tokio::sync::watch;
use tracing::debug;

use crate::arbitrator::ElectionSnapshot;
use crate::client::ClientSession;
use crate::codec::EntityCodec;
use crate::config::{SessionConfig, SessionSettings};
use crate::events::{EventRegistry, SwitchEvent};
use crate::pipeline::{unexpected_reply, MapSchema, SchemaProvider};
use crate::queues::{Consumer, ConsumerQueues, PacketFilter, QueueError};
use crate::supervisor::TaskHandle;

pub use state::{SessionError, SessionPhase};
use state::SessionState;

#[derive(Clone)]
pub struct SwitchSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    name: String,
    address: String,
    config: Arc<SessionConfig>,
    settings: SessionSettings,
    connector: Arc<dyn Connector>,
    events: Arc<EventRegistry>,
    queues: ConsumerQueues,
    election: Arc<watch::Sender<ElectionSnapshot>>,
    phase: watch::Sender<SessionPhase>,
    state: RwLock<SessionState>,
}

impl fmt::Debug for SwitchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchSession")
            .field("name", &self.inner.name)
            .field("address", &self.inner.address)
            .field("device_id", &self.device_id())
            .field("phase", &self.phase())
            .field("is_primary", &self.is_primary())
            .finish()
    }
}

pub struct SwitchSessionBuilder {
    name: String,
    address: String,
    config: Arc<SessionConfig>,
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    events: Option<Arc<EventRegistry>>,
}

impl SwitchSessionBuilder {
    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Share a listener registry, typically the controller's.
    pub fn events(mut self, events: Arc<EventRegistry>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> SwitchSession {
        let (election, _) = watch::channel(ElectionSnapshot {
            election_id: self.config.initial_election_id(),
            primary_id: 0,
            is_primary: false,
            role_name: self.config.role_name().map(str::to_string),
        });
        let (phase, _) = watch::channel(SessionPhase::Idle);
        SwitchSession {
            inner: Arc::new(SessionInner {
                name: self.name,
                address: self.address,
                queues: ConsumerQueues::new(self.settings.queue_capacity),
                config: self.config,
                settings: self.settings,
                connector: self.connector,
                events: self.events.unwrap_or_default(),
                election: Arc::new(election),
                phase,
                state: RwLock::new(SessionState::default()),
            }),
        }
    }
}

impl SwitchSession {
    pub fn builder(
        name: impl Into<String>,
        address: impl Into<String>,
        config: impl Into<Arc<SessionConfig>>,
        connector: Arc<dyn Connector>,
    ) -> SwitchSessionBuilder {
        SwitchSessionBuilder {
            name: name.into(),
            address: address.into(),
            config: config.into(),
            connector,
            settings: SessionSettings::default(),
            events: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.config.device_id()
    }

    pub fn config(&self) -> &Arc<SessionConfig> {
        &self.inner.config
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.inner.events
    }

    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.borrow()
    }

    /// Follow phase changes.
    pub fn phases(&self) -> watch::Receiver<SessionPhase> {
        self.inner.phase.subscribe()
    }

    /// Follow election changes (role transitions included).
    pub fn election(&self) -> watch::Receiver<ElectionSnapshot> {
        self.inner.election.subscribe()
    }

    pub fn is_primary(&self) -> bool {
        self.inner.election.borrow().is_primary
    }

    pub fn election_id(&self) -> ElectionId {
        self.inner.election.borrow().election_id
    }

    pub fn primary_id(&self) -> ElectionId {
        self.inner.election.borrow().primary_id
    }

    pub fn role_name(&self) -> Option<String> {
        self.inner.election.borrow().role_name.clone()
    }

    pub fn is_channel_up(&self) -> bool {
        self.inner.state.read().is_channel_up()
    }

    /// Protocol version reported by the switch on the current connection.
    pub fn api_version(&self) -> Option<String> {
        self.inner.state.read().api_version.clone()
    }

    pub fn ports(&self) -> Vec<PortStatus> {
        self.inner.state.read().ports.clone()
    }

    fn schema(&self) -> Arc<dyn SchemaProvider> {
        self.inner
            .config
            .schema()
            .cloned()
            .unwrap_or_else(|| Arc::new(MapSchema::default()))
    }

    fn channel(&self) -> Result<Arc<ClientSession>, SessionError> {
        self.inner
            .state
            .read()
            .channel
            .clone()
            .filter(|channel| !channel.is_closed())
            .ok_or_else(|| SessionError::NotConnected(self.inner.name.clone()))
    }

    pub(crate) fn emit(&self, event: SwitchEvent) {
        self.inner.events.emit(event);
    }

    /// Run `job` under the current connection's supervisor. Foreground jobs are
    /// cancelled on role transitions; every job is cancelled on disconnect.
    pub fn create_task<F>(
        &self,
        name: impl Into<String>,
        background: bool,
        job: F,
    ) -> Result<TaskHandle, SessionError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let supervisor = self
            .inner
            .state
            .read()
            .supervisor
            .clone()
            .ok_or_else(|| SessionError::NotConnected(self.inner.name.clone()))?;
        Ok(supervisor.spawn(name, background, job))
    }

    pub async fn packet_out(&self, packet: PacketOut) -> Result<(), SessionError> {
        let channel = self.channel()?;
        channel.send(StreamRequest::Packet(packet)).await?;
        Ok(())
    }

    pub async fn ack_digest(&self, digest: &DigestList) -> Result<(), SessionError> {
        let channel = self.channel()?;
        channel.send(StreamRequest::DigestAck(digest.ack())).await?;
        Ok(())
    }

    /// Send a batch of updates. With `strict == false`, a failure made only of
    /// NOT_FOUND errors (deleting what is already gone) is treated as success.
    pub async fn write(&self, updates: Vec<Update>, strict: bool) -> Result<(), SessionError> {
        if updates.is_empty() {
            return Ok(());
        }
        let channel = self.channel()?;
        let mut request = UnaryRequest::Write(WriteRequest {
            device_id: self.device_id(),
            role: None,
            election_id: None,
            updates,
            atomicity: Default::default(),
        });
        self.inner.election.borrow().complete_request(&mut request);
        match channel.request(request).await {
            Ok(UnaryResponse::Write) => Ok(()),
            Ok(other) => Err(unexpected_reply("Write", &other).into()),
            Err(err) if !strict && err.is_not_found_only() => {
                debug!(
                    target: "switchyard::session",
                    session = %self.inner.name,
                    error = %err,
                    "ignoring not-found write errors"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write_entities<C: EntityCodec>(
        &self,
        codec: &C,
        kind: UpdateKind,
        entities: &[C::Entity],
        strict: bool,
    ) -> Result<(), SessionError> {
        let schema = self.schema();
        let updates = entities
            .iter()
            .map(|entity| {
                codec.encode(schema.as_ref(), entity).map(|entity| Update { kind, entity })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.write(updates, strict).await
    }

    pub async fn insert<C: EntityCodec>(
        &self,
        codec: &C,
        entities: &[C::Entity],
    ) -> Result<(), SessionError> {
        self.write_entities(codec, UpdateKind::Insert, entities, true).await
    }

    pub async fn modify<C: EntityCodec>(
        &self,
        codec: &C,
        entities: &[C::Entity],
    ) -> Result<(), SessionError> {
        self.write_entities(codec, UpdateKind::Modify, entities, true).await
    }

    pub async fn delete<C: EntityCodec>(
        &self,
        codec: &C,
        entities: &[C::Entity],
        strict: bool,
    ) -> Result<(), SessionError> {
        self.write_entities(codec, UpdateKind::Delete, entities, strict).await
    }

    /// Read every entity matching `query`, decoded through `codec`.
    pub async fn read<C: EntityCodec>(
        &self,
        codec: &C,
        query: &[C::Entity],
    ) -> Result<Vec<C::Entity>, SessionError> {
        let channel = self.channel()?;
        let schema = self.schema();
        let entities = query
            .iter()
            .map(|entity| codec.encode(schema.as_ref(), entity))
            .collect::<Result<Vec<_>, _>>()?;
        let mut request = ReadRequest {
            device_id: self.device_id(),
            role: None,
            entities,
        };
        self.inner.election.borrow().complete_read(&mut request);

        let mut replies = channel.request_stream(request).await?;
        let mut decoded = Vec::new();
        while let Some(reply) = replies.next().await {
            for wire in reply?.entities {
                decoded.push(codec.decode(&wire, schema.as_ref())?);
            }
        }
        Ok(decoded)
    }

    /// Subscribe to inbound packets accepted by `filter`. Survives reconnects.
    pub fn read_packets(
        &self,
        filter: impl Fn(&PacketIn) -> bool + Send + Sync + 'static,
    ) -> Consumer<PacketIn> {
        let filter: PacketFilter = Arc::new(filter);
        self.inner.queues.subscribe_packets(filter)
    }

    pub fn read_digests(&self, digest_id: u32) -> Result<Consumer<DigestList>, QueueError> {
        self.inner.queues.subscribe_digests(digest_id)
    }

    pub fn read_idle_timeouts(&self) -> Result<Consumer<IdleTimeoutNotification>, QueueError> {
        self.inner.queues.subscribe_idle_timeouts()
    }
}
