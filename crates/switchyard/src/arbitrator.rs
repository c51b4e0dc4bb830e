//! Primary/backup election for one switch connection.
//!
//! Several controller processes may bid for the same switch (and role) at
//! once, with only status codes as feedback. The arbitrator owns the
//! election state; it is driven exclusively from its session's control flow
//! and publishes a read-only [`ElectionSnapshot`] for everybody else.

use std::sync::Arc;

use async_trait::async_trait;
use switch_transport::{
    ArbitrationRequest, ArbitrationResponse, Code, DeviceId, ElectionId, ReadRequest, Role,
    StreamRequest, StreamResponse, UnaryRequest,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ClientSession};

/// Bound on re-bids after "election id already in use" and after NOT_FOUND.
pub const MAX_ELECTION_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum ArbitrationError {
    #[error("election id still in use after {attempts} attempts")]
    ElectionIdExhausted { attempts: u32 },
    #[error("no primary elected after {attempts} re-bids")]
    NoPrimary { attempts: u32 },
    #[error("election invariant violated: {0}")]
    InvariantViolated(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Stream operations the election protocol needs.
#[async_trait]
pub trait ArbitrationChannel: Send + Sync {
    async fn send(&self, request: StreamRequest) -> Result<(), ClientError>;
    async fn receive(&self) -> Result<StreamResponse, ClientError>;
}

#[async_trait]
impl ArbitrationChannel for ClientSession {
    async fn send(&self, request: StreamRequest) -> Result<(), ClientError> {
        ClientSession::send(self, request).await
    }

    async fn receive(&self) -> Result<StreamResponse, ClientError> {
        ClientSession::receive(self).await
    }
}

/// Switch-specific arbitration behaviors outside the protocol's formal contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbitrationQuirks {
    /// Some switches report a *lower* primary id to invite one particular
    /// backup to take over. When set, such an update is handled like NOT_FOUND.
    pub primary_id_decrease_invites_takeover: bool,
}

impl Default for ArbitrationQuirks {
    fn default() -> Self {
        Self {
            primary_id_decrease_invites_takeover: true,
        }
    }
}

/// Election state. Invariant: a primary's bid equals the primary id; a
/// backup's bid is strictly lower, except for a backup-only participant
/// (bid 0) while no primary exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElectionState {
    pub election_id: ElectionId,
    pub primary_id: ElectionId,
    pub is_primary: bool,
}

impl ElectionState {
    pub fn check(&self) -> Result<(), String> {
        if self.is_primary {
            if self.election_id != self.primary_id {
                return Err(format!(
                    "primary with election_id {} != primary_id {}",
                    self.election_id, self.primary_id
                ));
            }
        } else if !(self.election_id < self.primary_id
            || (self.election_id == 0 && self.primary_id == 0))
        {
            return Err(format!(
                "backup with election_id {} >= primary_id {}",
                self.election_id, self.primary_id
            ));
        }
        Ok(())
    }
}

/// Read-only view of the election, published after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElectionSnapshot {
    pub election_id: ElectionId,
    pub primary_id: ElectionId,
    pub is_primary: bool,
    pub role_name: Option<String>,
}

impl ElectionSnapshot {
    /// Stamp an outgoing request with our role and election id.
    pub fn complete_request(&self, request: &mut UnaryRequest) {
        match request {
            UnaryRequest::Write(write) => {
                write.role = self.role_name.clone();
                write.election_id = Some(self.election_id);
            }
            UnaryRequest::SetPipelineConfig(set) => {
                set.role = self.role_name.clone();
                set.election_id = Some(self.election_id);
            }
            UnaryRequest::GetPipelineConfig(_) | UnaryRequest::Capabilities => {}
        }
    }

    pub fn complete_read(&self, request: &mut ReadRequest) {
        request.role = self.role_name.clone();
    }
}

/// Outcome of an asynchronous arbitration update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleTransition {
    Unchanged,
    BecamePrimary,
    BecameBackup,
}

pub struct Arbitrator {
    device_id: DeviceId,
    initial_election_id: ElectionId,
    role: Option<Role>,
    quirks: ArbitrationQuirks,
    state: ElectionState,
    published: Arc<watch::Sender<ElectionSnapshot>>,
}

impl Arbitrator {
    pub fn new(
        device_id: DeviceId,
        initial_election_id: ElectionId,
        role: Option<Role>,
        quirks: ArbitrationQuirks,
        published: Arc<watch::Sender<ElectionSnapshot>>,
    ) -> Self {
        let arbitrator = Self {
            device_id,
            initial_election_id,
            role,
            quirks,
            state: ElectionState {
                election_id: initial_election_id,
                primary_id: 0,
                is_primary: false,
            },
            published,
        };
        arbitrator.publish();
        arbitrator
    }

    pub fn state(&self) -> &ElectionState {
        &self.state
    }

    pub fn is_primary(&self) -> bool {
        self.state.is_primary
    }

    pub fn election_id(&self) -> ElectionId {
        self.state.election_id
    }

    pub fn primary_id(&self) -> ElectionId {
        self.state.primary_id
    }

    pub fn role_name(&self) -> Option<&str> {
        self.role.as_ref().map(|role| role.name.as_str())
    }

    pub fn snapshot(&self) -> ElectionSnapshot {
        ElectionSnapshot {
            election_id: self.state.election_id,
            primary_id: self.state.primary_id,
            is_primary: self.state.is_primary,
            role_name: self.role.as_ref().map(|role| role.name.clone()),
        }
    }

    fn publish(&self) {
        self.published.send_replace(self.snapshot());
    }

    fn is_backup_only(&self) -> bool {
        self.initial_election_id == 0
    }

    fn bid(&self) -> StreamRequest {
        let election_id = if self.state.election_id == 0 {
            None
        } else {
            Some(self.state.election_id)
        };
        StreamRequest::Arbitration(ArbitrationRequest {
            device_id: self.device_id,
            election_id,
            role: self.role.clone(),
        })
    }

    fn lower_bid(&mut self) {
        self.state.election_id = self.state.election_id.saturating_sub(1);
    }

    /// Negotiate primary/backup status on a freshly opened stream. With
    /// `conflict`, another connection holds our id and the first bid is lowered.
    pub async fn handshake<C>(&mut self, channel: &C, conflict: bool) -> Result<(), ArbitrationError>
    where
        C: ArbitrationChannel + ?Sized,
    {
        if conflict && !self.is_backup_only() {
            self.lower_bid();
        }
        let mut conflicts = 0u32;
        let mut rebids = 0u32;

        loop {
            debug!(
                target: "switchyard::arbitrator",
                device_id = self.device_id,
                election_id = %self.state.election_id,
                role = ?self.role_name(),
                "sending arbitration bid"
            );
            channel.send(self.bid()).await?;

            let reply = match await_arbitration(channel).await {
                Ok(reply) => reply,
                Err(err) if err.is_election_id_used() && !self.is_backup_only() => {
                    conflicts += 1;
                    if conflicts > MAX_ELECTION_RETRIES {
                        return Err(ArbitrationError::ElectionIdExhausted {
                            attempts: conflicts,
                        });
                    }
                    warn!(
                        target: "switchyard::arbitrator",
                        election_id = %self.state.election_id,
                        attempt = conflicts,
                        "election id already in use; lowering bid"
                    );
                    self.lower_bid();
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let code = reply.status.code;
            if code == Code::NotFound && !self.is_backup_only() {
                rebids += 1;
                if rebids > MAX_ELECTION_RETRIES {
                    return Err(ArbitrationError::NoPrimary { attempts: rebids });
                }
                if reply.election_id > 0 {
                    self.state.election_id = reply.election_id;
                }
                debug!(
                    target: "switchyard::arbitrator",
                    election_id = %self.state.election_id,
                    "no primary; re-bidding at reported id"
                );
                continue;
            }

            self.state.is_primary = code == Code::Ok;
            self.state.primary_id = reply.election_id;
            self.publish();
            self.state
                .check()
                .map_err(ArbitrationError::InvariantViolated)?;

            info!(
                target: "switchyard::arbitrator",
                device_id = self.device_id,
                election_id = %self.state.election_id,
                primary_id = %self.state.primary_id,
                is_primary = self.state.is_primary,
                "arbitration complete"
            );
            return Ok(());
        }
    }

    /// Apply an arbitration update pushed mid-session.
    pub async fn update<C>(
        &mut self,
        channel: &C,
        msg: &ArbitrationResponse,
    ) -> Result<RoleTransition, ArbitrationError>
    where
        C: ArbitrationChannel + ?Sized,
    {
        let reported = msg.election_id;
        let mut code = msg.status.code;

        if reported > self.state.primary_id {
            self.state.primary_id = reported;
        } else if reported < self.state.primary_id {
            if self.quirks.primary_id_decrease_invites_takeover {
                info!(
                    target: "switchyard::arbitrator",
                    reported = %reported,
                    primary_id = %self.state.primary_id,
                    "primary id decreased; treating as takeover invitation"
                );
                self.state.primary_id = reported;
                code = Code::NotFound;
            } else {
                warn!(
                    target: "switchyard::arbitrator",
                    reported = %reported,
                    primary_id = %self.state.primary_id,
                    "ignoring decreasing primary id"
                );
            }
        }

        let transition = match code {
            Code::Ok => {
                if self.state.is_primary {
                    RoleTransition::Unchanged
                } else {
                    self.state.is_primary = true;
                    RoleTransition::BecamePrimary
                }
            }
            Code::AlreadyExists => {
                if self.state.is_primary {
                    self.state.is_primary = false;
                    RoleTransition::BecameBackup
                } else {
                    RoleTransition::Unchanged
                }
            }
            Code::NotFound => {
                let was_primary = self.state.is_primary;
                self.state.is_primary = false;
                if !self.is_backup_only() {
                    if reported > 0 {
                        self.state.election_id = reported;
                    }
                    self.publish();
                    debug!(
                        target: "switchyard::arbitrator",
                        election_id = %self.state.election_id,
                        "primary gone; re-bidding"
                    );
                    channel.send(self.bid()).await?;
                }
                if was_primary {
                    RoleTransition::BecameBackup
                } else {
                    RoleTransition::Unchanged
                }
            }
            other => {
                warn!(
                    target: "switchyard::arbitrator",
                    code = %other,
                    message = %msg.status.message,
                    "unexpected arbitration status"
                );
                RoleTransition::Unchanged
            }
        };

        self.publish();
        if code != Code::NotFound {
            if let Err(violation) = self.state.check() {
                warn!(target: "switchyard::arbitrator", %violation, "election state inconsistent after update");
            }
        }
        Ok(transition)
    }

    /// Restore the configured bid after a disconnect.
    pub fn reset(&mut self) {
        self.state = ElectionState {
            election_id: self.initial_election_id,
            primary_id: 0,
            is_primary: false,
        };
        self.publish();
    }

    pub fn complete_request(&self, request: &mut UnaryRequest) {
        self.snapshot().complete_request(request);
    }
}

async fn await_arbitration<C>(channel: &C) -> Result<ArbitrationResponse, ClientError>
where
    C: ArbitrationChannel + ?Sized,
{
    loop {
        match channel.receive().await? {
            StreamResponse::Arbitration(reply) => return Ok(reply),
            other => {
                debug!(
                    target: "switchyard::arbitrator",
                    kind = other.kind(),
                    "ignoring stream message while arbitrating"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use switch_transport::{Status, WriteRequest};

    use crate::client::ClientErrorKind;

    /// Replays a fixed list of replies and records every bid.
    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<Result<StreamResponse, ClientError>>>,
        sent: Mutex<Vec<StreamRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<StreamResponse, ClientError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                sent: Mutex::default(),
            }
        }

        fn bids(&self) -> Vec<Option<ElectionId>> {
            self.sent
                .lock()
                .iter()
                .filter_map(|req| match req {
                    StreamRequest::Arbitration(bid) => Some(bid.election_id),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ArbitrationChannel for Scripted {
        async fn send(&self, request: StreamRequest) -> Result<(), ClientError> {
            self.sent.lock().push(request);
            Ok(())
        }

        async fn receive(&self) -> Result<StreamResponse, ClientError> {
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ClientError::closed()))
        }
    }

    fn reply(election_id: ElectionId, code: Code) -> Result<StreamResponse, ClientError> {
        Ok(arbitration(election_id, code))
    }

    fn arbitration(election_id: ElectionId, code: Code) -> StreamResponse {
        StreamResponse::Arbitration(ArbitrationResponse {
            device_id: 1,
            election_id,
            role: None,
            status: Status::new(code, ""),
        })
    }

    fn in_use() -> Result<StreamResponse, ClientError> {
        Err(ClientError::new(
            ClientErrorKind::Status,
            Code::InvalidArgument,
            "Election ID is already used by another connection",
        ))
    }

    fn arbitrator(initial: ElectionId) -> (Arbitrator, watch::Receiver<ElectionSnapshot>) {
        let (tx, rx) = watch::channel(ElectionSnapshot::default());
        let arb = Arbitrator::new(1, initial, None, ArbitrationQuirks::default(), Arc::new(tx));
        (arb, rx)
    }

    #[tokio::test]
    async fn adopts_reported_id_when_no_primary_then_wins() {
        let channel = Scripted::new(vec![reply(100, Code::NotFound), reply(100, Code::Ok)]);
        let (mut arb, rx) = arbitrator(100);
        arb.handshake(&channel, false).await.expect("handshake");

        assert!(arb.is_primary());
        assert_eq!(arb.election_id(), 100);
        assert_eq!(arb.primary_id(), 100);
        assert_eq!(channel.bids(), vec![Some(100), Some(100)]);
        assert!(rx.borrow().is_primary);
    }

    #[tokio::test]
    async fn becomes_backup_behind_higher_primary() {
        let channel = Scripted::new(vec![reply(200, Code::AlreadyExists)]);
        let (mut arb, _rx) = arbitrator(100);
        arb.handshake(&channel, false).await.expect("handshake");
        assert!(!arb.is_primary());
        assert_eq!(arb.primary_id(), 200);
        assert!(arb.state().check().is_ok());
    }

    #[tokio::test]
    async fn ignores_other_messages_while_waiting() {
        let packet = StreamResponse::Packet(switch_transport::PacketIn {
            payload: bytes::Bytes::from_static(b"pkt"),
            metadata: vec![],
        });
        let channel = Scripted::new(vec![Ok(packet), reply(10, Code::Ok)]);
        let (mut arb, _rx) = arbitrator(10);
        arb.handshake(&channel, false).await.expect("handshake");
        assert!(arb.is_primary());
    }

    #[tokio::test]
    async fn lowers_bid_on_conflict() {
        let channel = Scripted::new(vec![in_use(), in_use(), reply(20, Code::AlreadyExists)]);
        let (mut arb, _rx) = arbitrator(20);
        arb.handshake(&channel, false).await.expect("handshake");
        assert_eq!(channel.bids(), vec![Some(20), Some(19), Some(18)]);
        assert_eq!(arb.election_id(), 18);
        assert!(!arb.is_primary());
    }

    #[tokio::test]
    async fn conflict_retries_are_bounded() {
        let replies = (0..=MAX_ELECTION_RETRIES).map(|_| in_use()).collect();
        let channel = Scripted::new(replies);
        let (mut arb, _rx) = arbitrator(50);
        let err = arb.handshake(&channel, false).await.expect_err("must give up");
        assert!(matches!(err, ArbitrationError::ElectionIdExhausted { .. }));
    }

    #[tokio::test]
    async fn conflict_flag_biases_first_bid_down() {
        let channel = Scripted::new(vec![reply(30, Code::AlreadyExists)]);
        let (mut arb, _rx) = arbitrator(10);
        arb.handshake(&channel, true).await.expect("handshake");
        assert_eq!(channel.bids(), vec![Some(9)]);
    }

    #[tokio::test]
    async fn mismatched_primary_grant_is_fatal() {
        let channel = Scripted::new(vec![reply(11, Code::Ok)]);
        let (mut arb, _rx) = arbitrator(10);
        let err = arb.handshake(&channel, false).await.expect_err("invariant");
        assert!(matches!(err, ArbitrationError::InvariantViolated(_)));
    }

    #[tokio::test]
    async fn backup_only_accepts_absent_primary() {
        let channel = Scripted::new(vec![reply(0, Code::NotFound)]);
        let (mut arb, _rx) = arbitrator(0);
        arb.handshake(&channel, false).await.expect("handshake");
        assert!(!arb.is_primary());
        assert_eq!(channel.bids(), vec![None]);
    }

    #[tokio::test]
    async fn handshake_postcondition_holds_for_final_status() {
        let cases: Vec<(Vec<(ElectionId, Code)>, bool)> = vec![
            (vec![(5, Code::Ok)], true),
            (vec![(9, Code::AlreadyExists)], false),
            (vec![(5, Code::NotFound), (5, Code::Ok)], true),
            (vec![(5, Code::NotFound), (7, Code::NotFound), (8, Code::AlreadyExists)], false),
        ];
        for (script, expect_primary) in cases {
            let replies = script.iter().map(|(id, code)| reply(*id, *code)).collect();
            let channel = Scripted::new(replies);
            let (mut arb, _rx) = arbitrator(5);
            arb.handshake(&channel, false).await.expect("handshake");
            assert_eq!(arb.is_primary(), expect_primary, "script {script:?}");
            assert!(arb.state().check().is_ok(), "script {script:?}");
        }
    }

    #[tokio::test]
    async fn update_flips_to_primary_once() {
        let channel = Scripted::default();
        let (mut arb, _rx) = arbitrator(10);
        arb.state = ElectionState {
            election_id: 10,
            primary_id: 12,
            is_primary: false,
        };
        assert!(arb.state().check().is_ok());

        let StreamResponse::Arbitration(gone) = arbitration(12, Code::NotFound) else {
            unreachable!()
        };
        arb.update(&channel, &gone).await.expect("update");
        assert_eq!(channel.bids(), vec![Some(12)]);
        assert_eq!(arb.election_id(), 12);

        let mut flips = 0;
        for id in [12, 12, 12] {
            let StreamResponse::Arbitration(msg) = arbitration(id, Code::Ok) else {
                unreachable!()
            };
            if arb.update(&channel, &msg).await.expect("update") == RoleTransition::BecamePrimary {
                flips += 1;
            }
            assert!(arb.state().check().is_ok(), "after OK at {id}");
        }
        assert_eq!(flips, 1);
        assert!(arb.is_primary());
        assert_eq!(arb.state().election_id, arb.state().primary_id);
    }

    #[tokio::test]
    async fn already_exists_demotes_once() {
        let channel = Scripted::default();
        let (mut arb, _rx) = arbitrator(10);
        arb.state = ElectionState {
            election_id: 10,
            primary_id: 10,
            is_primary: true,
        };
        let mut demotions = 0;
        for id in [15, 15] {
            let StreamResponse::Arbitration(msg) = arbitration(id, Code::AlreadyExists) else {
                unreachable!()
            };
            if arb.update(&channel, &msg).await.expect("update") == RoleTransition::BecameBackup {
                demotions += 1;
            }
        }
        assert_eq!(demotions, 1);
        assert_eq!(arb.primary_id(), 15);
    }

    #[tokio::test]
    async fn not_found_rebids_exactly_once_at_reported_id() {
        let channel = Scripted::default();
        let (mut arb, _rx) = arbitrator(10);
        arb.state = ElectionState {
            election_id: 10,
            primary_id: 20,
            is_primary: false,
        };
        let StreamResponse::Arbitration(msg) = arbitration(20, Code::NotFound) else {
            unreachable!()
        };
        let transition = arb.update(&channel, &msg).await.expect("update");
        assert_eq!(transition, RoleTransition::Unchanged);
        assert_eq!(channel.bids(), vec![Some(20)]);
    }

    #[tokio::test]
    async fn decreasing_primary_id_is_gated_by_quirk() {
        let channel = Scripted::default();
        let (tx, _rx) = watch::channel(ElectionSnapshot::default());
        let mut arb = Arbitrator::new(
            1,
            10,
            None,
            ArbitrationQuirks {
                primary_id_decrease_invites_takeover: false,
            },
            Arc::new(tx),
        );
        arb.state = ElectionState {
            election_id: 10,
            primary_id: 30,
            is_primary: false,
        };
        let StreamResponse::Arbitration(msg) = arbitration(11, Code::AlreadyExists) else {
            unreachable!()
        };
        arb.update(&channel, &msg).await.expect("update");
        assert!(channel.bids().is_empty());
        assert_eq!(arb.primary_id(), 30);

        arb.quirks.primary_id_decrease_invites_takeover = true;
        arb.update(&channel, &msg).await.expect("update");
        assert_eq!(channel.bids(), vec![Some(11)]);
        assert_eq!(arb.primary_id(), 11);
    }

    #[tokio::test]
    async fn reset_restores_initial_bid_and_stamps_requests() {
        let channel = Scripted::new(vec![in_use(), reply(9, Code::Ok)]);
        let (tx, _rx) = watch::channel(ElectionSnapshot::default());
        let mut arb = Arbitrator::new(
            1,
            10,
            Some(Role::named("sdn")),
            ArbitrationQuirks::default(),
            Arc::new(tx),
        );
        arb.handshake(&channel, false).await.expect("handshake");
        assert_eq!(arb.election_id(), 9);

        let mut write = UnaryRequest::Write(WriteRequest {
            device_id: 1,
            role: None,
            election_id: None,
            updates: vec![],
            atomicity: Default::default(),
        });
        arb.complete_request(&mut write);
        match &write {
            UnaryRequest::Write(w) => {
                assert_eq!(w.election_id, Some(9));
                assert_eq!(w.role.as_deref(), Some("sdn"));
            }
            _ => unreachable!(),
        }

        arb.reset();
        assert_eq!(arb.election_id(), 10);
        assert!(!arb.is_primary());
        assert_eq!(arb.primary_id(), 0);
    }
}
