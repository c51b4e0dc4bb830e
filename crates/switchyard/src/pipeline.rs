//! Forwarding program synchronization.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use switch_transport::{
    DeviceId, ForwardingPipelineConfig, GetPipelineConfigRequest, PipelineAction,
    PipelineResponseType, SetPipelineConfigRequest, UnaryRequest, UnaryResponse,
};
use tracing::{debug, info, warn};

use crate::arbitrator::ElectionSnapshot;
use crate::client::{ClientError, ClientErrorKind, ClientSession};
use crate::config::ConfigError;

/// Switch capability description, parsed elsewhere.
pub trait SchemaProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Deterministic content hash of the schema.
    fn cookie(&self) -> u64;

    /// Serialized schema as pushed to the switch.
    fn encoded(&self) -> Bytes;

    fn table_id(&self, name: &str) -> Option<u32>;
    fn action_id(&self, name: &str) -> Option<u32>;
    fn digest_id(&self, name: &str) -> Option<u32>;
}

/// Schema given as an encoded blob plus name tables.
#[derive(Debug, Clone, Default)]
pub struct MapSchema {
    name: String,
    encoded: Bytes,
    tables: HashMap<String, u32>,
    actions: HashMap<String, u32>,
    digests: HashMap<String, u32>,
}

impl MapSchema {
    pub fn new(name: impl Into<String>, encoded: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            encoded: encoded.into(),
            ..Self::default()
        }
    }

    pub fn with_table(mut self, name: impl Into<String>, id: u32) -> Self {
        self.tables.insert(name.into(), id);
        self
    }

    pub fn with_action(mut self, name: impl Into<String>, id: u32) -> Self {
        self.actions.insert(name.into(), id);
        self
    }

    pub fn with_digest(mut self, name: impl Into<String>, id: u32) -> Self {
        self.digests.insert(name.into(), id);
        self
    }
}

impl SchemaProvider for MapSchema {
    fn name(&self) -> &str {
        &self.name
    }

    fn cookie(&self) -> u64 {
        truncated_sha256(&[self.encoded.as_ref()])
    }

    fn encoded(&self) -> Bytes {
        self.encoded.clone()
    }

    fn table_id(&self, name: &str) -> Option<u32> {
        self.tables.get(name).copied()
    }

    fn action_id(&self, name: &str) -> Option<u32> {
        self.actions.get(name).copied()
    }

    fn digest_id(&self, name: &str) -> Option<u32> {
        self.digests.get(name).copied()
    }
}

/// Where the forwarding program blob comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineSource {
    Inline(Bytes),
    File(PathBuf),
}

impl PipelineSource {
    pub async fn load(&self) -> Result<Bytes, ConfigError> {
        match self {
            PipelineSource::Inline(blob) => Ok(blob.clone()),
            PipelineSource::File(path) => tokio::fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source: Arc::new(source),
                }),
        }
    }
}

/// Cookie of the schema + program pair: the first 8 bytes of SHA-256 over
/// the schema's cookie and the program blob.
pub fn pipeline_cookie(schema: &dyn SchemaProvider, blob: &[u8]) -> u64 {
    truncated_sha256(&[&schema.cookie().to_be_bytes()[..], blob])
}

fn truncated_sha256(parts: &[&[u8]]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// The program a session wants installed.
#[derive(Clone)]
pub struct DesiredPipeline {
    pub schema: Arc<dyn SchemaProvider>,
    pub blob: Bytes,
    pub cookie: u64,
}

impl fmt::Debug for DesiredPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredPipeline")
            .field("schema", &self.schema.name())
            .field("blob_len", &self.blob.len())
            .field("cookie", &format_args!("{:#018x}", self.cookie))
            .finish()
    }
}

impl DesiredPipeline {
    pub async fn load(
        schema: Arc<dyn SchemaProvider>,
        program: Option<&PipelineSource>,
    ) -> Result<Self, ConfigError> {
        let blob = match program {
            Some(source) => source.load().await?,
            None => Bytes::new(),
        };
        let cookie = pipeline_cookie(schema.as_ref(), &blob);
        Ok(Self {
            schema,
            blob,
            cookie,
        })
    }

    fn config(&self) -> ForwardingPipelineConfig {
        ForwardingPipelineConfig {
            p4info: Some(self.schema.encoded()),
            device_config: self.blob.clone(),
            cookie: Some(self.cookie),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The installed program already matches.
    Unchanged,
    /// We pushed the program.
    Installed,
    /// Backup view: the installed program differs or is missing.
    Mismatch,
}

/// Primary: push the program unless the installed cookie already matches.
pub async fn sync_primary(
    client: &ClientSession,
    election: &ElectionSnapshot,
    device_id: DeviceId,
    desired: &DesiredPipeline,
    force_reload: bool,
) -> Result<PipelineOutcome, ClientError> {
    if !force_reload {
        match installed(client, device_id, PipelineResponseType::CookieOnly).await? {
            Some(config) if config.cookie == Some(desired.cookie) => {
                debug!(
                    target: "switchyard::session",
                    device_id,
                    cookie = %format_args!("{:#018x}", desired.cookie),
                    "pipeline up to date"
                );
                return Ok(PipelineOutcome::Unchanged);
            }
            Some(config) => {
                info!(
                    target: "switchyard::session",
                    device_id,
                    installed = ?config.cookie,
                    desired = desired.cookie,
                    "pipeline cookie mismatch"
                );
            }
            None => {
                info!(target: "switchyard::session", device_id, "no pipeline installed");
            }
        }
    }

    let mut request = UnaryRequest::SetPipelineConfig(SetPipelineConfigRequest {
        device_id,
        role: None,
        election_id: None,
        action: PipelineAction::VerifyAndCommit,
        config: desired.config(),
    });
    election.complete_request(&mut request);
    match client.request(request).await? {
        UnaryResponse::SetPipelineConfig => {
            info!(
                target: "switchyard::session",
                device_id,
                schema = %desired.schema.name(),
                forced = force_reload,
                "pipeline installed"
            );
            Ok(PipelineOutcome::Installed)
        }
        other => Err(unexpected_reply("SetForwardingPipelineConfig", &other)),
    }
}

/// Backup: compare what is installed and warn on mismatch. Never pushes.
pub async fn check_backup(
    client: &ClientSession,
    device_id: DeviceId,
    desired: &DesiredPipeline,
) -> Result<PipelineOutcome, ClientError> {
    match installed(client, device_id, PipelineResponseType::P4InfoAndCookie).await? {
        Some(config) if config.cookie == Some(desired.cookie) => Ok(PipelineOutcome::Unchanged),
        Some(config) => {
            warn!(
                target: "switchyard::session",
                device_id,
                installed = ?config.cookie,
                desired = desired.cookie,
                "installed pipeline differs from ours"
            );
            Ok(PipelineOutcome::Mismatch)
        }
        None => {
            warn!(target: "switchyard::session", device_id, "switch has no pipeline yet");
            Ok(PipelineOutcome::Mismatch)
        }
    }
}

async fn installed(
    client: &ClientSession,
    device_id: DeviceId,
    response_type: PipelineResponseType,
) -> Result<Option<ForwardingPipelineConfig>, ClientError> {
    let request = UnaryRequest::GetPipelineConfig(GetPipelineConfigRequest {
        device_id,
        response_type,
    });
    match client.request(request).await {
        Ok(UnaryResponse::GetPipelineConfig(config)) => Ok(Some(config)),
        Ok(other) => Err(unexpected_reply("GetForwardingPipelineConfig", &other)),
        Err(err) if err.is_pipeline_missing() => Ok(None),
        Err(err) => Err(err),
    }
}

pub(crate) fn unexpected_reply(method: &str, reply: &UnaryResponse) -> ClientError {
    ClientError::new(
        ClientErrorKind::Protocol,
        switch_transport::Code::Internal,
        format!("unexpected reply to {method}: {reply:?}"),
    )
}
