use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use switch_transport::{Credentials, DeviceId, ElectionId, Role, RoleConfig};
use thiserror::Error;

use crate::arbitrator::ArbitrationQuirks;
use crate::client::DEFAULT_REQUEST_TIMEOUT;
use crate::logging::DEFAULT_LOG_FILTER;
use crate::pipeline::{PipelineSource, SchemaProvider};
use crate::queues::DEFAULT_QUEUE_CAPACITY;
use crate::session::SwitchSession;

pub const DEFAULT_ELECTION_ID: ElectionId = 10;
pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_COOLDOWN: Duration = Duration::from_secs(2);
pub const DEFAULT_ROLE_SETTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Invoked once per successful (re)connection, and again after every role
/// transition. The returned job runs as a foreground task.
pub type ReadyHook = Arc<dyn Fn(SwitchSession) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Per-switch settings. Immutable once built; `with_*` derives a modified copy.
#[derive(Clone)]
pub struct SessionConfig {
    schema: Option<Arc<dyn SchemaProvider>>,
    program: Option<PipelineSource>,
    force_reload: bool,
    device_id: DeviceId,
    initial_election_id: ElectionId,
    role: Option<Role>,
    credentials: Option<Credentials>,
    ready_hook: Option<ReadyHook>,
    fail_fast: bool,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("schema", &self.schema.as_ref().map(|schema| schema.name().to_string()))
            .field("program", &self.program)
            .field("force_reload", &self.force_reload)
            .field("device_id", &self.device_id)
            .field("initial_election_id", &self.initial_election_id)
            .field("role", &self.role)
            .field("credentials", &self.credentials)
            .field("ready_hook", &self.ready_hook.is_some())
            .field("fail_fast", &self.fail_fast)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            schema: None,
            program: None,
            force_reload: false,
            device_id: 1,
            initial_election_id: DEFAULT_ELECTION_ID,
            role: None,
            credentials: None,
            ready_hook: None,
            fail_fast: false,
            payload: None,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    pub fn schema(&self) -> Option<&Arc<dyn SchemaProvider>> {
        self.schema.as_ref()
    }

    pub fn program(&self) -> Option<&PipelineSource> {
        self.program.as_ref()
    }

    pub fn force_reload(&self) -> bool {
        self.force_reload
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn initial_election_id(&self) -> ElectionId {
        self.initial_election_id
    }

    pub fn is_backup_only(&self) -> bool {
        self.initial_election_id == 0
    }

    pub fn role(&self) -> Option<&Role> {
        self.role.as_ref()
    }

    pub fn role_name(&self) -> Option<&str> {
        self.role.as_ref().map(|role| role.name.as_str())
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn ready_hook(&self) -> Option<&ReadyHook> {
        self.ready_hook.as_ref()
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Application payload, if one of type `T` was attached.
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|payload| payload.downcast_ref::<T>())
    }

    pub fn with_schema(&self, schema: Arc<dyn SchemaProvider>) -> Self {
        Self {
            schema: Some(schema),
            ..self.clone()
        }
    }

    pub fn with_program(&self, program: PipelineSource) -> Self {
        Self {
            program: Some(program),
            ..self.clone()
        }
    }

    pub fn with_force_reload(&self, force_reload: bool) -> Self {
        Self {
            force_reload,
            ..self.clone()
        }
    }

    pub fn with_device_id(&self, device_id: DeviceId) -> Self {
        Self {
            device_id,
            ..self.clone()
        }
    }

    pub fn with_initial_election_id(&self, initial_election_id: ElectionId) -> Self {
        Self {
            initial_election_id,
            ..self.clone()
        }
    }

    pub fn with_role(&self, name: impl Into<String>, config: Option<RoleConfig>) -> Self {
        Self {
            role: Some(Role {
                name: name.into(),
                config,
            }),
            ..self.clone()
        }
    }

    pub fn with_credentials(&self, credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
            ..self.clone()
        }
    }

    pub fn with_ready_hook(&self, hook: ReadyHook) -> Self {
        Self {
            ready_hook: Some(hook),
            ..self.clone()
        }
    }

    pub fn with_fail_fast(&self, fail_fast: bool) -> Self {
        Self {
            fail_fast,
            ..self.clone()
        }
    }

    pub fn with_payload<T: Any + Send + Sync>(&self, payload: T) -> Self {
        Self {
            payload: Some(Arc::new(payload)),
            ..self.clone()
        }
    }
}

#[derive(Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn schema(mut self, schema: Arc<dyn SchemaProvider>) -> Self {
        self.config.schema = Some(schema);
        self
    }

    pub fn program(mut self, program: PipelineSource) -> Self {
        self.config.program = Some(program);
        self
    }

    pub fn program_bytes(self, blob: impl Into<Bytes>) -> Self {
        self.program(PipelineSource::Inline(blob.into()))
    }

    pub fn force_reload(mut self, force_reload: bool) -> Self {
        self.config.force_reload = force_reload;
        self
    }

    pub fn device_id(mut self, device_id: DeviceId) -> Self {
        self.config.device_id = device_id;
        self
    }

    pub fn initial_election_id(mut self, election_id: ElectionId) -> Self {
        self.config.initial_election_id = election_id;
        self
    }

    pub fn role(mut self, name: impl Into<String>, config: Option<RoleConfig>) -> Self {
        self.config.role = Some(Role {
            name: name.into(),
            config,
        });
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.config.credentials = Some(credentials);
        self
    }

    pub fn ready_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(SwitchSession) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.config.ready_hook = Some(Arc::new(hook));
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.config.fail_fast = fail_fast;
        self
    }

    pub fn payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.config.payload = Some(Arc::new(payload));
        self
    }

    pub fn build(self) -> Arc<SessionConfig> {
        Arc::new(self.config)
    }
}

/// Runtime tuning shared by every session of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub request_timeout: Duration,
    /// An attempt shorter than this is followed by `reconnect_cooldown`.
    pub min_uptime: Duration,
    pub reconnect_cooldown: Duration,
    pub queue_capacity: usize,
    /// Pause between cancelling foreground tasks and re-running the ready hook.
    pub role_settle: Duration,
    pub quirks: ArbitrationQuirks,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            min_uptime: DEFAULT_MIN_UPTIME,
            reconnect_cooldown: DEFAULT_RECONNECT_COOLDOWN,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            role_settle: DEFAULT_ROLE_SETTLE,
            quirks: ArbitrationQuirks::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub log_filter: String,
    pub session: SessionSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.into(),
            session: SessionSettings::default(),
        }
    }
}

impl ControllerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = SessionSettings::default();
        let log_filter = lookup("SWITCHYARD_LOG")
            .or_else(|| lookup("RUST_LOG"))
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.into());
        let request_timeout = millis(&lookup, "SWITCHYARD_REQUEST_TIMEOUT_MS")?
            .unwrap_or(defaults.request_timeout);
        let min_uptime =
            millis(&lookup, "SWITCHYARD_MIN_UPTIME_MS")?.unwrap_or(defaults.min_uptime);
        let reconnect_cooldown = millis(&lookup, "SWITCHYARD_RECONNECT_COOLDOWN_MS")?
            .unwrap_or(defaults.reconnect_cooldown);
        let queue_capacity = match lookup("SWITCHYARD_QUEUE_CAPACITY") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(capacity) if capacity > 0 => capacity,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "SWITCHYARD_QUEUE_CAPACITY",
                        value: raw,
                    })
                }
            },
            None => defaults.queue_capacity,
        };
        let role_settle =
            millis(&lookup, "SWITCHYARD_ROLE_SETTLE_MS")?.unwrap_or(defaults.role_settle);
        let primary_id_decrease_invites_takeover = lookup("SWITCHYARD_PRIMARY_ID_DECREASE_TAKEOVER")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(defaults.quirks.primary_id_decrease_invites_takeover);

        Ok(Self {
            log_filter,
            session: SessionSettings {
                request_timeout,
                min_uptime,
                reconnect_cooldown,
                queue_capacity,
                role_settle,
                quirks: ArbitrationQuirks {
                    primary_id_decrease_invites_takeover,
                },
            },
        })
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match lookup(name) {
        Some(raw) => raw
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn derived_config_leaves_original_untouched() {
        let primary = SessionConfig::builder()
            .device_id(3)
            .initial_election_id(100)
            .role("sdn", None)
            .payload(42u32)
            .build();
        let backup = primary.with_initial_election_id(0);

        assert_eq!(primary.initial_election_id(), 100);
        assert!(backup.is_backup_only());
        assert_eq!(backup.device_id(), 3);
        assert_eq!(backup.role_name(), Some("sdn"));
        assert_eq!(backup.payload::<u32>(), Some(&42));
        assert_eq!(backup.payload::<String>(), None);
    }

    #[test]
    fn settings_from_lookup_apply_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SWITCHYARD_REQUEST_TIMEOUT_MS", "2500"),
            ("SWITCHYARD_QUEUE_CAPACITY", "8"),
            ("SWITCHYARD_PRIMARY_ID_DECREASE_TAKEOVER", "off"),
        ]
        .into_iter()
        .collect();
        let settings =
            ControllerSettings::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
                .expect("valid settings");
        assert_eq!(settings.session.request_timeout, Duration::from_millis(2500));
        assert_eq!(settings.session.queue_capacity, 8);
        assert_eq!(settings.session.min_uptime, DEFAULT_MIN_UPTIME);
        assert!(!settings.session.quirks.primary_id_decrease_invites_takeover);
    }

    #[test]
    fn settings_reject_garbage() {
        let err = ControllerSettings::from_lookup(|name| {
            (name == "SWITCHYARD_QUEUE_CAPACITY").then(|| "0".to_string())
        })
        .expect_err("zero capacity");
        assert!(matches!(err, ConfigError::Invalid { name: "SWITCHYARD_QUEUE_CAPACITY", .. }));
    }
}
