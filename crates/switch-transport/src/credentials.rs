use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::TransportError;

/// Per-call credential hook, consulted before every RPC.
pub trait CallCredentials: Send + Sync {
    fn metadata(&self, method: &str) -> Result<Vec<(String, String)>, TransportError>;
}

impl<F> CallCredentials for F
where
    F: Fn(&str) -> Result<Vec<(String, String)>, TransportError> + Send + Sync,
{
    fn metadata(&self, method: &str) -> Result<Vec<(String, String)>, TransportError> {
        (self)(method)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub cert: Bytes,
    pub key: Bytes,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// TLS settings for opening a channel. A CA alone yields a server-authenticated
/// TLS channel; adding an identity enables mutual TLS.
#[derive(Clone, Default)]
pub struct Credentials {
    root_certificates: Option<Bytes>,
    identity: Option<Identity>,
    target_name_override: Option<String>,
    call_credentials: Option<Arc<dyn CallCredentials>>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root_certificates(mut self, pem: impl Into<Bytes>) -> Self {
        self.root_certificates = Some(pem.into());
        self
    }

    pub fn with_identity(mut self, cert: impl Into<Bytes>, key: impl Into<Bytes>) -> Self {
        self.identity = Some(Identity {
            cert: cert.into(),
            key: key.into(),
        });
        self
    }

    pub fn with_target_name_override(mut self, name: impl Into<String>) -> Self {
        self.target_name_override = Some(name.into());
        self
    }

    pub fn with_call_credentials(mut self, creds: Arc<dyn CallCredentials>) -> Self {
        self.call_credentials = Some(creds);
        self
    }

    /// Load PEM material from disk. The client certificate and key must be
    /// given together or not at all.
    pub async fn from_pem_files(
        root_certificates: Option<&Path>,
        cert: Option<&Path>,
        key: Option<&Path>,
    ) -> Result<Self, TransportError> {
        let mut creds = Self::new();
        if let Some(path) = root_certificates {
            creds.root_certificates = Some(read_pem(path).await?);
        }
        match (cert, key) {
            (Some(cert), Some(key)) => {
                creds.identity = Some(Identity {
                    cert: read_pem(cert).await?,
                    key: read_pem(key).await?,
                });
            }
            (None, None) => {}
            _ => {
                return Err(TransportError::Tls(
                    "client certificate and private key must be supplied together".into(),
                ))
            }
        }
        Ok(creds)
    }

    pub fn root_certificates(&self) -> Option<&Bytes> {
        self.root_certificates.as_ref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn target_name_override(&self) -> Option<&str> {
        self.target_name_override.as_deref()
    }

    pub fn call_credentials(&self) -> Option<&Arc<dyn CallCredentials>> {
        self.call_credentials.as_ref()
    }

    pub fn is_mutual(&self) -> bool {
        self.identity.is_some()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("root_certificates", &self.root_certificates.is_some())
            .field("identity", &self.identity)
            .field("target_name_override", &self.target_name_override)
            .field("call_credentials", &self.call_credentials.is_some())
            .finish()
    }
}

async fn read_pem(path: &Path) -> Result<Bytes, TransportError> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|err| TransportError::Tls(format!("failed to read {}: {err}", path.display())))
}
