//! Seam to the external entity codec.

use switch_transport::{EntityKind, WireEntity};
use thiserror::Error;

use crate::pipeline::SchemaProvider;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown {kind} '{name}'")]
    UnknownName { kind: &'static str, name: String },
    #[error("cannot decode {kind:?}: {reason}")]
    Malformed { kind: EntityKind, reason: String },
    #[error("entity kind {0:?} is not supported by this codec")]
    Unsupported(EntityKind),
}

/// Translates application entities to and from their wire form.
pub trait EntityCodec: Send + Sync {
    type Entity: Send;

    fn encode(
        &self,
        schema: &dyn SchemaProvider,
        entity: &Self::Entity,
    ) -> Result<WireEntity, CodecError>;

    fn decode(
        &self,
        wire: &WireEntity,
        schema: &dyn SchemaProvider,
    ) -> Result<Self::Entity, CodecError>;
}

/// Pass-through codec for callers that already hold wire entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl EntityCodec for RawCodec {
    type Entity = WireEntity;

    fn encode(
        &self,
        _schema: &dyn SchemaProvider,
        entity: &WireEntity,
    ) -> Result<WireEntity, CodecError> {
        Ok(entity.clone())
    }

    fn decode(
        &self,
        wire: &WireEntity,
        _schema: &dyn SchemaProvider,
    ) -> Result<WireEntity, CodecError> {
        Ok(wire.clone())
    }
}
