use serde::Serialize;

use crate::model::{Conflict, Entity, Id};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or cross-scope input.
    Validation(String),
    /// One entry per violated exclusivity dimension.
    Conflict(Vec<Conflict>),
    /// Requested slot range collides with these slots of the same shift.
    Overlap(Vec<Id>),
    NotFound(Entity, Id),
    /// A bulk call with nothing to do.
    EmptyBatch,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) | EngineError::EmptyBatch => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::Overlap(_) => "overlap",
            EngineError::NotFound(..) => "not_found",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::WalError(_) => "internal",
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        let (dimensions, conflicting_ids) = match self {
            EngineError::Conflict(conflicts) => (
                Some(conflicts.iter().map(|c| c.dimension.as_str()).collect()),
                Some(conflicts.iter().map(|c| c.allocation_id).collect()),
            ),
            EngineError::Overlap(ids) => (None, Some(ids.clone())),
            _ => (None, None),
        };
        ErrorPayload {
            kind: self.kind(),
            dimensions,
            conflicting_ids,
            message: self.to_string(),
        }
    }
}

/// Structured error handed back to the admin-facing layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Vec<&'static str>>,
    #[serde(rename = "conflictingIds", skip_serializing_if = "Option::is_none")]
    pub conflicting_ids: Option<Vec<Id>>,
    pub message: String,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::Conflict(conflicts) => {
                write!(f, "conflict on")?;
                for (i, c) in conflicts.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{sep}{} (allocation {})", c.dimension, c.allocation_id)?;
                }
                Ok(())
            }
            EngineError::Overlap(ids) => write!(f, "slot overlaps existing slots {ids:?}"),
            EngineError::NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            EngineError::EmptyBatch => write!(f, "empty batch"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
