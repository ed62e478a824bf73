//! Hierarchy messages exchanged with the server
//!
//! Messages usually arrive already deserialized; `from_json` decodes a raw
//! JSON frame. Framing and session transport live elsewhere.

use serde::{Deserialize, Serialize};

use crate::cell::ConfigPayload;
use crate::error::Result;
use crate::transform::{CellBounds, CellTransform};
use crate::types::CellId;

/// Inbound hierarchy message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellMessage {
    /// Create a cell and attach it under its parent
    Create {
        /// New cell
        cell_id: CellId,
        /// Type identifier looked up in the factory registry
        type_name: String,
        /// Local bounds
        #[serde(default)]
        local_bounds: Option<CellBounds>,
        /// Parent, `None` for a root
        #[serde(default)]
        parent_id: Option<CellId>,
        /// Local transform
        #[serde(default)]
        local_transform: Option<CellTransform>,
        /// Opaque configuration handed to the components
        #[serde(default)]
        payload: ConfigPayload,
        /// Display name
        #[serde(default)]
        name: Option<String>,
    },
    /// Move a cell under another parent
    Reparent {
        /// Cell to move
        cell_id: CellId,
        /// New parent, `None` to make it a root
        #[serde(default)]
        parent_id: Option<CellId>,
        /// Local transform relative to the new parent
        #[serde(default)]
        local_transform: Option<CellTransform>,
    },
    /// Deliver a new configuration
    Configure {
        /// Target cell
        cell_id: CellId,
        /// New payload
        #[serde(default)]
        payload: ConfigPayload,
        /// New display name
        #[serde(default)]
        name: Option<String>,
    },
    /// Remove a cell and its subtree
    Remove {
        /// Cell to remove
        cell_id: CellId,
    },
    /// The client's view is in place; cells may now load fully
    ViewReady,
}

impl CellMessage {
    /// Decode a message from its JSON wire form
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Get the message type as string
    pub fn message_type(&self) -> &str {
        match self {
            CellMessage::Create { .. } => "CREATE",
            CellMessage::Reparent { .. } => "REPARENT",
            CellMessage::Configure { .. } => "CONFIGURE",
            CellMessage::Remove { .. } => "REMOVE",
            CellMessage::ViewReady => "VIEW_READY",
        }
    }

    /// Cell the message targets
    pub fn cell_id(&self) -> Option<CellId> {
        match self {
            CellMessage::Create { cell_id, .. }
            | CellMessage::Reparent { cell_id, .. }
            | CellMessage::Configure { cell_id, .. }
            | CellMessage::Remove { cell_id } => Some(*cell_id),
            CellMessage::ViewReady => None,
        }
    }
}

/// Outbound message toward the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamMessage {
    /// A create named a parent this client does not have; ask the server to
    /// resend the cell under that parent
    ReparentRequest {
        /// Cell that could not be attached
        cell_id: CellId,
        /// Parent it declared
        parent_id: CellId,
    },
}

/// Channel back to the server
#[cfg_attr(test, mockall::automock)]
pub trait UpstreamSink: Send + Sync {
    /// Send one message
    fn send(&self, message: UpstreamMessage);
}

/// Upstream sink that drops every message
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUpstream;

impl UpstreamSink for NullUpstream {
    fn send(&self, message: UpstreamMessage) {
        tracing::debug!(?message, "Upstream message dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_create_from_json() {
        let json = r#"{
            "type": "create",
            "cell_id": 7,
            "type_name": "model",
            "parent_id": 3,
            "local_transform": {"translation": [1.0, 0.0, 0.0], "rotation": [0.0, 0.0, 0.0, 1.0], "scale": [1.0, 1.0, 1.0]},
            "local_bounds": {"shape": "sphere", "center": [0.0, 0.0, 0.0], "radius": 2.0},
            "payload": {"model": "wla://models/teapot.bin"}
        }"#;
        let message = CellMessage::from_json(json).unwrap();
        assert_eq!(message.message_type(), "CREATE");
        assert_eq!(message.cell_id(), Some(CellId::new(7)));

        match message {
            CellMessage::Create {
                parent_id,
                local_transform,
                local_bounds,
                name,
                ..
            } => {
                assert_eq!(parent_id, Some(CellId::new(3)));
                assert_eq!(local_transform.unwrap().translation, Vec3::X);
                assert_eq!(local_bounds, Some(CellBounds::sphere(Vec3::ZERO, 2.0)));
                assert_eq!(name, None);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_is_serialization_error() {
        let err = CellMessage::from_json(r#"{"type": "remove"}"#).unwrap_err();
        assert!(matches!(err, crate::error::CellError::Serialization(_)));
        assert!(!err.is_stale());
    }

    #[test]
    fn test_view_ready_has_no_cell() {
        let message: CellMessage = serde_json::from_str(r#"{"type": "view_ready"}"#).unwrap();
        assert_eq!(message, CellMessage::ViewReady);
        assert_eq!(message.cell_id(), None);
    }

    #[test]
    fn test_upstream_wire_form() {
        let message = UpstreamMessage::ReparentRequest {
            cell_id: CellId::new(7),
            parent_id: CellId::new(3),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "reparent_request", "cell_id": 7, "parent_id": 3})
        );
    }
}
