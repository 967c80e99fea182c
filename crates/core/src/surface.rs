//! Versioned UI-description documents ("surfaces") driven by agent actions.
//!
//! A surface is replaced as a whole value on every action: [`apply_action`]
//! is a pure reducer that returns the next version. Delivering new versions
//! to subscribers is a separate concern handled by the agent runtime.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfaceComponent {
    pub id: String,
    pub component_type: String,
    pub props: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Surface {
    pub id: String,
    pub components: Vec<SurfaceComponent>,
    pub metadata: Map<String, Value>,
    pub version: u64,
}

impl Surface {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), components: Vec::new(), metadata: Map::new(), version: 0 }
    }

    pub fn component(&self, id: &str) -> Option<&SurfaceComponent> {
        self.components.iter().find(|component| component.id == id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SurfaceAction {
    Render { components: Vec<SurfaceComponent> },
    UpdateComponent { id: String, props: Map<String, Value> },
    RemoveComponent { id: String },
    SetMetadata { key: String, value: Value },
}

impl SurfaceAction {
    /// Maps a wire action name plus payload onto a typed action.
    ///
    /// `on_change_<field>` updates the `value` prop of component `<field>` only.
    pub fn from_wire(name: &str, payload: &Value) -> Result<Self, SurfaceError> {
        if let Some(field) = name.strip_prefix("on_change_") {
            if field.is_empty() {
                return Err(SurfaceError::UnsupportedAction(name.to_string()));
            }
            let mut props = Map::new();
            props.insert("value".to_string(), payload.clone());
            return Ok(Self::UpdateComponent { id: field.to_string(), props });
        }

        match name {
            "render" => {
                let components = serde_json::from_value::<Vec<SurfaceComponent>>(
                    payload.get("components").cloned().unwrap_or(Value::Array(Vec::new())),
                )
                .map_err(|error| SurfaceError::InvalidPayload(error.to_string()))?;
                Ok(Self::Render { components })
            }
            "remove_component" => {
                let id = payload
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SurfaceError::InvalidPayload("missing `id`".to_string()))?;
                Ok(Self::RemoveComponent { id: id.to_string() })
            }
            "set_metadata" => {
                let key = payload
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SurfaceError::InvalidPayload("missing `key`".to_string()))?;
                let value = payload.get("value").cloned().unwrap_or(Value::Null);
                Ok(Self::SetMetadata { key: key.to_string(), value })
            }
            other => Err(SurfaceError::UnsupportedAction(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("surface has no component `{0}`")]
    UnknownComponent(String),
    #[error("unsupported surface action `{0}`")]
    UnsupportedAction(String),
    #[error("invalid surface action payload: {0}")]
    InvalidPayload(String),
}

pub fn apply_action(surface: &Surface, action: SurfaceAction) -> Result<Surface, SurfaceError> {
    let mut next = surface.clone();
    match action {
        SurfaceAction::Render { components } => {
            next.components = components;
        }
        SurfaceAction::UpdateComponent { id, props } => {
            let component = next
                .components
                .iter_mut()
                .find(|component| component.id == id)
                .ok_or(SurfaceError::UnknownComponent(id))?;
            for (key, value) in props {
                component.props.insert(key, value);
            }
        }
        SurfaceAction::RemoveComponent { id } => {
            let before = next.components.len();
            next.components.retain(|component| component.id != id);
            if next.components.len() == before {
                return Err(SurfaceError::UnknownComponent(id));
            }
        }
        SurfaceAction::SetMetadata { key, value } => {
            next.metadata.insert(key, value);
        }
    }
    next.version = surface.version + 1;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::{apply_action, Surface, SurfaceAction, SurfaceComponent, SurfaceError};

    fn form() -> Surface {
        let component = |id: &str| SurfaceComponent {
            id: id.to_string(),
            component_type: "text_input".to_string(),
            props: Map::new(),
        };
        apply_action(
            &Surface::new("surface-1"),
            SurfaceAction::Render { components: vec![component("mood"), component("sleep")] },
        )
        .expect("render")
    }

    #[test]
    fn field_change_touches_only_target_component() {
        let surface = form();
        let action = SurfaceAction::from_wire("on_change_mood", &json!(7)).expect("wire action");
        let next = apply_action(&surface, action).expect("apply");

        assert_eq!(next.version, surface.version + 1);
        assert_eq!(next.component("mood").and_then(|c| c.props.get("value")), Some(&json!(7)));
        assert_eq!(next.component("sleep"), surface.component("sleep"));
        assert!(surface.component("mood").and_then(|c| c.props.get("value")).is_none());
    }

    #[test]
    fn unknown_component_is_rejected_without_new_version() {
        let surface = form();
        let action = SurfaceAction::from_wire("on_change_energy", &json!("low")).expect("wire");
        assert_eq!(
            apply_action(&surface, action),
            Err(SurfaceError::UnknownComponent("energy".to_string()))
        );
    }

    #[test]
    fn metadata_and_removal_actions_bump_version() {
        let surface = form();
        let with_meta = apply_action(
            &surface,
            SurfaceAction::from_wire("set_metadata", &json!({"key": "status", "value": "done"}))
                .expect("wire"),
        )
        .expect("metadata");
        let removed = apply_action(
            &with_meta,
            SurfaceAction::from_wire("remove_component", &json!({"id": "sleep"})).expect("wire"),
        )
        .expect("remove");

        assert_eq!(with_meta.metadata["status"], json!("done"));
        assert_eq!(removed.components.len(), 1);
        assert_eq!(removed.version, surface.version + 2);
    }

    #[test]
    fn unsupported_wire_actions_fail() {
        assert!(matches!(
            SurfaceAction::from_wire("explode", &json!({})),
            Err(SurfaceError::UnsupportedAction(_))
        ));
        assert!(SurfaceAction::from_wire("on_change_", &json!(1)).is_err());
    }
}
