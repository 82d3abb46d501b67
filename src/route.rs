//! Per-route configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ContextMap;
use crate::error::RouteError;

/// Slot-keyed settings for one endpoint, e.g.
/// `{ "allowAnonymous": true }` or `{ "requireRoles": ["admin"] }`.
///
/// Most endpoints carry nothing but a couple of flags; the dynamic
/// middleware for each slot interprets its own entry.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RouteConfig {
    slots: BTreeMap<String, Value>,
}

impl RouteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the entry for `slot`. Returns `self` for chaining.
    pub fn set(mut self, slot: &str, value: impl Into<Value>) -> Self {
        self.slots.insert(slot.to_owned(), value.into());
        self
    }

    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.slots.get(slot)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Checks every entry against the slot registry: the slot must exist and
    /// the value must match its shape. Run once per route, at registration.
    pub(crate) fn validate(&self, path: &str, map: &ContextMap) -> Result<(), RouteError> {
        for (name, value) in &self.slots {
            let info = map.get(name).ok_or_else(|| RouteError::UnknownSlot {
                path: path.to_owned(),
                slot: name.clone(),
            })?;
            if !info.shape.accepts(value) {
                return Err(RouteError::Shape {
                    path: path.to_owned(),
                    slot: info.name,
                    expected: info.shape,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ConfigShape, ContextSlot, FailureKind};

    const FLAG: ContextSlot<()> = ContextSlot::new("flag", FailureKind::Invalid, ConfigShape::Flag);

    #[test]
    fn deserializes_from_a_plain_object() {
        let config: RouteConfig =
            serde_json::from_str(r#"{"allowAnonymous": false, "requireRoles": ["admin"]}"#).unwrap();
        assert_eq!(config.get("allowAnonymous"), Some(&Value::Bool(false)));
        assert_eq!(config, RouteConfig::new().set("allowAnonymous", false).set("requireRoles", vec!["admin"]));
    }

    #[test]
    fn validation_rejects_unknown_slots_and_bad_shapes() {
        let map = ContextMap::new().slot(&FLAG).unwrap();

        assert!(RouteConfig::new().set("flag", true).validate("/a", &map).is_ok());
        assert!(matches!(
            RouteConfig::new().set("other", true).validate("/a", &map),
            Err(RouteError::UnknownSlot { slot, .. }) if slot == "other"
        ));
        assert!(matches!(
            RouteConfig::new().set("flag", "yes").validate("/a", &map),
            Err(RouteError::Shape { slot: "flag", expected: ConfigShape::Flag, .. })
        ));
    }
}
