use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::model::schema::{InstanceKind, DISPLAY_NAME};
use crate::model::value::AttributeValue;

/// Shared handle; the identity cache guarantees one per DB_ID.
pub type InstanceRef = Arc<Instance>;

/// Loaded value(s) of one attribute. A single value is stored unwrapped.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    One(AttributeValue),
    Many(Vec<AttributeValue>),
}

impl Slot {
    pub fn from_values(mut values: Vec<AttributeValue>) -> Option<Self> {
        match values.len() {
            0 => None,
            1 => values.pop().map(Slot::One),
            _ => Some(Slot::Many(values)),
        }
    }

    pub fn values(&self) -> Vec<AttributeValue> {
        match self {
            Slot::One(v) => vec![v.clone()],
            Slot::Many(vs) => vs.clone(),
        }
    }

    pub fn first(&self) -> Option<&AttributeValue> {
        match self {
            Slot::One(v) => Some(v),
            Slot::Many(vs) => vs.first(),
        }
    }
}

#[derive(Default)]
struct InstanceState {
    class_name: String,
    db_id: Option<i64>,
    attributes: HashMap<String, Slot>,
    inflated: bool,
    referrers: HashMap<String, Vec<Weak<Instance>>>,
}

/// In-memory representation of one graph node.
pub struct Instance {
    kind: InstanceKind,
    state: RwLock<InstanceState>,
}

impl Instance {
    pub fn new(kind: InstanceKind, class_name: &str, db_id: Option<i64>) -> InstanceRef {
        Arc::new(Self {
            kind,
            state: RwLock::new(InstanceState {
                class_name: class_name.to_string(),
                db_id,
                ..Default::default()
            }),
        })
    }

    /// Same object, or both persisted with the same DB_ID.
    pub fn same(a: &InstanceRef, b: &InstanceRef) -> bool {
        if Arc::ptr_eq(a, b) {
            return true;
        }
        match (a.db_id(), b.db_id()) {
            (Some(x), Some(y)) => x == y && x >= 0,
            _ => false,
        }
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    pub fn class_name(&self) -> String {
        self.state.read().class_name.clone()
    }

    pub fn set_class_name(&self, class_name: &str) {
        self.state.write().class_name = class_name.to_string();
    }

    pub fn db_id(&self) -> Option<i64> {
        self.state.read().db_id
    }

    pub fn set_db_id(&self, db_id: i64) {
        self.state.write().db_id = Some(db_id);
    }

    /// Put back an identifier saved before a store that did not commit.
    pub fn restore_db_id(&self, db_id: Option<i64>) {
        self.state.write().db_id = db_id;
    }

    /// Has a non-negative DB_ID, i.e. exists in the datastore.
    pub fn is_persisted(&self) -> bool {
        matches!(self.db_id(), Some(id) if id >= 0)
    }

    pub fn display_name(&self) -> Option<String> {
        self.state
            .read()
            .attributes
            .get(DISPLAY_NAME)
            .and_then(|slot| slot.first().and_then(|v| v.as_str().map(str::to_string)))
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.set_attribute(DISPLAY_NAME, name.map(AttributeValue::String).into_iter().collect());
    }

    pub fn is_inflated(&self) -> bool {
        self.state.read().inflated
    }

    pub fn set_inflated(&self, inflated: bool) {
        self.state.write().inflated = inflated;
    }

    pub fn is_attribute_loaded(&self, name: &str) -> bool {
        self.state.read().attributes.contains_key(name)
    }

    pub fn loaded_attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().attributes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn slot(&self, name: &str) -> Option<Slot> {
        self.state.read().attributes.get(name).cloned()
    }

    /// Loaded values of an attribute, in order; empty when not loaded.
    pub fn values(&self, name: &str) -> Vec<AttributeValue> {
        self.state
            .read()
            .attributes
            .get(name)
            .map(Slot::values)
            .unwrap_or_default()
    }

    pub fn value(&self, name: &str) -> Option<AttributeValue> {
        self.state
            .read()
            .attributes
            .get(name)
            .and_then(|slot| slot.first().cloned())
    }

    /// Replace an attribute's values without schema checks. An empty list
    /// removes the attribute.
    pub fn set_attribute(&self, name: &str, values: Vec<AttributeValue>) {
        let mut state = self.state.write();
        match Slot::from_values(values) {
            Some(slot) => {
                state.attributes.insert(name.to_string(), slot);
            }
            None => {
                state.attributes.remove(name);
            }
        }
    }

    /// Clear all attribute values and reset the inflated flag.
    pub fn deflate(&self) {
        let mut state = self.state.write();
        state.attributes.clear();
        state.inflated = false;
    }

    pub fn add_referrer(&self, attribute: &str, referrer: &InstanceRef) {
        let mut state = self.state.write();
        let list = state.referrers.entry(attribute.to_string()).or_default();
        let present = list
            .iter()
            .filter_map(Weak::upgrade)
            .any(|r| Arc::ptr_eq(&r, referrer));
        if !present {
            list.push(Arc::downgrade(referrer));
        }
    }

    pub fn referrers(&self, attribute: &str) -> Vec<InstanceRef> {
        self.state
            .read()
            .referrers
            .get(attribute)
            .map(|list| list.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Drop `referrer` from every back-reference list.
    pub fn remove_referrer(&self, referrer: &InstanceRef) {
        let mut state = self.state.write();
        for list in state.referrers.values_mut() {
            list.retain(|w| match w.upgrade() {
                Some(r) => !Arc::ptr_eq(&r, referrer),
                None => false,
            });
        }
        state.referrers.retain(|_, list| !list.is_empty());
    }

    pub fn clear_referrers(&self) {
        self.state.write().referrers.clear();
    }

    /// Serializable snapshot; instance values become shallow references.
    pub fn view(&self) -> InstanceView {
        // Snapshot first: referenced instances (possibly self) take their own locks
        let (db_id, class_name, inflated, slots) = {
            let state = self.state.read();
            (
                state.db_id,
                state.class_name.clone(),
                state.inflated,
                state.attributes.clone(),
            )
        };
        let display_name = slots
            .get(DISPLAY_NAME)
            .and_then(|s| s.first().and_then(|v| v.as_str().map(str::to_string)));
        let attributes = slots
            .iter()
            .map(|(name, slot)| {
                let json = match slot {
                    Slot::One(v) => value_view(v),
                    Slot::Many(vs) => Value::Array(vs.iter().map(value_view).collect()),
                };
                (name.clone(), json)
            })
            .collect();
        InstanceView {
            db_id,
            class_name,
            display_name,
            inflated,
            attributes,
        }
    }
}

fn value_view(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Instance(i) => serde_json::json!({
            "dbId": i.db_id(),
            "className": i.class_name(),
            "displayName": i.display_name(),
        }),
        other => other.to_json(),
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Instance")
            .field("class_name", &state.class_name)
            .field("db_id", &state.db_id)
            .field("inflated", &state.inflated)
            .field("attributes", &state.attributes.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub db_id: Option<i64>,
    pub class_name: String,
    pub display_name: Option<String>,
    pub inflated: bool,
    pub attributes: std::collections::BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_value_is_stored_unwrapped() {
        let ins = Instance::new(InstanceKind::Generic, "Pathway", Some(1));
        ins.set_attribute("name", vec!["Apoptosis".into()]);
        assert!(matches!(ins.slot("name"), Some(Slot::One(_))));
        ins.set_attribute("name", vec!["Apoptosis".into(), "Cell death".into()]);
        assert!(matches!(ins.slot("name"), Some(Slot::Many(ref v)) if v.len() == 2));
        ins.set_attribute("name", vec![]);
        assert!(!ins.is_attribute_loaded("name"));
    }

    #[test]
    fn test_deflate_resets_state() {
        let ins = Instance::new(InstanceKind::Generic, "Pathway", Some(1));
        ins.set_display_name(Some("Apoptosis".to_string()));
        ins.set_inflated(true);
        ins.deflate();
        assert!(!ins.is_inflated());
        assert!(ins.display_name().is_none());
    }

    #[test]
    fn test_referrers_are_weak_and_removable() {
        let target = Instance::new(InstanceKind::Generic, "Reaction", Some(2));
        let pathway = Instance::new(InstanceKind::Generic, "Pathway", Some(1));
        target.add_referrer("hasEvent", &pathway);
        target.add_referrer("hasEvent", &pathway);
        assert_eq!(target.referrers("hasEvent").len(), 1);
        target.remove_referrer(&pathway);
        assert!(target.referrers("hasEvent").is_empty());

        let transient = Instance::new(InstanceKind::Generic, "Pathway", Some(3));
        target.add_referrer("hasEvent", &transient);
        drop(transient);
        assert!(target.referrers("hasEvent").is_empty());
    }

    #[test]
    fn test_persisted_requires_non_negative_id() {
        assert!(!Instance::new(InstanceKind::Generic, "Pathway", None).is_persisted());
        assert!(!Instance::new(InstanceKind::Generic, "Pathway", Some(-4)).is_persisted());
        assert!(Instance::new(InstanceKind::Generic, "Pathway", Some(0)).is_persisted());
    }
}
