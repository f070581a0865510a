use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{AdaptorError, AdaptorResult};

pub const DB_ID: &str = "DB_ID";
pub const DISPLAY_NAME: &str = "_displayName";
pub const TIMESTAMP: &str = "_timestamp";
/// Node property holding the concrete class name; not a schema attribute.
pub const SCHEMA_CLASS: &str = "schemaClass";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Instance,
    String,
    Integer,
    Long,
    Float,
    Boolean,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Instance => "Instance",
            ValueKind::String => "String",
            ValueKind::Integer => "Integer",
            ValueKind::Long => "Long",
            ValueKind::Float => "Float",
            ValueKind::Boolean => "Boolean",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Outgoing => Direction::Incoming,
            Direction::Incoming => Direction::Outgoing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DefiningType {
    All,
    Any,
}

/// How instances of a class are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InstanceKind {
    #[default]
    Generic,
    /// Diagram layout attributes are loaded on first access.
    PathwayDiagram,
}

impl InstanceKind {
    pub fn loads_lazily(&self, attribute: &str) -> bool {
        match self {
            InstanceKind::Generic => false,
            InstanceKind::PathwayDiagram => {
                matches!(attribute, "height" | "width" | "storedATXML")
            }
        }
    }
}

// ---- Definition document (deserialized from JSON) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub allowed_classes: Vec<String>,
    #[serde(default)]
    pub defining: Option<DefiningType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDefinition {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub timestamp: Option<String>,
    pub classes: Vec<ClassDefinition>,
    /// Class name to instance kind; subclasses inherit the kind.
    #[serde(default)]
    pub instance_kinds: HashMap<String, InstanceKind>,
}

// ---- Built schema ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaAttribute {
    pub name: String,
    /// Class that declares the attribute.
    pub origin: String,
    pub kind: ValueKind,
    pub multiple: bool,
    pub direction: Direction,
    pub allowed_classes: Vec<String>,
    pub defining: Option<DefiningType>,
}

impl SchemaAttribute {
    pub fn is_instance_type(&self) -> bool {
        self.kind == ValueKind::Instance
    }

    /// First allowed class; used as the target label of relationship hops.
    pub fn target_class(&self) -> Option<&str> {
        self.allowed_classes.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaClass {
    pub name: String,
    pub parent: Option<String>,
    /// Nearest parent first, root last.
    pub ancestors: Vec<String>,
    pub subclasses: Vec<String>,
    #[serde(skip)]
    attributes: Vec<Arc<SchemaAttribute>>,
    #[serde(skip)]
    referrers: Vec<Arc<SchemaAttribute>>,
    pub kind: InstanceKind,
}

impl SchemaClass {
    pub fn attributes(&self) -> &[Arc<SchemaAttribute>] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Arc<SchemaAttribute>> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attribute_or_err(&self, name: &str) -> AdaptorResult<&Arc<SchemaAttribute>> {
        self.attribute(name).ok_or_else(|| AdaptorError::InvalidAttribute {
            class: self.name.clone(),
            attribute: name.to_string(),
        })
    }

    pub fn is_valid_attribute(&self, attribute: &SchemaAttribute) -> bool {
        self.attribute(&attribute.name)
            .map(|a| a.origin == attribute.origin)
            .unwrap_or(false)
    }

    /// Attributes of other classes that may hold instances of this class.
    pub fn referrers(&self) -> &[Arc<SchemaAttribute>] {
        &self.referrers
    }

    pub fn referrer(&self, name: &str) -> Option<&Arc<SchemaAttribute>> {
        self.referrers.iter().find(|a| a.name == name)
    }

    pub fn defining_attributes(
        &self,
        defining: DefiningType,
    ) -> impl Iterator<Item = &Arc<SchemaAttribute>> {
        self.attributes
            .iter()
            .filter(move |a| a.defining == Some(defining))
    }

    pub fn has_defining_attributes(&self) -> bool {
        self.attributes.iter().any(|a| a.defining.is_some())
    }

    pub fn is_a(&self, class_name: &str) -> bool {
        self.name == class_name || self.ancestors.iter().any(|a| a == class_name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Schema {
    classes: BTreeMap<String, SchemaClass>,
    root: String,
    timestamp: Option<String>,
}

impl Schema {
    pub fn from_definition(definition: SchemaDefinition) -> AdaptorResult<Self> {
        let mut defs: BTreeMap<String, ClassDefinition> = BTreeMap::new();
        for class in definition.classes {
            check_identifier(&class.name)?;
            for att in &class.attributes {
                check_identifier(&att.name)?;
            }
            if defs.insert(class.name.clone(), class.clone()).is_some() {
                return Err(AdaptorError::InvalidSchema(format!(
                    "duplicate class {}",
                    class.name
                )));
            }
        }

        let roots: Vec<&String> = defs
            .values()
            .filter(|c| c.parent.is_none())
            .map(|c| &c.name)
            .collect();
        if roots.len() != 1 {
            return Err(AdaptorError::InvalidSchema(format!(
                "expected exactly one root class, found {}",
                roots.len()
            )));
        }
        let root = roots[0].clone();

        // Ancestors, walking parent links
        let mut ancestors: HashMap<String, Vec<String>> = HashMap::new();
        for name in defs.keys() {
            let mut chain = Vec::new();
            let mut current = defs[name].parent.clone();
            while let Some(parent) = current {
                let parent_def = defs.get(&parent).ok_or_else(|| {
                    AdaptorError::InvalidSchema(format!(
                        "class {} has unknown parent {}",
                        name, parent
                    ))
                })?;
                if chain.contains(&parent) || parent == *name {
                    return Err(AdaptorError::InvalidSchema(format!(
                        "cyclic class hierarchy at {}",
                        name
                    )));
                }
                chain.push(parent.clone());
                current = parent_def.parent.clone();
            }
            ancestors.insert(name.clone(), chain);
        }

        // Own attributes, shared by reference with subclasses
        let mut own: HashMap<String, Vec<Arc<SchemaAttribute>>> = HashMap::new();
        for def in defs.values() {
            let mut atts = Vec::new();
            for att in &def.attributes {
                for allowed in &att.allowed_classes {
                    if !defs.contains_key(allowed) {
                        return Err(AdaptorError::InvalidSchema(format!(
                            "attribute {}.{} allows unknown class {}",
                            def.name, att.name, allowed
                        )));
                    }
                }
                if att.kind == ValueKind::Instance && att.allowed_classes.is_empty() {
                    return Err(AdaptorError::InvalidSchema(format!(
                        "instance attribute {}.{} has no allowed classes",
                        def.name, att.name
                    )));
                }
                atts.push(Arc::new(SchemaAttribute {
                    name: att.name.clone(),
                    origin: def.name.clone(),
                    kind: att.kind,
                    multiple: att.multiple,
                    direction: att.direction,
                    allowed_classes: att.allowed_classes.clone(),
                    defining: att.defining,
                }));
            }
            own.insert(def.name.clone(), atts);
        }

        let mut classes = BTreeMap::new();
        for (name, def) in &defs {
            // Root-most attributes first so bookkeeping attributes lead
            let mut attributes: Vec<Arc<SchemaAttribute>> = Vec::new();
            for ancestor in ancestors[name].iter().rev() {
                attributes.extend(own[ancestor].iter().cloned());
            }
            for att in &own[name] {
                // A subclass redeclaring an attribute overrides it
                attributes.retain(|a| a.name != att.name);
                attributes.push(att.clone());
            }

            let subclasses = defs
                .values()
                .filter(|c| c.parent.as_deref() == Some(name.as_str()))
                .map(|c| c.name.clone())
                .collect();

            let kind = std::iter::once(name)
                .chain(ancestors[name].iter())
                .find_map(|c| definition.instance_kinds.get(c).copied())
                .unwrap_or_default();

            classes.insert(
                name.clone(),
                SchemaClass {
                    name: name.clone(),
                    parent: def.parent.clone(),
                    ancestors: ancestors[name].clone(),
                    subclasses,
                    attributes,
                    referrers: Vec::new(),
                    kind,
                },
            );
        }

        // Referrers: an attribute refers to class C when it allows C or an ancestor of C
        let all_own: Vec<Arc<SchemaAttribute>> = own.values().flatten().cloned().collect();
        for class in classes.values_mut() {
            let mut referrers: Vec<Arc<SchemaAttribute>> = all_own
                .iter()
                .filter(|a| a.is_instance_type())
                .filter(|a| a.allowed_classes.iter().any(|allowed| class.is_a(allowed)))
                .cloned()
                .collect();
            referrers.sort_by(|a, b| (&a.origin, &a.name).cmp(&(&b.origin, &b.name)));
            class.referrers = referrers;
        }

        Ok(Self {
            classes,
            root,
            timestamp: definition.timestamp,
        })
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let definition: SchemaDefinition = serde_json::from_str(json)?;
        Ok(Self::from_definition(definition)?)
    }

    pub fn get_class(&self, name: &str) -> Option<&SchemaClass> {
        self.classes.get(name)
    }

    /// Look a class up, failing with `InvalidClass` when unknown.
    pub fn class(&self, name: &str) -> AdaptorResult<&SchemaClass> {
        self.classes
            .get(name)
            .ok_or_else(|| AdaptorError::InvalidClass(name.to_string()))
    }

    pub fn is_valid_class(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &SchemaClass> {
        self.classes.values()
    }

    pub fn root_class(&self) -> &SchemaClass {
        &self.classes[&self.root]
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    pub fn instance_kind(&self, class_name: &str) -> InstanceKind {
        self.classes
            .get(class_name)
            .map(|c| c.kind)
            .unwrap_or_default()
    }

    /// The class itself followed by all of its transitive subclasses.
    pub fn descendants(&self, name: &str) -> AdaptorResult<Vec<&SchemaClass>> {
        let mut out = vec![self.class(name)?];
        let mut i = 0;
        while i < out.len() {
            let subs: Vec<&SchemaClass> = out[i]
                .subclasses
                .iter()
                .filter_map(|s| self.classes.get(s))
                .collect();
            out.extend(subs);
            i += 1;
        }
        Ok(out)
    }

    /// Every declared (not inherited) attribute with the given name.
    pub fn original_attributes_by_name(&self, name: &str) -> Vec<Arc<SchemaAttribute>> {
        self.classes
            .values()
            .filter_map(|c| c.attribute(name))
            .unique_by(|a| a.origin.clone())
            .cloned()
            .collect()
    }
}

fn check_identifier(name: &str) -> AdaptorResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AdaptorError::InvalidSchema(format!(
            "'{}' is not a valid identifier",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::pathway_schema;

    #[test]
    fn test_ancestors_are_ordered_nearest_first() {
        let schema = pathway_schema();
        let reaction = schema.class("Reaction").unwrap();
        assert_eq!(
            reaction.ancestors,
            vec!["ReactionlikeEvent", "Event", "DatabaseObject"]
        );
        assert_eq!(schema.root_class().name, "DatabaseObject");
    }

    #[test]
    fn test_inherited_attributes_keep_their_origin() {
        let schema = pathway_schema();
        let pathway = schema.class("Pathway").unwrap();
        let name = pathway.attribute("name").unwrap();
        assert_eq!(name.origin, "Event");
        assert!(pathway.attribute(DB_ID).is_some());
        assert!(pathway.attribute("hasEvent").unwrap().multiple);
    }

    #[test]
    fn test_referrers_follow_allowed_class_hierarchy() {
        let schema = pathway_schema();
        let reaction = schema.class("Reaction").unwrap();
        // Pathway.hasEvent allows Event, which Reaction is
        assert!(reaction
            .referrers()
            .iter()
            .any(|a| a.origin == "Pathway" && a.name == "hasEvent"));
        assert!(reaction
            .referrers()
            .iter()
            .any(|a| a.origin == "Event" && a.name == "precedingEvent"));
    }

    #[test]
    fn test_defining_attribute_sets() {
        let schema = pathway_schema();
        let complex = schema.class("Complex").unwrap();
        let all: Vec<&str> = complex
            .defining_attributes(DefiningType::All)
            .map(|a| a.name.as_str())
            .collect();
        assert!(all.contains(&"hasComponent"));
        assert!(schema.class("Pathway").unwrap().has_defining_attributes() == false);
    }

    #[test]
    fn test_descendants_and_instance_kinds() {
        let schema = pathway_schema();
        let names: Vec<&str> = schema
            .descendants("Event")
            .unwrap()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert!(names.contains(&"Pathway"));
        assert!(names.contains(&"Reaction"));
        assert_eq!(
            schema.instance_kind("PathwayDiagram"),
            InstanceKind::PathwayDiagram
        );
        assert_eq!(schema.instance_kind("Pathway"), InstanceKind::Generic);
    }

    #[test]
    fn test_invalid_class_is_reported() {
        let schema = pathway_schema();
        match schema.class("NoSuchClass") {
            Err(AdaptorError::InvalidClass(name)) => assert_eq!(name, "NoSuchClass"),
            other => panic!("unexpected: {:?}", other.map(|c| c.name.clone())),
        }
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        let definition = SchemaDefinition {
            timestamp: None,
            classes: vec![ClassDefinition {
                name: "Bad) DETACH DELETE n //".to_string(),
                parent: None,
                attributes: vec![],
            }],
            instance_kinds: HashMap::new(),
        };
        assert!(matches!(
            Schema::from_definition(definition),
            Err(AdaptorError::InvalidSchema(_))
        ));
    }
}
