use std::collections::HashMap;

use crate::model::schema::{
    AttributeDefinition, ClassDefinition, DefiningType, Direction, InstanceKind, Schema,
    SchemaDefinition, ValueKind, DB_ID, DISPLAY_NAME, TIMESTAMP,
};

fn primitive(name: &str, kind: ValueKind) -> AttributeDefinition {
    AttributeDefinition {
        name: name.to_string(),
        kind,
        multiple: false,
        direction: Direction::Outgoing,
        allowed_classes: vec![],
        defining: None,
    }
}

fn reference(name: &str, allowed: &[&str]) -> AttributeDefinition {
    AttributeDefinition {
        allowed_classes: allowed.iter().map(|c| c.to_string()).collect(),
        ..primitive(name, ValueKind::Instance)
    }
}

fn multiple(mut att: AttributeDefinition) -> AttributeDefinition {
    att.multiple = true;
    att
}

fn defining(mut att: AttributeDefinition, defining: DefiningType) -> AttributeDefinition {
    att.defining = Some(defining);
    att
}

fn class(
    name: &str,
    parent: Option<&str>,
    attributes: Vec<AttributeDefinition>,
) -> ClassDefinition {
    ClassDefinition {
        name: name.to_string(),
        parent: parent.map(str::to_string),
        attributes,
    }
}

/// Definition of a small pathway knowledgebase schema, used by the demo data
/// and the tests.
pub fn pathway_schema_definition() -> SchemaDefinition {
    use ValueKind::*;
    let root = Some("DatabaseObject");
    SchemaDefinition {
        timestamp: Some("2024-01-01 00:00:00".to_string()),
        classes: vec![
            class(
                "DatabaseObject",
                None,
                vec![
                    primitive(DB_ID, Long),
                    primitive(DISPLAY_NAME, String),
                    primitive(TIMESTAMP, String),
                ],
            ),
            class(
                "Event",
                root,
                vec![
                    multiple(primitive("name", String)),
                    multiple(reference("precedingEvent", &["Event"])),
                    multiple(reference("species", &["Species"])),
                ],
            ),
            class("Pathway", Some("Event"), vec![multiple(reference("hasEvent", &["Event"]))]),
            class(
                "ReactionlikeEvent",
                Some("Event"),
                vec![
                    multiple(reference("input", &["PhysicalEntity"])),
                    multiple(reference("output", &["PhysicalEntity"])),
                    multiple(reference("compartment", &["Compartment"])),
                ],
            ),
            class("Reaction", Some("ReactionlikeEvent"), vec![]),
            class(
                "PhysicalEntity",
                root,
                vec![
                    defining(primitive("name", String), DefiningType::All),
                    defining(reference("compartment", &["Compartment"]), DefiningType::All),
                ],
            ),
            class(
                "Complex",
                Some("PhysicalEntity"),
                vec![defining(
                    multiple(reference("hasComponent", &["PhysicalEntity"])),
                    DefiningType::All,
                )],
            ),
            class(
                "SimpleEntity",
                Some("PhysicalEntity"),
                vec![defining(
                    reference("referenceEntity", &["ReferenceEntity"]),
                    DefiningType::All,
                )],
            ),
            class(
                "EntityWithAccessionedSequence",
                Some("PhysicalEntity"),
                vec![defining(
                    multiple(reference("hasModifiedResidue", &["ModifiedResidue"])),
                    DefiningType::All,
                )],
            ),
            class(
                "ModifiedResidue",
                root,
                vec![defining(primitive("name", String), DefiningType::All)],
            ),
            class(
                "StableIdentifier",
                root,
                vec![
                    defining(primitive("identifier", String), DefiningType::All),
                    primitive("oldIdentifier", String),
                ],
            ),
            class(
                "Species",
                root,
                vec![
                    defining(primitive("name", String), DefiningType::All),
                    primitive("taxId", String),
                ],
            ),
            class(
                "Compartment",
                root,
                vec![
                    primitive("name", String),
                    defining(primitive("accession", String), DefiningType::All),
                ],
            ),
            class(
                "ReferenceDatabase",
                root,
                vec![defining(multiple(primitive("name", String)), DefiningType::Any)],
            ),
            class(
                "ReferenceEntity",
                root,
                vec![
                    primitive("name", String),
                    defining(primitive("identifier", String), DefiningType::All),
                    defining(
                        reference("referenceDatabase", &["ReferenceDatabase"]),
                        DefiningType::All,
                    ),
                ],
            ),
            class(
                "PathwayDiagram",
                root,
                vec![
                    reference("representedPathway", &["Pathway"]),
                    primitive("height", Integer),
                    primitive("width", Integer),
                    primitive("storedATXML", String),
                ],
            ),
            class("_Release", root, vec![primitive("releaseNumber", Integer)]),
        ],
        instance_kinds: HashMap::from([(
            "PathwayDiagram".to_string(),
            InstanceKind::PathwayDiagram,
        )]),
    }
}

pub fn pathway_schema() -> Schema {
    match Schema::from_definition(pathway_schema_definition()) {
        Ok(schema) => schema,
        Err(e) => unreachable!("built-in schema is valid: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_round_trips_through_json() {
        let json = serde_json::to_string(&pathway_schema_definition()).unwrap();
        let schema = Schema::from_json(&json).unwrap();
        assert!(schema.is_valid_class("Complex"));
        assert_eq!(schema.timestamp(), Some("2024-01-01 00:00:00"));
    }
}
