use std::sync::Arc;

use serde_json::json;

use curator_graph::seed::{load_demo_data, pathway_schema};
use curator_graph::{
    AdaptorSettings, AttributeValue, GraphAdaptor, Instance, InstanceKind, InstanceRef,
    MemoryGraphStore, Operator, QueryValue,
};

fn setup() -> (MemoryGraphStore, GraphAdaptor) {
    let store = MemoryGraphStore::new();
    let adaptor = GraphAdaptor::with_schema(
        Arc::new(store.clone()),
        "graph.db",
        pathway_schema(),
        AdaptorSettings::default(),
    );
    (store, adaptor)
}

fn new_instance(class_name: &str, name: &str) -> InstanceRef {
    let instance = Instance::new(InstanceKind::Generic, class_name, None);
    instance.set_display_name(Some(name.to_string()));
    instance.set_attribute("name", vec![name.into()]);
    instance
}

fn referenced_ids(values: &[AttributeValue]) -> Vec<Option<i64>> {
    values
        .iter()
        .map(|v| v.as_instance().and_then(|i| i.db_id()))
        .collect()
}

#[tokio::test]
async fn test_update_repairs_referrers() {
    let (_, adaptor) = setup();
    let atp = new_instance("SimpleEntity", "ATP");
    let reaction = new_instance("Reaction", "ATP hydrolysis");
    reaction.set_attribute("input", vec![atp.clone().into()]);
    adaptor.tx_store_instance(&reaction, false).await.unwrap();
    let atp_id = atp.db_id().unwrap();
    let reaction_id = reaction.db_id().unwrap();

    atp.set_attribute("name", vec!["adenosine triphosphate".into()]);
    adaptor.tx_update_instance(&atp).await.unwrap();

    // Read everything back from the store
    adaptor.refresh_caches();
    let reaction = adaptor.fetch_instance(reaction_id).await.unwrap().unwrap();
    let inputs = adaptor.attribute_values(&reaction, "input").await.unwrap();
    assert_eq!(referenced_ids(&inputs), vec![Some(atp_id)]);

    let atp = adaptor.fetch_instance(atp_id).await.unwrap().unwrap();
    let names = adaptor.attribute_values(&atp, "name").await.unwrap();
    assert_eq!(names[0].as_str(), Some("adenosine triphosphate"));
}

#[tokio::test]
async fn test_delete_evicts_and_detaches() {
    let (_, adaptor) = setup();
    let atp = new_instance("SimpleEntity", "ATP");
    let reaction = new_instance("Reaction", "ATP hydrolysis");
    reaction.set_attribute("input", vec![atp.clone().into()]);
    adaptor.tx_store_instance(&reaction, false).await.unwrap();
    let atp_id = atp.db_id().unwrap();
    let reaction_id = reaction.db_id().unwrap();

    adaptor.tx_delete_instance(&atp).await.unwrap();
    assert!(adaptor.cached_instance(atp_id).is_none());
    assert!(!adaptor.exist(&[atp_id]).await.unwrap());

    adaptor.refresh_caches();
    let reaction = adaptor.fetch_instance(reaction_id).await.unwrap().unwrap();
    assert!(adaptor.attribute_values(&reaction, "input").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_invalidates_cached_referrer_values() {
    let (_, adaptor) = setup();
    let atp = new_instance("SimpleEntity", "ATP");
    let reaction = new_instance("Reaction", "ATP hydrolysis");
    reaction.set_attribute("input", vec![atp.clone().into()]);
    adaptor.tx_store_instance(&reaction, false).await.unwrap();
    let atp_id = atp.db_id().unwrap();
    let reaction_id = reaction.db_id().unwrap();

    // Warm Reaction.input in the attribute cache
    adaptor.refresh_caches();
    let reaction = adaptor.fetch_instance(reaction_id).await.unwrap().unwrap();
    let inputs = adaptor.attribute_values(&reaction, "input").await.unwrap();
    assert_eq!(referenced_ids(&inputs), vec![Some(atp_id)]);
    assert!(adaptor.attribute_cache().is_populated("Reaction", "input"));

    let atp = adaptor.fetch_instance(atp_id).await.unwrap().unwrap();
    adaptor.tx_delete_instance(&atp).await.unwrap();
    assert!(!adaptor.attribute_cache().is_populated("Reaction", "input"));

    adaptor.instance_cache().clear();
    let reaction = adaptor.fetch_instance(reaction_id).await.unwrap().unwrap();
    assert!(adaptor.attribute_values(&reaction, "input").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_not_equal_collection_excludes_listed_names() {
    let (_, adaptor) = setup();
    load_demo_data(&adaptor).await.unwrap();
    let found = adaptor
        .fetch_instance_by_attribute(
            "Pathway",
            "name",
            Operator::Ne,
            QueryValue::from(json!(["Apoptosis"])),
        )
        .await
        .unwrap();
    let names: Vec<Option<String>> = found.iter().map(|p| p.display_name()).collect();
    assert_eq!(names, vec![Some("Glycolysis".to_string())]);
}

#[tokio::test]
async fn test_ewas_modifications_pair_sequence_and_residue() {
    let (_, adaptor) = setup();
    let phospho = new_instance("ModifiedResidue", "O-phospho-L-serine at 15");
    let acetyl = new_instance("ModifiedResidue", "N6-acetyl-L-lysine at 120");
    let tp53 = new_instance("EntityWithAccessionedSequence", "p-S15,K120-TP53");
    tp53.set_attribute("hasModifiedResidue", vec![phospho.clone().into(), acetyl.clone().into()]);
    adaptor.tx_store_instance(&tp53, false).await.unwrap();
    adaptor.tx_store_instance(&new_instance("SimpleEntity", "ATP"), false).await.unwrap();

    let mut pairs = adaptor.fetch_ewas_modifications().await.unwrap();
    pairs.sort_unstable();
    let tp53_id = tp53.db_id().unwrap();
    let mut expected = vec![
        [tp53_id, phospho.db_id().unwrap()],
        [tp53_id, acetyl.db_id().unwrap()],
    ];
    expected.sort_unstable();
    assert_eq!(pairs, expected);
}

#[tokio::test]
async fn test_stable_identifiers_sharing_an_old_identifier() {
    let (_, adaptor) = setup();
    let mut ids = Vec::new();
    for (identifier, old) in [
        ("R-HSA-109581", Some("REACT_578")),
        ("R-HSA-70171", Some("REACT_1383")),
        ("R-HSA-109582", Some("REACT_578")),
        ("R-HSA-9612973", None),
    ] {
        let stable_id = Instance::new(InstanceKind::Generic, "StableIdentifier", None);
        stable_id.set_display_name(Some(identifier.to_string()));
        stable_id.set_attribute("identifier", vec![identifier.into()]);
        if let Some(old) = old {
            stable_id.set_attribute("oldIdentifier", vec![old.into()]);
        }
        ids.push(adaptor.tx_store_instance(&stable_id, false).await.unwrap());
    }

    let duplicates = adaptor.fetch_stable_identifiers_with_duplicate_db_ids().await.unwrap();
    let found: Vec<(i64, Option<String>)> =
        duplicates.iter().map(|d| (d.db_id, d.identifier.clone())).collect();
    assert_eq!(
        found,
        vec![
            (ids[0], Some("R-HSA-109581".to_string())),
            (ids[2], Some("R-HSA-109582".to_string())),
        ]
    );
    assert!(duplicates.iter().all(|d| d.old_identifier == "REACT_578"));
}

#[tokio::test]
async fn test_large_result_sets_are_capped() {
    let (_, adaptor) = setup();
    let mut tx = adaptor.begin().await.unwrap();
    for i in 0..150 {
        let compartment = new_instance("Compartment", &format!("compartment {}", i));
        compartment.set_attribute("accession", vec![format!("GO:{:07}", i).into()]);
        adaptor.store_instance(&compartment, false, &mut tx, true).await.unwrap();
    }
    adaptor.commit(tx).await.unwrap();

    let found = adaptor
        .fetch_instance_by_attribute("Compartment", "name", Operator::IsNotNull, QueryValue::Null)
        .await
        .unwrap();
    assert_eq!(found.len(), 150);
    assert_eq!(adaptor.cap_results(found).len(), 100);
}

#[tokio::test]
async fn test_stoichiometry_and_order_survive_a_round_trip() {
    let (_, adaptor) = setup();
    let fadd = new_instance("SimpleEntity", "FADD");
    let casp8 = new_instance("SimpleEntity", "CASP8");
    let complex = new_instance("Complex", "FADD:CASP8 dimer");
    complex.set_attribute(
        "hasComponent",
        vec![fadd.clone().into(), casp8.clone().into(), casp8.clone().into()],
    );
    let complex_id = adaptor.tx_store_instance(&complex, false).await.unwrap();
    let expected = vec![fadd.db_id(), casp8.db_id(), casp8.db_id()];

    adaptor.refresh_caches();
    let complex = adaptor.fetch_instance(complex_id).await.unwrap().unwrap();
    let components = adaptor.attribute_values(&complex, "hasComponent").await.unwrap();
    assert_eq!(referenced_ids(&components), expected);
}

#[tokio::test]
async fn test_existing_and_inverse() {
    let (_, adaptor) = setup();
    let a = adaptor
        .tx_store_instance(&new_instance("Compartment", "cytosol"), false)
        .await
        .unwrap();
    let b = adaptor
        .tx_store_instance(&new_instance("Compartment", "nucleoplasm"), false)
        .await
        .unwrap();

    assert_eq!(adaptor.existing(&[a, 999], false, false).await.unwrap(), vec![a]);
    assert_eq!(adaptor.existing(&[a], false, true).await.unwrap(), vec![b]);
    assert!(adaptor.exist(&[a, b, a]).await.unwrap());
    assert!(!adaptor.exist(&[a, 999]).await.unwrap());
    assert!(adaptor.existing(&[], true, false).await.unwrap().is_empty());
}
