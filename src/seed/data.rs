use anyhow::Result;

use crate::logic::GraphAdaptor;
use crate::model::instance::{Instance, InstanceRef};
use crate::model::value::AttributeValue;

/// Builds unsaved demo instances against the adaptor's schema.
struct Builder<'a> {
    adaptor: &'a GraphAdaptor,
}

impl Builder<'_> {
    fn new_instance(&self, class_name: &str, display_name: &str) -> Result<InstanceRef> {
        let schema = self.adaptor.schema()?;
        schema.class(class_name)?;
        let instance = Instance::new(schema.instance_kind(class_name), class_name, None);
        instance.set_display_name(Some(display_name.to_string()));
        Ok(instance)
    }

    fn compartment(&self, name: &str, accession: &str) -> Result<InstanceRef> {
        let c = self.new_instance("Compartment", name)?;
        c.set_attribute("name", vec![name.into()]);
        c.set_attribute("accession", vec![accession.into()]);
        Ok(c)
    }

    fn entity(
        &self,
        name: &str,
        compartment: &InstanceRef,
        reference: Option<&InstanceRef>,
    ) -> Result<InstanceRef> {
        let display_name = format!("{} [{}]", name, compartment_name(compartment));
        let e = self.new_instance("SimpleEntity", &display_name)?;
        e.set_attribute("name", vec![name.into()]);
        e.set_attribute("compartment", vec![compartment.clone().into()]);
        if let Some(reference) = reference {
            e.set_attribute("referenceEntity", vec![reference.clone().into()]);
        }
        Ok(e)
    }

    fn reaction(
        &self,
        name: &str,
        inputs: &[&InstanceRef],
        outputs: &[&InstanceRef],
    ) -> Result<InstanceRef> {
        let r = self.new_instance("Reaction", name)?;
        r.set_attribute("name", vec![name.into()]);
        r.set_attribute("input", refs(inputs));
        r.set_attribute("output", refs(outputs));
        Ok(r)
    }
}

fn compartment_name(compartment: &InstanceRef) -> String {
    compartment
        .value("name")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn refs(instances: &[&InstanceRef]) -> Vec<AttributeValue> {
    instances.iter().map(|i| AttributeValue::Instance((*i).clone())).collect()
}

/// Store a small apoptosis/glycolysis knowledgebase through the write
/// pipeline, in one transaction.
pub async fn load_demo_data(adaptor: &GraphAdaptor) -> Result<()> {
    let b = Builder { adaptor };

    let cytosol = b.compartment("cytosol", "GO:0005829")?;
    let nucleoplasm = b.compartment("nucleoplasm", "GO:0005654")?;

    let human = b.new_instance("Species", "Homo sapiens")?;
    human.set_attribute("name", vec!["Homo sapiens".into()]);
    human.set_attribute("taxId", vec!["9606".into()]);

    let chebi = b.new_instance("ReferenceDatabase", "ChEBI")?;
    chebi.set_attribute(
        "name",
        vec!["ChEBI".into(), "Chemical Entities of Biological Interest".into()],
    );
    let reference = |name: &str, identifier: &str| -> Result<InstanceRef> {
        let r = b.new_instance("ReferenceEntity", &format!("ChEBI:{} {}", identifier, name))?;
        r.set_attribute("name", vec![name.into()]);
        r.set_attribute("identifier", vec![identifier.into()]);
        r.set_attribute("referenceDatabase", vec![chebi.clone().into()]);
        Ok(r)
    };

    let atp = b.entity("ATP", &cytosol, Some(&reference("ATP", "15422")?))?;
    let adp = b.entity("ADP", &cytosol, Some(&reference("ADP", "16761")?))?;
    let glucose = b.entity("glucose", &cytosol, Some(&reference("glucose", "17234")?))?;
    let g6p = b.entity("G6P", &cytosol, Some(&reference("G6P", "4170")?))?;
    let fadd = b.entity("FADD", &cytosol, None)?;
    let casp8 = b.entity("CASP8", &cytosol, None)?;
    let cyt_c = b.entity("CYCS", &nucleoplasm, None)?;

    let disc = b.new_instance("Complex", "FADD:CASP8 dimer [cytosol]")?;
    disc.set_attribute("name", vec!["FADD:CASP8 dimer".into()]);
    disc.set_attribute("compartment", vec![cytosol.clone().into()]);
    disc.set_attribute("hasComponent", refs(&[&fadd, &casp8, &casp8]));

    let activation = b.reaction("CASP8 activation", &[&disc], &[&casp8])?;
    let release = b.reaction("Cytochrome c release", &[&cyt_c], &[&cyt_c])?;
    // Two reactions preceding each other form a cycle
    activation.set_attribute("precedingEvent", refs(&[&release]));
    release.set_attribute("precedingEvent", refs(&[&activation]));
    let hexokinase = b.reaction(
        "Hexokinase phosphorylates glucose",
        &[&glucose, &atp],
        &[&g6p, &adp],
    )?;

    let apoptosis = b.new_instance("Pathway", "Apoptosis")?;
    apoptosis.set_attribute("name", vec!["Apoptosis".into(), "Programmed cell death".into()]);
    apoptosis.set_attribute("hasEvent", refs(&[&activation, &release]));
    apoptosis.set_attribute("species", vec![human.clone().into()]);

    let glycolysis = b.new_instance("Pathway", "Glycolysis")?;
    glycolysis.set_attribute("name", vec!["Glycolysis".into()]);
    glycolysis.set_attribute("hasEvent", refs(&[&hexokinase]));
    glycolysis.set_attribute("species", vec![human.into()]);

    let diagram = b.new_instance("PathwayDiagram", "Diagram of Apoptosis")?;
    diagram.set_attribute("representedPathway", vec![apoptosis.clone().into()]);
    diagram.set_attribute("height", vec![600.into()]);
    diagram.set_attribute("width", vec![800.into()]);
    diagram.set_attribute("storedATXML", vec!["<Process><Nodes/><Edges/></Process>".into()]);

    let current = b.new_instance("_Release", "Release 86")?;
    current.set_attribute("releaseNumber", vec![86.into()]);

    let roots = [apoptosis, glycolysis, diagram, current];
    let mut tx = adaptor.begin().await?;
    let mut stored = Ok(());
    for root in &roots {
        if let Err(e) = adaptor.store_instance(root, false, &mut tx, true).await {
            stored = Err(e);
            break;
        }
    }
    match stored {
        Ok(()) => adaptor.commit(tx).await?,
        Err(e) => {
            adaptor.rollback(tx).await;
            return Err(e.into());
        }
    }
    log::info!("demo data loaded ({} instances)", adaptor.instance_cache().len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::AdaptorSettings;
    use crate::seed::pathway_schema;
    use crate::store::MemoryGraphStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_demo_data_is_stored() {
        let store = MemoryGraphStore::new();
        let adaptor = GraphAdaptor::with_schema(
            Arc::new(store.clone()),
            "graph.db",
            pathway_schema(),
            AdaptorSettings::default(),
        );
        load_demo_data(&adaptor).await.unwrap();
        assert_eq!(adaptor.release_number().await.unwrap(), Some(86));
        assert_eq!(adaptor.class_instance_count("Pathway").await.unwrap(), 2);
        assert_eq!(adaptor.class_instance_count("Event").await.unwrap(), 5);
        assert_eq!(adaptor.max_db_id().await.unwrap(), Some(store.node_count() as i64));
    }
}
