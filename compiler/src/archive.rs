// archive.rs — Archiver collaborator and model/map archives
//
// Nodes write and read named state fields through the object-safe `Archiver`
// and `Unarchiver` traits; the typed `write`/`read` helpers sit on the trait
// objects and go through `serde_json::Value`. Connectivity never passes
// through a node: the model archive stores each node's input PortElements and
// remaps archived ids to fresh handles on load.
//
// Records are written in topological (id) order, so every reference in a
// record points at an earlier record.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::id::NodeId;
use crate::map::{Map, MapInput};
use crate::model::Model;
use crate::node::Node;
use crate::port::{PortElements, PortRange};

/// Archive format tag written at the top of every model archive.
pub const FORMAT: &str = "emc-model";
/// Version of the model archive framing.
pub const FORMAT_VERSION: u32 = 1;

// ── Collaborator traits ────────────────────────────────────────────────────

pub trait Archiver {
    fn write_value(&mut self, name: &str, value: Value) -> Result<()>;
}

pub trait Unarchiver {
    fn read_value(&self, name: &str) -> Option<Value>;
}

impl dyn Archiver + '_ {
    pub fn write<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.write_value(name, value)
    }
}

impl dyn Unarchiver + '_ {
    pub fn read<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .read_value(name)
            .ok_or_else(|| GraphError::Archive(format!("missing field '{}'", name)))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Read `name`, or `default` when the field is absent (older versions).
    pub fn read_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T> {
        match self.read_value(name) {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(default),
        }
    }
}

/// Archiver collecting fields into a JSON object.
#[derive(Debug, Default, Clone)]
pub struct JsonArchiver {
    fields: JsonMap<String, Value>,
}

impl JsonArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl Archiver for JsonArchiver {
    fn write_value(&mut self, name: &str, value: Value) -> Result<()> {
        if self.fields.contains_key(name) {
            return Err(GraphError::Archive(format!("field '{}' written twice", name)));
        }
        self.fields.insert(name.to_string(), value);
        Ok(())
    }
}

/// Unarchiver reading fields from a JSON object.
#[derive(Debug, Default, Clone)]
pub struct JsonUnarchiver {
    fields: JsonMap<String, Value>,
}

impl JsonUnarchiver {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(JsonUnarchiver { fields }),
            Value::Null => Ok(JsonUnarchiver::default()),
            other => Err(GraphError::Archive(format!(
                "node state must be an object, found {}",
                other
            ))),
        }
    }
}

impl Unarchiver for JsonUnarchiver {
    fn read_value(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }
}

// ── Model archive ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    id: NodeId,
    type_name: String,
    version: u32,
    inputs: Vec<PortElements>,
    state: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelRecord {
    format: String,
    version: u32,
    nodes: Vec<NodeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MapRecord {
    model: ModelRecord,
    inputs: Vec<MapInput>,
    output: PortElements,
}

fn model_record(model: &Model) -> Result<ModelRecord> {
    let mut nodes = Vec::with_capacity(model.len());
    for (id, node) in model.iter() {
        let mut archiver = JsonArchiver::new();
        node.write_to_archive(&mut archiver)?;
        nodes.push(NodeRecord {
            id,
            type_name: node.type_name(),
            version: node.archive_version(),
            inputs: node.inputs().iter().map(|i| i.elements().clone()).collect(),
            state: archiver.into_value(),
        });
    }
    Ok(ModelRecord {
        format: FORMAT.to_string(),
        version: FORMAT_VERSION,
        nodes,
    })
}

fn remap(elements: &PortElements, ids: &HashMap<NodeId, NodeId>) -> Result<PortElements> {
    let ranges = elements
        .ranges()
        .iter()
        .map(|r| {
            let node = ids.get(&r.port.node).ok_or_else(|| {
                GraphError::Archive(format!("reference to {} precedes its record", r.port))
            })?;
            Ok(PortRange::new(node.port(r.port.index), r.start, r.count))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(PortElements::from_ranges(elements.port_type(), ranges))
}

fn model_from_record(record: ModelRecord) -> Result<(Model, HashMap<NodeId, NodeId>)> {
    if record.format != FORMAT {
        return Err(GraphError::Archive(format!(
            "not a model archive (format '{}')",
            record.format
        )));
    }
    if record.version == 0 || record.version > FORMAT_VERSION {
        return Err(GraphError::Archive(format!(
            "unsupported archive format version {}",
            record.version
        )));
    }
    let mut model = Model::new();
    let mut ids = HashMap::new();
    for rec in record.nodes {
        let inputs = rec
            .inputs
            .iter()
            .map(|e| remap(e, &ids))
            .collect::<Result<Vec<_>>>()?;
        let unarchiver = JsonUnarchiver::from_value(rec.state)?;
        let node = Node::read_from_archive(&rec.type_name, rec.version, inputs, &unarchiver)?;
        let new_id = model.add_node(node)?;
        ids.insert(rec.id, new_id);
    }
    Ok((model, ids))
}

/// Serialize `model` as pretty-printed JSON.
pub fn save_model(model: &Model) -> Result<String> {
    let record = model_record(model)?;
    debug!(nodes = record.nodes.len(), "model archived");
    Ok(serde_json::to_string_pretty(&record)?)
}

/// Compact form used for fingerprints.
pub fn canonical_json(model: &Model) -> Result<String> {
    Ok(serde_json::to_string(&model_record(model)?)?)
}

pub fn load_model(text: &str) -> Result<Model> {
    let record: ModelRecord = serde_json::from_str(text)?;
    let (model, _) = model_from_record(record)?;
    debug!(nodes = model.len(), "model loaded");
    Ok(model)
}

pub fn save_map(map: &Map) -> Result<String> {
    let record = MapRecord {
        model: model_record(map.model())?,
        inputs: map.inputs().to_vec(),
        output: map.output().clone(),
    };
    Ok(serde_json::to_string_pretty(&record)?)
}

pub fn load_map(text: &str) -> Result<Map> {
    let record: MapRecord = serde_json::from_str(text)?;
    let (model, ids) = model_from_record(record.model)?;
    let inputs = record
        .inputs
        .into_iter()
        .map(|input| {
            let node = ids.get(&input.node).copied().ok_or_else(|| {
                GraphError::Archive(format!("map input '{}' names unknown {}", input.name, input.node))
            })?;
            Ok((input.name, node))
        })
        .collect::<Result<Vec<_>>>()?;
    let output = remap(&record.output, &ids)?;
    Map::new(model, inputs, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::BinaryOp;
    use crate::layout::{PortMemoryLayout, PortType};
    use crate::nodes::{
        BinaryOperationNode, ConstantNode, ConvolutionParams, DenseLayerNode, InputNode,
        MatrixMatrixMultiplyNode, MatrixVectorProductNode, NodeKind, OutputNode, ReorderDataNode,
        SimpleConvolutionComputeNode, SimpleConvolutionNode, SinkNode, SourceNode, TypeCastNode,
    };

    fn whole(model: &Model, id: NodeId) -> PortElements {
        model.port_elements(id.port(0)).unwrap()
    }

    fn quarters(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i % 5) as f32 * 0.25 - 0.5).collect()
    }

    /// Apply `edit` to the record of every node whose type name starts with `prefix`.
    fn edit_records(text: &str, prefix: &str, edit: impl Fn(&mut JsonMap<String, Value>)) -> String {
        let mut archive: Value = serde_json::from_str(text).unwrap();
        let nodes = archive["nodes"].as_array_mut().unwrap();
        for record in nodes.iter_mut() {
            let record = record.as_object_mut().unwrap();
            if record["type_name"].as_str().unwrap().starts_with(prefix) {
                edit(record);
            }
        }
        serde_json::to_string(&archive).unwrap()
    }

    fn strided_convolution() -> Model {
        let layout = PortMemoryLayout::contiguous(vec![3, 3, 1]);
        let mut model = Model::new();
        let x = model.add_node(InputNode::new(PortType::Real32, layout.clone())).unwrap();
        model
            .add_node(
                SimpleConvolutionNode::new(whole(&model, x), layout, ConvolutionParams::new(3, 2, 1), quarters(9))
                    .unwrap(),
            )
            .unwrap();
        model
    }

    #[test]
    fn typed_fields_round_trip() {
        let mut archiver = JsonArchiver::new();
        {
            let ar: &mut dyn Archiver = &mut archiver;
            ar.write("stride", &2usize).unwrap();
            ar.write("name", "conv").unwrap();
        }
        let un = JsonUnarchiver::from_value(archiver.into_value()).unwrap();
        let un: &dyn Unarchiver = &un;
        assert_eq!(un.read::<usize>("stride").unwrap(), 2);
        assert_eq!(un.read::<String>("name").unwrap(), "conv");
        assert_eq!(un.read_or("missing", 7u32).unwrap(), 7);
        assert!(matches!(un.read::<u32>("missing"), Err(GraphError::Archive(_))));
    }

    #[test]
    fn duplicate_field_is_rejected() {
        let mut archiver = JsonArchiver::new();
        let ar: &mut dyn Archiver = &mut archiver;
        ar.write("x", &1).unwrap();
        assert!(ar.write("x", &2).is_err());
    }

    #[test]
    fn model_round_trip_preserves_structure() {
        let mut model = Model::new();
        let c = model.add_node(ConstantNode::new(vec![1.0f32, 2.0, 3.0, 4.0])).unwrap();
        let e = model.port_elements(c.port(0)).unwrap();
        model.add_node(OutputNode::new(e)).unwrap();
        let text = save_model(&model).unwrap();
        let loaded = load_model(&text).unwrap();
        assert_eq!(loaded.to_string(), model.to_string());
        assert_eq!(loaded.node(NodeId(0)), model.node(NodeId(0)));
    }

    #[test]
    fn newer_node_version_is_rejected() {
        let mut model = Model::new();
        model.add_node(ConstantNode::new(vec![1i32])).unwrap();
        let text = save_model(&model).unwrap().replace("\"version\": 1,\n      \"inputs\"", "\"version\": 5,\n      \"inputs\"");
        let err = load_model(&text).unwrap_err();
        assert_eq!(
            err,
            GraphError::ArchiveVersion {
                node_type: "ConstantNode<integer>".into(),
                found: 5,
                current: 1,
            }
        );
    }

    #[test]
    fn forward_reference_is_rejected() {
        let text = format!(
            r#"{{"format":"{}","version":1,"nodes":[{{"id":0,"type_name":"OutputNode<real32>","version":1,"inputs":[{{"port_type":"real32","ranges":[{{"port":{{"node":3,"index":0}},"start":0,"count":1}}]}}],"state":{{}}}}]}}"#,
            FORMAT
        );
        assert!(matches!(load_model(&text), Err(GraphError::Archive(_))));
    }

    #[test]
    fn every_node_kind_round_trips() {
        let image = PortMemoryLayout::contiguous(vec![2, 2, 2]);
        let padded = PortMemoryLayout::padded(vec![2, 2, 2], 1, 2).unwrap();
        let mut model = Model::new();
        let x = model.add_node(InputNode::new(PortType::Real32, image.clone())).unwrap();
        let r = model
            .add_node(ReorderDataNode::new(whole(&model, x), image.clone(), padded.clone(), 0.5).unwrap())
            .unwrap();
        model
            .add_node(
                SimpleConvolutionNode::new(whole(&model, x), image, ConvolutionParams::new(3, 2, 2), quarters(36))
                    .unwrap(),
            )
            .unwrap();
        let w = model.add_node(ConstantNode::new(quarters(36))).unwrap();
        model
            .add_node(
                SimpleConvolutionComputeNode::new(whole(&model, r), whole(&model, w), padded, ConvolutionParams::new(3, 1, 2))
                    .unwrap(),
            )
            .unwrap();
        model.add_node(TypeCastNode::new(whole(&model, x), PortType::Real64)).unwrap();
        let a = model.add_node(ConstantNode::new(quarters(6))).unwrap();
        let b = model.add_node(ConstantNode::new(quarters(6))).unwrap();
        let mmm = model
            .add_node(MatrixMatrixMultiplyNode::new(whole(&model, a), whole(&model, b), 2, 2, 3).unwrap())
            .unwrap();
        model
            .add_node(MatrixVectorProductNode::new(whole(&model, x), 1, 8, quarters(8)).unwrap())
            .unwrap();
        model
            .add_node(DenseLayerNode::new(whole(&model, x), 2, 8, quarters(16), vec![1.0f32, -1.0]).unwrap())
            .unwrap();
        model
            .add_node(BinaryOperationNode::new(BinaryOp::Subtract, whole(&model, a), whole(&model, b)).unwrap())
            .unwrap();
        let s = model
            .add_node(SourceNode::new("read_sensor", PortType::Real32, PortMemoryLayout::flat(2)))
            .unwrap();
        model.add_node(SinkNode::new(whole(&model, s), "publish")).unwrap();
        model.add_node(OutputNode::new(whole(&model, mmm))).unwrap();

        let loaded = load_model(&save_model(&model).unwrap()).unwrap();
        assert_eq!(loaded.len(), model.len());
        for ((old_id, old), (new_id, new)) in model.iter().zip(loaded.iter()) {
            assert_eq!(old_id, new_id);
            assert_eq!(old, new, "{} differs after reload", old.type_name());
        }
    }

    #[test]
    fn version_one_convolution_defaults_stride() {
        let text = save_model(&strided_convolution()).unwrap();
        let old = edit_records(&text, "SimpleConvolutionNode<", |record| {
            record.insert("version".into(), Value::from(1));
            record["state"].as_object_mut().unwrap().remove("stride");
        });
        let loaded = load_model(&old).unwrap();
        match loaded.node(NodeId(1)).unwrap().kind() {
            NodeKind::SimpleConvolution(conv) => assert_eq!(conv.params().stride, 1),
            other => panic!("unexpected kind {:?}", other),
        }

        // from version 2 on the field is required
        let missing = edit_records(&text, "SimpleConvolutionNode<", |record| {
            record["state"].as_object_mut().unwrap().remove("stride");
        });
        assert!(matches!(load_model(&missing), Err(GraphError::Archive(_))));
    }

    #[test]
    fn newer_convolution_version_is_rejected() {
        let text = save_model(&strided_convolution()).unwrap();
        let newer = edit_records(&text, "SimpleConvolutionNode<", |record| {
            record.insert("version".into(), Value::from(3));
        });
        assert_eq!(
            load_model(&newer).unwrap_err(),
            GraphError::ArchiveVersion {
                node_type: "SimpleConvolutionNode<real32>".into(),
                found: 3,
                current: 2,
            }
        );
    }

    #[test]
    fn out_of_bounds_layout_is_rejected() {
        let mut model = Model::new();
        let x = model
            .add_node(InputNode::new(PortType::Real32, PortMemoryLayout::flat(2)))
            .unwrap();
        model
            .add_node(
                ReorderDataNode::new(whole(&model, x), PortMemoryLayout::flat(2), PortMemoryLayout::flat(2), 0.0)
                    .unwrap(),
            )
            .unwrap();
        let text = save_model(&model).unwrap();
        let corrupt = edit_records(&text, "ReorderDataNode<", |record| {
            record["state"]["output_layout"]["offset"] = Value::from(vec![5]);
        });
        assert!(matches!(load_model(&corrupt), Err(GraphError::Archive(_))));
        let corrupt = edit_records(&text, "InputNode<", |record| {
            record["state"]["layout"]["offset"] = Value::from(vec![5]);
        });
        assert!(matches!(load_model(&corrupt), Err(GraphError::Archive(_))));
    }
}
