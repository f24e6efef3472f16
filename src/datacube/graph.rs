use super::{Argument, DataCube, ProcessNode};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct FlatNode {
    pub process_id: String,
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub result: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The openEO "flat" process graph: node id -> node, references expressed as
/// `{"from_node": id}`, exactly one node flagged as `result`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(transparent)]
pub struct FlatGraph {
    nodes: BTreeMap<String, FlatNode>,
}

impl FlatGraph {
    pub fn from_cube(cube: &DataCube) -> Self {
        let mut flattener = Flattener::default();
        let result_id = flattener.visit(cube);
        if let Some(node) = flattener.nodes.get_mut(&result_id) {
            node.result = true;
        }
        Self {
            nodes: flattener.nodes,
        }
    }

    pub fn nodes(&self) -> &BTreeMap<String, FlatNode> {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&FlatNode> {
        self.nodes.get(id)
    }

    pub fn result_node_id(&self) -> Option<&str> {
        self.nodes
            .iter()
            .find(|(_, node)| node.result)
            .map(|(id, _)| id.as_str())
    }

    pub fn to_value(&self) -> Value {
        json!(self)
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let graph: Self = serde_json::from_str(&content).map_err(std::io::Error::from)?;
        Ok(graph)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(std::io::Error::from)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Default)]
struct Flattener {
    ids: HashMap<*const ProcessNode, String>,
    counters: HashMap<String, usize>,
    nodes: BTreeMap<String, FlatNode>,
}

impl Flattener {
    fn visit(&mut self, cube: &DataCube) -> String {
        if let Some(id) = self.ids.get(&cube.node_ptr()) {
            return id.clone();
        }

        let node = cube.node();
        let arguments = node
            .arguments()
            .iter()
            .map(|(name, argument)| (name.clone(), self.argument(argument)))
            .collect::<Map<_, _>>();

        let id = self.next_id(node.process_id());
        self.ids.insert(cube.node_ptr(), id.clone());
        self.nodes.insert(
            id.clone(),
            FlatNode {
                process_id: node.process_id().to_string(),
                arguments,
                result: false,
            },
        );
        id
    }

    fn argument(&mut self, argument: &Argument) -> Value {
        match argument {
            Argument::Value(value) => value.clone(),
            Argument::Cube(cube) => json!({ "from_node": self.visit(cube) }),
            Argument::Parameter(name) => json!({ "from_parameter": name }),
            // Child graphs get their own id namespace.
            Argument::Callback(cube) => json!({ "process_graph": FlatGraph::from_cube(cube) }),
        }
    }

    fn next_id(&mut self, process_id: &str) -> String {
        let counter = self.counters.entry(process_id.to_string()).or_insert(0);
        *counter += 1;
        format!("{}{}", process_id.replace('_', ""), counter)
    }
}
