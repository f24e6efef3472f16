//! Immutable builder for server-side processing graphs.
//!
//! A [`DataCube`] is a handle to the result node of a process graph. Every
//! builder method returns a new cube whose node wraps the previous one, so a
//! cube can be cloned and branched freely. Nothing is executed locally: the
//! graph is only flattened to JSON when a job is created.
mod graph;

pub use graph::FlatGraph;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<String>,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
            crs: None,
        }
    }

    pub fn with_crs(self, crs: &str) -> Self {
        Self {
            crs: Some(crs.to_string()),
            ..self
        }
    }
}

/// Closed date interval, serialized the openEO way as `[start, end]`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TemporalExtent {
    pub start: String,
    pub end: String,
}

impl TemporalExtent {
    pub fn new(start: &str, end: &str) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
        }
    }
}

/// A value passed to a process.
#[derive(Clone, Debug, PartialEq)]
pub enum Argument {
    Value(Value),
    /// Output of another node in the same graph.
    Cube(DataCube),
    /// Reference to a parameter of the enclosing callback.
    Parameter(String),
    /// Child process graph, e.g. a reducer.
    Callback(DataCube),
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Value(value)
    }
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Argument::Value(Value::String(value.to_string()))
    }
}

impl From<String> for Argument {
    fn from(value: String) -> Self {
        Argument::Value(Value::String(value))
    }
}

impl From<&DataCube> for Argument {
    fn from(cube: &DataCube) -> Self {
        Argument::Cube(cube.clone())
    }
}

impl From<DataCube> for Argument {
    fn from(cube: DataCube) -> Self {
        Argument::Cube(cube)
    }
}

#[derive(Debug, PartialEq)]
pub struct ProcessNode {
    process_id: String,
    arguments: BTreeMap<String, Argument>,
}

impl ProcessNode {
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn arguments(&self) -> &BTreeMap<String, Argument> {
        &self.arguments
    }

    pub fn argument(&self, name: &str) -> Option<&Argument> {
        self.arguments.get(name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataCube {
    node: Arc<ProcessNode>,
}

impl DataCube {
    /// Starts a graph from a single process with no data input.
    pub fn from_process<I, K>(process_id: &str, arguments: I) -> Self
    where
        I: IntoIterator<Item = (K, Argument)>,
        K: Into<String>,
    {
        let arguments = arguments
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<BTreeMap<_, _>>();
        Self {
            node: Arc::new(ProcessNode {
                process_id: process_id.to_string(),
                arguments,
            }),
        }
    }

    pub fn load_collection(
        collection_id: &str,
        spatial_extent: &BoundingBox,
        temporal_extent: &TemporalExtent,
        bands: &[String],
    ) -> Self {
        Self::from_process(
            "load_collection",
            [
                ("id", Argument::from(collection_id)),
                ("spatial_extent", Argument::Value(json!(spatial_extent))),
                (
                    "temporal_extent",
                    Argument::Value(json!([temporal_extent.start, temporal_extent.end])),
                ),
                ("bands", Argument::Value(json!(bands))),
            ],
        )
    }

    /// Generic process invocation. `arguments` decides where the current cube
    /// goes; pass `Argument::from(&cube)` to feed it in.
    pub fn process<I, K>(&self, process_id: &str, arguments: I) -> Self
    where
        I: IntoIterator<Item = (K, Argument)>,
        K: Into<String>,
    {
        Self::from_process(process_id, arguments)
    }

    pub fn ndvi(&self, nir: &str, red: &str, target_band: Option<&str>) -> Self {
        let mut arguments = vec![
            ("data", Argument::from(self)),
            ("nir", Argument::from(nir)),
            ("red", Argument::from(red)),
        ];
        if let Some(target_band) = target_band {
            arguments.push(("target_band", Argument::from(target_band)));
        }
        self.process("ndvi", arguments)
    }

    /// Reduces `dimension` with a single-process reducer such as `max` or `mean`.
    pub fn reduce_dimension(&self, reducer: &str, dimension: &str) -> Self {
        let callback = Self::from_process(
            reducer,
            [("data", Argument::Parameter("data".to_string()))],
        );
        self.process(
            "reduce_dimension",
            [
                ("data", Argument::from(self)),
                ("reducer", Argument::Callback(callback)),
                ("dimension", Argument::from(dimension)),
            ],
        )
    }

    pub fn save_result(&self, format: &str, options: Map<String, Value>) -> Self {
        self.process(
            "save_result",
            [
                ("data", Argument::from(self)),
                ("format", Argument::from(format)),
                ("options", Argument::Value(Value::Object(options))),
            ],
        )
    }

    pub fn node(&self) -> &ProcessNode {
        &self.node
    }

    pub fn flat_graph(&self) -> FlatGraph {
        FlatGraph::from_cube(self)
    }

    pub(crate) fn node_ptr(&self) -> *const ProcessNode {
        Arc::as_ptr(&self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bands() -> Vec<String> {
        vec!["B04".to_string(), "B08".to_string()]
    }

    fn loaded() -> DataCube {
        DataCube::load_collection(
            "SENTINEL2_L2A",
            &BoundingBox::new(7.5, 50.1, 8.5, 51.1),
            &TemporalExtent::new("2021-01-01", "2021-01-31"),
            &bands(),
        )
    }

    #[test]
    fn test_load_collection_keeps_arguments() {
        let cube = loaded();
        let node = cube.node();
        assert_eq!(node.process_id(), "load_collection");
        assert_eq!(
            node.argument("spatial_extent"),
            Some(&Argument::Value(
                json!({"west": 7.5, "south": 50.1, "east": 8.5, "north": 51.1})
            ))
        );
        assert_eq!(
            node.argument("temporal_extent"),
            Some(&Argument::Value(json!(["2021-01-01", "2021-01-31"])))
        );
        assert_eq!(
            node.argument("bands"),
            Some(&Argument::Value(json!(["B04", "B08"])))
        );
    }

    #[test]
    fn test_ndvi_convenience_matches_generic_process() {
        let cube = loaded();
        let convenience = cube.ndvi("B08", "B04", None);
        let generic = cube.process(
            "ndvi",
            [
                ("data", Argument::from(&cube)),
                ("nir", Argument::from("B08")),
                ("red", Argument::from("B04")),
            ],
        );
        assert_eq!(convenience, generic);
        assert_eq!(convenience.flat_graph(), generic.flat_graph());
    }

    #[test]
    fn test_builder_does_not_mutate_previous_cube() {
        let cube = loaded();
        let _ = cube.ndvi("B08", "B04", None).reduce_dimension("max", "t");
        assert_eq!(cube.node().process_id(), "load_collection");
    }

    #[test]
    fn test_reduction_wraps_ndvi() {
        let ndvi = loaded().ndvi("B08", "B04", None);
        let reduced = ndvi.reduce_dimension("max", "t");
        match reduced.node().argument("data") {
            Some(Argument::Cube(inner)) => assert_eq!(inner, &ndvi),
            other => panic!("Unexpected data argument: {:?}", other),
        }
        match reduced.node().argument("reducer") {
            Some(Argument::Callback(callback)) => {
                assert_eq!(callback.node().process_id(), "max")
            }
            other => panic!("Unexpected reducer argument: {:?}", other),
        }
    }

    #[test]
    fn test_bbox_crs_is_serialized_only_when_set() {
        let bbox = BoundingBox::new(7.5, 50.1, 8.5, 51.1);
        assert!(json!(bbox).get("crs").is_none());
        let bbox = bbox.with_crs("EPSG:4326");
        assert_eq!(json!(bbox)["crs"], json!("EPSG:4326"));
    }

    #[test]
    fn test_target_band_is_optional() {
        let cube = loaded().ndvi("B08", "B04", Some("NDVI"));
        assert_eq!(
            cube.node().argument("target_band"),
            Some(&Argument::from("NDVI"))
        );
    }
}
