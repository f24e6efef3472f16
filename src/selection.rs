//! The TOML selection file describing what to process and where.
use crate::connection::Connection;
use crate::datacube::{BoundingBox, DataCube, TemporalExtent};
use crate::error::{Error, Result};
use crate::job::PollSettings;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Selection {
    pub id: String,
    pub name: String,
    pub description: String,
    pub backend: String,
    #[serde(default)]
    pub list_collections: bool,
    pub collection: String,
    pub bands: Vec<String>,
    pub spatial_extent: BoundingBox,
    pub temporal_extent: TemporalExtent,
    pub ndvi: NdviStep,
    pub reduce: ReduceStep,
    pub export: ExportStep,
    #[serde(default)]
    pub job: JobStep,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct NdviStep {
    pub nir: String,
    pub red: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_band: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ReduceStep {
    pub reducer: String,
    pub dimension: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ExportStep {
    pub format: String,
    #[serde(default)]
    pub options: Map<String, serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct JobStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Seconds between the first status polls.
    #[serde(default = "default_poll_interval", with = "secs")]
    pub poll_interval: Duration,
    /// Upper bound the poll interval grows to.
    #[serde(default = "default_max_poll_interval", with = "secs")]
    pub max_poll_interval: Duration,
}

impl Default for JobStep {
    fn default() -> Self {
        Self {
            title: None,
            poll_interval: default_poll_interval(),
            max_poll_interval: default_max_poll_interval(),
        }
    }
}

impl JobStep {
    pub fn poll(&self) -> PollSettings {
        PollSettings {
            initial_interval: self.poll_interval,
            max_interval: self.max_poll_interval.max(self.poll_interval),
        }
    }
}

fn default_poll_interval() -> Duration {
    PollSettings::default().initial_interval
}

fn default_max_poll_interval() -> Duration {
    PollSettings::default().max_interval
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Values given on the command line win over the selection file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub backend: Option<String>,
    pub spatial_extent: Option<BoundingBox>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub bands: Option<Vec<String>>,
    pub reducer: Option<String>,
    pub format: Option<String>,
}

pub fn template() -> toml::Table {
    toml::toml! {
        id = "openeo.sentinel2.ndvi-max"

        name = "Maximum NDVI over January 2021"

        description = "Loads Sentinel-2 Level 2A red and near-infrared bands, computes the\n\
        Normalized Difference Vegetation Index on the backend, keeps the per-pixel\n\
        maximum over time and exports the result as a GeoTIFF."

        backend = "openeo.cloud"

        list_collections = true

        collection = "SENTINEL2_L2A"

        bands = ["B04", "B08"]

        [spatial_extent]
        west = 7.5
        south = 50.1
        east = 8.5
        north = 51.1

        [temporal_extent]
        start = "2021-01-01"
        end = "2021-01-31"

        [ndvi]
        nir = "B08"
        red = "B04"

        [reduce]
        reducer = "max"
        dimension = "t"

        [export]
        format = "GTiff"

        [job]
        title = "NDVI max"
        poll_interval = 5.0
        max_poll_interval = 60.0
    }
}

impl Selection {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let selection: Self =
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        Ok(selection)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Result<Self> {
        let selection: Self =
            toml::from_str(&table.to_string()).map_err(|e| Error::Config(e.to_string()))?;
        Ok(selection)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(backend) = overrides.backend {
            self.backend = backend;
        }
        if let Some(extent) = overrides.spatial_extent {
            self.spatial_extent = extent;
        }
        if let Some(start) = overrides.start {
            self.temporal_extent.start = start;
        }
        if let Some(end) = overrides.end {
            self.temporal_extent.end = end;
        }
        if let Some(bands) = overrides.bands {
            self.bands = bands;
        }
        if let Some(reducer) = overrides.reducer {
            self.reduce.reducer = reducer;
        }
        if let Some(format) = overrides.format {
            self.export.format = format;
        }
    }

    /// Local sanity checks. Band and process names are left to the backend.
    pub fn validate(&self) -> Result<()> {
        let extent = &self.spatial_extent;
        check_finite(extent)?;
        if extent.west >= extent.east {
            return Err(Error::Config(format!(
                "west ({}) must be less than east ({})",
                extent.west, extent.east
            )));
        }
        if extent.south >= extent.north {
            return Err(Error::Config(format!(
                "south ({}) must be less than north ({})",
                extent.south, extent.north
            )));
        }

        let start = parse_date(&self.temporal_extent.start)?;
        let end = parse_date(&self.temporal_extent.end)?;
        if start > end {
            return Err(Error::Config(format!(
                "temporal extent starts ({}) after it ends ({})",
                start, end
            )));
        }

        if self.bands.is_empty() {
            return Err(Error::Config("at least one band is required".to_string()));
        }

        // A zero interval would poll the backend in a tight loop
        if self.job.poll_interval.is_zero() {
            return Err(Error::Config(
                "job.poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// load_collection -> ndvi -> reduce_dimension -> save_result
    pub fn build_cube(&self, connection: &Connection) -> DataCube {
        self.chain(connection.load_collection(
            &self.collection,
            &self.spatial_extent,
            &self.temporal_extent,
            &self.bands,
        ))
    }

    fn chain(&self, cube: DataCube) -> DataCube {
        cube.ndvi(&self.ndvi.nir, &self.ndvi.red, self.ndvi.target_band.as_deref())
            .reduce_dimension(&self.reduce.reducer, &self.reduce.dimension)
            .save_result(&self.export.format, self.export.options.clone())
    }
}

fn check_finite(extent: &BoundingBox) -> Result<()> {
    let values = [extent.west, extent.south, extent.east, extent.north];
    if values.iter().all(|v| v.is_finite()) {
        return Ok(());
    }
    Err(Error::Config(format!(
        "spatial extent must be finite numbers, got {:?}",
        values
    )))
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| Error::Config(format!("invalid date '{}': {}", value, e)))
}

/// Parses `W,S,E,N` in degrees.
pub fn parse_bbox(value: &str) -> std::result::Result<BoundingBox, String> {
    let parts = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid coordinate in '{}': {}", value, e))?;
    if let Some(bad) = parts.iter().find(|p| !p.is_finite()) {
        return Err(format!("invalid coordinate in '{}': {} is not finite", value, bad));
    }
    match parts.as_slice() {
        [west, south, east, north] => Ok(BoundingBox::new(*west, *south, *east, *north)),
        _ => Err(format!(
            "expected 4 comma separated values (west,south,east,north), got {}",
            parts.len()
        )),
    }
}
