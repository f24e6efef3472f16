//! Response documents of the side-effect-free discovery endpoints.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct WellKnownDocument {
    pub versions: Vec<ApiVersion>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ApiVersion {
    pub url: String,
    pub api_version: String,
    #[serde(default)]
    pub production: bool,
}

impl WellKnownDocument {
    /// Highest production version, or the highest of all if none is
    /// flagged as production.
    pub fn preferred(&self) -> Option<&ApiVersion> {
        let production = self
            .versions
            .iter()
            .filter(|v| v.production)
            .max_by(|a, b| compare_versions(&a.api_version, &b.api_version));
        production.or_else(|| {
            self.versions
                .iter()
                .max_by(|a, b| compare_versions(&a.api_version, &b.api_version))
        })
    }
}

fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| {
        v.split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect::<Vec<_>>()
    };
    parse(a).cmp(&parse(b))
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Capabilities {
    pub api_version: String,
    #[serde(default)]
    pub backend_version: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Endpoint {
    pub path: String,
    pub methods: Vec<String>,
}

impl Capabilities {
    pub fn supports(&self, method: &str, path: &str) -> bool {
        self.endpoints
            .iter()
            .any(|e| e.path == path && e.methods.iter().any(|m| m.eq_ignore_ascii_case(method)))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct CollectionSummary {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct CollectionList {
    pub collections: Vec<CollectionSummary>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ProcessSummary {
    pub id: String,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ProcessList {
    pub processes: Vec<ProcessSummary>,
}

/// Full collection metadata as returned by the backend.
pub type CollectionMetadata = Value;

/// Turns a bare host such as `openeo.cloud` into `https://openeo.cloud/`.
pub fn normalize_url(address: &str) -> Result<Url, url::ParseError> {
    let address = address.trim();
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("https://{}", address)
    };
    let mut url = Url::parse(&with_scheme)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
