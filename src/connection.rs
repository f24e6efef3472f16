use crate::datacube::{BoundingBox, DataCube, TemporalExtent};
use crate::discovery::{
    normalize_url, Capabilities, CollectionList, CollectionMetadata, CollectionSummary,
    ProcessList, ProcessSummary, WellKnownDocument,
};
use crate::error::{Error, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

const USER_AGENT: &str = concat!("ndvi-job/", env!("CARGO_PKG_VERSION"));

/// A session with an openEO backend. Discovery calls borrow the session
/// immutably; only authentication replaces its credential.
pub struct Connection {
    client: Client,
    root: Url,
    capabilities: Capabilities,
    bearer: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl Connection {
    pub async fn connect(address: &str) -> Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        let url = normalize_url(address)?;
        let root = resolve_api_root(&client, &url).await?;

        let response = client.get(root.clone()).send().await?;
        if !response.status().is_success() {
            return Err(Error::Connection(format!(
                "capabilities request to {} returned {}",
                root,
                response.status()
            )));
        }
        let capabilities: Capabilities = response.json().await?;
        info!(
            url = %root,
            api_version = %capabilities.api_version,
            title = capabilities.title.as_deref().unwrap_or(""),
            "Connected to backend"
        );

        Ok(Self {
            client,
            root,
            capabilities,
            bearer: None,
        })
    }

    pub fn root_url(&self) -> &Url {
        &self.root
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn is_authenticated(&self) -> bool {
        self.bearer.is_some()
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    pub(crate) fn set_bearer(&mut self, bearer: String) {
        self.bearer = Some(bearer);
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.root.join(path.trim_start_matches('/'))?)
    }

    fn with_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer {
            Some(bearer) => request.bearer_auth(bearer),
            None => request,
        }
    }

    pub(crate) fn get(&self, path: &str) -> Result<RequestBuilder> {
        Ok(self.with_auth(self.client.get(self.endpoint(path)?)))
    }

    /// GET on an absolute url. The credential is only attached when the url
    /// lies under the api root; asset hosts such as presigned storage urls
    /// never see it.
    pub(crate) fn get_url(&self, url: Url) -> RequestBuilder {
        let under_root = self.is_under_root(&url);
        let request = self.client.get(url);
        if under_root {
            self.with_auth(request)
        } else {
            request
        }
    }

    fn is_under_root(&self, url: &Url) -> bool {
        url.origin() == self.root.origin() && url.path().starts_with(self.root.path())
    }

    pub(crate) fn post(&self, path: &str) -> Result<RequestBuilder> {
        Ok(self.with_auth(self.client.post(self.endpoint(path)?)))
    }

    /// Sends the request and turns any non-success status into [`Error::Api`].
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(api_error(response).await)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(path, "GET");
        let response = self.send(self.get(path)?).await?;
        Ok(response.json().await?)
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionSummary>> {
        let list: CollectionList = self.get_json("collections").await?;
        Ok(list.collections)
    }

    pub async fn list_collection_ids(&self) -> Result<Vec<String>> {
        let ids = self
            .list_collections()
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect::<Vec<_>>();
        Ok(ids)
    }

    pub async fn describe_collection(&self, collection_id: &str) -> Result<CollectionMetadata> {
        self.get_json(&format!("collections/{}", collection_id))
            .await
    }

    pub async fn list_processes(&self) -> Result<Vec<ProcessSummary>> {
        let list: ProcessList = self.get_json("processes").await?;
        Ok(list.processes)
    }

    pub async fn list_process_ids(&self) -> Result<Vec<String>> {
        let ids = self
            .list_processes()
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect::<Vec<_>>();
        Ok(ids)
    }

    /// Starts a processing graph on this backend. Purely local.
    pub fn load_collection(
        &self,
        collection_id: &str,
        spatial_extent: &BoundingBox,
        temporal_extent: &TemporalExtent,
        bands: &[String],
    ) -> DataCube {
        DataCube::load_collection(collection_id, spatial_extent, temporal_extent, bands)
    }
}

/// Follows `/.well-known/openeo` when the backend publishes it.
async fn resolve_api_root(client: &Client, url: &Url) -> Result<Url> {
    let well_known = url.join(".well-known/openeo")?;
    let response = client.get(well_known).send().await?;
    if !response.status().is_success() {
        debug!(url = %url, status = %response.status(), "No well-known document, using url as api root");
        return Ok(url.clone());
    }

    let document = match response.json::<WellKnownDocument>().await {
        Ok(document) => document,
        Err(err) => {
            debug!(error = %err, "Unreadable well-known document, using url as api root");
            return Ok(url.clone());
        }
    };
    match document.preferred() {
        Some(version) => {
            debug!(api_version = %version.api_version, url = %version.url, "Selected api version");
            Ok(normalize_url(&version.url)?)
        }
        None => Ok(url.clone()),
    }
}

pub(crate) async fn api_error(response: Response) -> Error {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorBody>(&text) {
        Ok(body) => Error::Api {
            status,
            code: body.code.unwrap_or_else(|| "Unknown".to_string()),
            message: body.message.unwrap_or(text),
        },
        Err(_) => Error::Api {
            status,
            code: "Unknown".to_string(),
            message: text,
        },
    }
}
