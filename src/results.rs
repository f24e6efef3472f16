use crate::connection::Connection;
use crate::error::Result;
use futures_util::TryStreamExt;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use url::Url;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Asset {
    pub href: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ResultMetadata {
    #[serde(default)]
    pub assets: BTreeMap<String, Asset>,
}

/// Output artifacts of a finished job.
pub struct JobResults<'a> {
    connection: &'a Connection,
    url: Url,
    metadata: ResultMetadata,
}

impl<'a> JobResults<'a> {
    pub(crate) fn new(connection: &'a Connection, url: Url, metadata: ResultMetadata) -> Self {
        Self {
            connection,
            url,
            metadata,
        }
    }

    pub fn assets(&self) -> &BTreeMap<String, Asset> {
        &self.metadata.assets
    }

    /// Downloads every asset into `dir`, named after its asset key.
    pub async fn download_files<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        if self.metadata.assets.is_empty() {
            warn!(url = %self.url, "Job produced no assets");
        }

        let mut written = Vec::with_capacity(self.metadata.assets.len());
        for (name, asset) in self.metadata.assets.iter() {
            let output = dir.join(local_file_name(name));
            self.download_asset(asset, &output).await?;
            written.push(output);
        }
        Ok(written)
    }

    async fn download_asset(&self, asset: &Asset, output: &Path) -> Result<()> {
        let source = self.url.join(&asset.href)?;
        info!(source = %source, output = %output.display(), "Downloading asset");

        let request = self.connection.get_url(source);
        let response = self.connection.send(request).await?;

        // Stream into a sibling .partial file, renamed once complete
        let partial = partial_path(output);
        let byte_count = match write_partial(response, &partial).await {
            Ok(count) => count,
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&partial) {
                    warn!(path = %partial.display(), error = %cleanup, "Unable to remove partial download");
                }
                return Err(err);
            }
        };

        fs::rename(&partial, output)?;
        info!(output = %output.display(), bytes = byte_count, "Download complete");
        Ok(())
    }
}

async fn write_partial(response: Response, partial: &Path) -> Result<u64> {
    let mut partial_file = File::create(partial)?;
    let mut stream = response.bytes_stream();
    let mut byte_count = 0_u64;
    while let Some(bytes) = stream.try_next().await? {
        partial_file.write_all(&bytes)?;
        byte_count += bytes.len() as u64;
    }
    partial_file.flush()?;
    Ok(byte_count)
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Asset keys may look like paths; only the last component is used.
fn local_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("asset")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::mock_backend;
    use crate::error::Error;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_local_file_name() {
        assert_eq!(local_file_name("openEO.tif"), "openEO.tif");
        assert_eq!(local_file_name("../../etc/passwd"), "passwd");
        assert_eq!(local_file_name(".."), "asset");
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/tmp/out/openEO.tif")),
            PathBuf::from("/tmp/out/openEO.tif.partial")
        );
    }

    #[tokio::test]
    async fn test_download_files() {
        let server = mock_backend().await;
        Mock::given(method("GET"))
            .and(path("/jobs/j-1/results"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": "Feature",
                "assets": {
                    "openEO.tif": {
                        "href": format!("{}/download/j-1/openEO.tif", server.uri()),
                        "type": "image/tiff; application=geotiff"
                    },
                    "log.txt": {"href": "download/j-1/log.txt"}
                }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/download/j-1/openEO.tif"))
            .and(header("authorization", "Bearer basic//token"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"II*\0tiff".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs/j-1/download/j-1/log.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("done"))
            .expect(1)
            .mount(&server)
            .await;

        let mut connection = Connection::connect(&server.uri()).await.unwrap();
        connection.set_bearer("basic//token".to_string());
        let results = connection.job("j-1").get_results().await.unwrap();
        assert_eq!(results.assets().len(), 2);

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("results");
        let written = results.download_files(&out).await.unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(fs::read(out.join("openEO.tif")).unwrap(), b"II*\0tiff");
        assert_eq!(fs::read_to_string(out.join("log.txt")).unwrap(), "done");
        assert!(!out.join("openEO.tif.partial").exists());
    }

    #[tokio::test]
    async fn test_failed_asset_leaves_no_file() {
        let server = mock_backend().await;
        Mock::given(method("GET"))
            .and(path("/jobs/j-1/results"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "assets": {"openEO.tif": {"href": format!("{}/gone.tif", server.uri())}}
            })))
            .mount(&server)
            .await;

        let mut connection = Connection::connect(&server.uri()).await.unwrap();
        connection.set_bearer("basic//token".to_string());
        let results = connection.job("j-1").get_results().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let err = results.download_files(dir.path()).await.err().unwrap();
        assert!(matches!(err, Error::Api { status: 404, .. }), "got {:?}", err);
        assert!(!dir.path().join("openEO.tif").exists());
    }

    #[tokio::test]
    async fn test_storage_host_gets_no_credential() {
        let server = mock_backend().await;
        let storage = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs/j-1/results"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "assets": {"openEO.tif": {"href": format!("{}/bucket/openEO.tif?sig=abc", storage.uri())}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bucket/openEO.tif"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tiff".to_vec()))
            .expect(1)
            .mount(&storage)
            .await;

        let mut connection = Connection::connect(&server.uri()).await.unwrap();
        connection.set_bearer("oidc/egi/access".to_string());
        let results = connection.job("j-1").get_results().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        results.download_files(dir.path()).await.unwrap();
        assert_eq!(fs::read(dir.path().join("openEO.tif")).unwrap(), b"tiff");

        let requests = storage.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn test_broken_stream_removes_partial_file() {
        let server = mock_backend().await;
        Mock::given(method("GET"))
            .and(path("/jobs/j-1/results"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "assets": {"openEO.tif": {"href": "openEO.tif"}}
            })))
            .mount(&server)
            .await;
        // Announces more bytes than it sends, so the body stream fails
        Mock::given(method("GET"))
            .and(path("/jobs/j-1/openEO.tif"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "1024")
                    .set_body_bytes(b"II*\0".to_vec()),
            )
            .mount(&server)
            .await;

        let connection = Connection::connect(&server.uri()).await.unwrap();
        let results = connection.job("j-1").get_results().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let err = results.download_files(dir.path()).await.err().unwrap();
        assert!(matches!(err, Error::Connection(_)), "got {:?}", err);
        assert!(!dir.path().join("openEO.tif").exists());
        assert!(!dir.path().join("openEO.tif.partial").exists());
    }
}
