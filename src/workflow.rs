//! The end-to-end run: connect, build, authenticate, submit, wait, download.
use crate::auth::Credentials;
use crate::connection::Connection;
use crate::error::Result;
use crate::selection::Selection;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const PROCESS_GRAPH_FILE: &str = "process_graph.json";

#[derive(Debug)]
pub struct RunSummary {
    pub job_id: String,
    pub files: Vec<PathBuf>,
}

pub async fn run(
    selection: &Selection,
    credentials: &Credentials,
    output_dir: &Path,
) -> Result<RunSummary> {
    selection.validate()?;

    let mut connection = Connection::connect(&selection.backend).await?;

    if selection.list_collections {
        let ids = connection.list_collection_ids().await?;
        info!(count = ids.len(), collections = ?ids, "Available collections");
    }

    let cube = selection.build_cube(&connection);

    if !output_dir.exists() {
        fs::create_dir_all(output_dir)?;
    }
    cube.flat_graph()
        .write(output_dir.join(PROCESS_GRAPH_FILE))?;

    connection.authenticate(credentials).await?;

    let job = connection
        .create_job(&cube, selection.job.title.as_deref())
        .await?;
    job.start_and_wait(&selection.job.poll()).await?;

    let results = job.get_results().await?;
    let files = results.download_files(output_dir).await?;
    info!(job_id = %job.id(), files = files.len(), "Run complete");

    Ok(RunSummary {
        job_id: job.id().to_string(),
        files,
    })
}
