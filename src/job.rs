use crate::connection::Connection;
use crate::datacube::DataCube;
use crate::error::{Error, Result};
use crate::results::JobResults;
use reqwest::header::LOCATION;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

const IDENTIFIER_HEADER: &str = "openeo-identifier";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    Canceled,
    Finished,
    Error,
    /// Any status outside the openEO set; polled like a running job.
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Finished | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Canceled => "canceled",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct JobDescription {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f64>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct LogEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub level: String,
    pub message: String,
}

#[derive(Deserialize, Debug)]
struct LogList {
    logs: Vec<LogEntry>,
}

/// Status polling cadence: starts at `initial_interval` and grows by a
/// quarter per poll up to `max_interval`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PollSettings {
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
        }
    }
}

impl PollSettings {
    pub fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(1.25).min(self.max_interval)
    }
}

impl Connection {
    /// Registers the cube's graph as a batch job. Requires an authenticated
    /// session; without one nothing is sent.
    pub async fn create_job(&self, cube: &DataCube, title: Option<&str>) -> Result<BatchJob<'_>> {
        if !self.is_authenticated() {
            return Err(Error::Authentication(
                "job creation requires an authenticated session".to_string(),
            ));
        }

        if !self.capabilities().endpoints.is_empty()
            && !self.capabilities().supports("POST", "/jobs")
        {
            warn!(url = %self.root_url(), "Backend does not advertise POST /jobs");
        }

        let mut body = json!({ "process": { "process_graph": cube.flat_graph() } });
        if let Some(title) = title {
            body["title"] = json!(title);
        }

        let response = self.post("jobs")?.json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(job_creation_error(status, crate::connection::api_error(response).await));
        }

        let id = job_id_from_headers(response.headers()).ok_or_else(|| Error::Api {
            status: status.as_u16(),
            code: "MissingIdentifier".to_string(),
            message: "job created but backend did not return its id".to_string(),
        })?;
        info!(job_id = %id, "Created job");
        Ok(BatchJob::new(self, &id))
    }

    /// Handle on an existing job.
    pub fn job(&self, job_id: &str) -> BatchJob<'_> {
        BatchJob::new(self, job_id)
    }
}

fn job_creation_error(status: StatusCode, err: Error) -> Error {
    match (status, err) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, Error::Api { message, .. }) => {
            Error::Authentication(message)
        }
        (s, Error::Api { code, message, .. }) if s.is_client_error() => {
            Error::GraphValidation { code, message }
        }
        (_, err) => err,
    }
}

fn job_id_from_headers(headers: &reqwest::header::HeaderMap) -> Option<String> {
    if let Some(id) = headers.get(IDENTIFIER_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(id.to_string());
    }
    let location = headers.get(LOCATION)?.to_str().ok()?;
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

pub struct BatchJob<'a> {
    connection: &'a Connection,
    id: String,
}

impl<'a> BatchJob<'a> {
    fn new(connection: &'a Connection, id: &str) -> Self {
        Self {
            connection,
            id: id.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn describe(&self) -> Result<JobDescription> {
        self.connection
            .get_json(&format!("jobs/{}", self.id))
            .await
    }

    pub async fn status(&self) -> Result<JobStatus> {
        Ok(self.describe().await?.status)
    }

    pub async fn start(&self) -> Result<()> {
        let request = self.connection.post(&format!("jobs/{}/results", self.id))?;
        self.connection.send(request).await?;
        info!(job_id = %self.id, "Started job");
        Ok(())
    }

    /// Error-level log entries. Best effort: an unreadable log yields nothing.
    pub async fn error_logs(&self) -> Vec<LogEntry> {
        let request = match self.connection.get(&format!("jobs/{}/logs", self.id)) {
            Ok(request) => request.query(&[("level", "error")]),
            Err(_) => return Vec::new(),
        };
        let logs = match self.connection.send(request).await {
            Ok(response) => response.json::<LogList>().await.map(|l| l.logs),
            Err(err) => {
                warn!(job_id = %self.id, error = %err, "Unable to fetch job logs");
                return Vec::new();
            }
        };
        match logs {
            Ok(logs) => logs.into_iter().filter(|l| l.level == "error").collect(),
            Err(err) => {
                warn!(job_id = %self.id, error = %err, "Unreadable job logs");
                Vec::new()
            }
        }
    }

    /// Starts the job and polls until it reaches a terminal status. There is
    /// no local timeout.
    pub async fn start_and_wait(&self, poll: &PollSettings) -> Result<()> {
        self.start().await?;

        let mut interval = poll.initial_interval;
        let mut last_status = None;
        loop {
            let description = self.describe().await?;
            if last_status != Some(description.status) {
                info!(job_id = %self.id, status = %description.status, "Job status changed");
                last_status = Some(description.status);
            } else {
                debug!(job_id = %self.id, status = %description.status, progress = ?description.progress, "Polled job");
            }

            match description.status {
                JobStatus::Finished => return Ok(()),
                JobStatus::Error | JobStatus::Canceled => {
                    let logs = self
                        .error_logs()
                        .await
                        .into_iter()
                        .map(|l| l.message)
                        .collect::<Vec<_>>();
                    return Err(Error::JobExecution {
                        job_id: self.id.clone(),
                        status: description.status.to_string(),
                        logs,
                    });
                }
                _ => {}
            }

            tokio::time::sleep(interval).await;
            interval = poll.next_interval(interval);
        }
    }

    pub async fn get_results(&self) -> Result<JobResults<'a>> {
        let path = format!("jobs/{}/results", self.id);
        let url = self.connection.endpoint(&path)?;
        let response = match self.connection.send(self.connection.get(&path)?).await {
            Ok(response) => response,
            Err(Error::Api { code, message, .. }) => {
                let status = match self.status().await {
                    Ok(status) => status,
                    Err(err) => {
                        warn!(job_id = %self.id, error = %err, "Unable to fetch job status");
                        JobStatus::Unknown
                    }
                };
                return Err(Error::JobExecution {
                    job_id: self.id.clone(),
                    status: status.to_string(),
                    logs: vec![format!("[{}] {}", code, message)],
                });
            }
            Err(err) => return Err(err),
        };
        let metadata = response.json().await?;
        Ok(JobResults::new(self.connection, url, metadata))
    }
}
