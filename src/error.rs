use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unable to reach backend: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Process graph rejected by backend [{code}]: {message}")]
    GraphValidation { code: String, message: String },

    #[error("Job {job_id} ended with status '{status}'{}", format_logs(.logs))]
    JobExecution {
        job_id: String,
        status: String,
        logs: Vec<String>,
    },

    #[error("Backend responded with {status} [{code}]: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Connection(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Connection(format!("invalid url: {}", err))
    }
}

fn format_logs(logs: &[String]) -> String {
    if logs.is_empty() {
        return String::new();
    }
    format!(":\n  {}", logs.join("\n  "))
}
