use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ndvi_job::auth::{Credentials, OidcOptions};
use ndvi_job::selection::{self, parse_bbox, Overrides, Selection};
use ndvi_job::{BoundingBox, Connection};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Runs a maximum-NDVI batch job on an openEO backend and downloads the result.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Selection file; the built-in template is used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend url, overrides the selection file
    #[arg(short, long, global = true, env = "OPENEO_BACKEND_URL")]
    backend: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit the job, wait for it and download the results
    Run(RunArgs),
    /// List the collection ids offered by the backend
    Collections,
    /// Print the metadata document of one collection
    Collection { id: String },
    /// List the process ids offered by the backend
    Processes,
    /// Write the default selection file
    Template { path: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Bounding box as west,south,east,north in degrees
    #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true)]
    bbox: Option<BoundingBox>,

    /// First day, YYYY-MM-DD
    #[arg(long)]
    start: Option<String>,

    /// Last day, YYYY-MM-DD
    #[arg(long)]
    end: Option<String>,

    /// Comma separated band names
    #[arg(long, value_delimiter = ',')]
    bands: Option<Vec<String>>,

    /// Reducer applied over time
    #[arg(long)]
    reducer: Option<String>,

    /// Export format
    #[arg(long)]
    format: Option<String>,

    /// Directory the results are written to
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Use HTTP basic authentication instead of OIDC
    #[arg(long, env = "OPENEO_USERNAME", requires = "password")]
    username: Option<String>,

    #[arg(long, env = "OPENEO_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ndvi_job=info")))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn load_selection(cli: &Cli) -> Result<Selection> {
    let mut selection = match &cli.config {
        Some(path) => Selection::read(path)
            .with_context(|| format!("Unable to read selection file {}", path.display()))?,
        None => Selection::from_template(&selection::template())?,
    };
    if let Some(backend) = &cli.backend {
        selection.backend = backend.clone();
    }
    Ok(selection)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match &cli.command {
        Command::Template { path } => {
            let selection = Selection::from_template(&selection::template())?;
            selection.write(path)?;
            println!("Selection template written to {}", path.display());
        }
        Command::Collections => {
            let selection = load_selection(&cli)?;
            let connection = Connection::connect(&selection.backend).await?;
            for id in connection.list_collection_ids().await? {
                println!("{}", id);
            }
        }
        Command::Collection { id } => {
            let selection = load_selection(&cli)?;
            let connection = Connection::connect(&selection.backend).await?;
            let metadata = connection.describe_collection(id).await?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        Command::Processes => {
            let selection = load_selection(&cli)?;
            let connection = Connection::connect(&selection.backend).await?;
            for id in connection.list_process_ids().await? {
                println!("{}", id);
            }
        }
        Command::Run(args) => {
            let mut selection = load_selection(&cli)?;
            selection.apply(Overrides {
                backend: None,
                spatial_extent: args.bbox.clone(),
                start: args.start.clone(),
                end: args.end.clone(),
                bands: args.bands.clone(),
                reducer: args.reducer.clone(),
                format: args.format.clone(),
            });

            let credentials = match (&args.username, &args.password) {
                (Some(username), Some(password)) => Credentials::Basic {
                    username: username.clone(),
                    password: password.clone(),
                },
                _ => Credentials::Oidc(OidcOptions::from_env()?),
            };

            let summary = ndvi_job::workflow::run(&selection, &credentials, &args.output)
                .await
                .context("NDVI job failed")?;
            for file in summary.files.iter() {
                println!("{}", file.display());
            }
        }
    }

    Ok(())
}
