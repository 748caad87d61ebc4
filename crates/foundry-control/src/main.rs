//! Foundry command-line interface.
//!
//! Runs the generation pipeline for one request and prints the result as
//! JSON on stdout. Logs and progress go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use foundry_control::{ControlConfig, ControlService, DeploymentId};

#[derive(Parser)]
#[command(name = "foundry")]
#[command(about = "Generate and deploy services from a description")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./foundry.toml)
    #[arg(short, long, env = "FOUNDRY_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate, build and start a service
    Generate {
        /// What the service should do
        description: String,

        /// Regenerate this existing deployment instead of creating a new one
        #[arg(long, value_name = "ID")]
        redeploy: Option<String>,
    },

    /// Show how a description would be classified
    Classify {
        /// Text to classify
        text: String,
    },

    /// List available templates
    Templates,

    /// List deployments, newest first
    List,

    /// Show deployment and task counts
    Stats,

    /// Stop a deployment and release its port
    Teardown {
        /// Deployment ID
        id: String,
    },

    /// Tear down a deployment if needed and delete its record
    Remove {
        /// Deployment ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("foundry_control=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ControlConfig::from_file(path)?,
        None => ControlConfig::load()?,
    };
    info!(
        ports = %format!("{}-{}", config.ports.start, config.ports.end),
        runtime = ?config.runtime.kind,
        database = config.database.url.is_some(),
        "configuration loaded"
    );

    let service = ControlService::new(config);
    let pipeline = service.start().await?;

    let succeeded = match cli.command {
        Commands::Generate {
            description,
            redeploy,
        } => {
            let task = match redeploy {
                Some(id) => pipeline.submit_redeploy(DeploymentId::new(id), description),
                None => pipeline.submit(description),
            };

            let mut events = pipeline.subscribe(&task)?;
            let printer = tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    eprintln!("[{:>3}%] {}: {}", event.progress, event.phase, event.message);
                }
            });

            let outcome = tokio::select! {
                outcome = pipeline.wait(&task) => outcome?,
                () = service.wait_for_shutdown() => {
                    pipeline.cancel(&task)?;
                    pipeline.wait(&task).await?
                }
            };
            let _ = printer.await;

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            outcome.is_success()
        }
        Commands::Classify { text } => {
            println!("{}", serde_json::to_string_pretty(&pipeline.classify(&text))?);
            true
        }
        Commands::Templates => {
            println!("{}", serde_json::to_string_pretty(&pipeline.templates())?);
            true
        }
        Commands::List => {
            println!("{}", serde_json::to_string_pretty(&pipeline.list().await?)?);
            true
        }
        Commands::Stats => {
            println!("{}", serde_json::to_string_pretty(&pipeline.stats().await?)?);
            true
        }
        Commands::Teardown { id } => {
            let outcome = pipeline.teardown(&DeploymentId::new(id)).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            outcome.success
        }
        Commands::Remove { id } => {
            pipeline.remove(&DeploymentId::new(id)).await?;
            true
        }
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
