use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gumsync")]
#[command(about = "Copies the latest Gumroad sale into Airtable raw and clean tables")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the /trigger endpoint (default)
    Serve,
    /// Run the pipeline once and print the resulting status
    Trigger,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => gumsync_web::serve_from_env().await?,
        Commands::Trigger => {
            let status = gumsync_sync::run_trigger_once_from_env().await?;
            info!(status = status.as_str(), "trigger complete");
            println!("{}", serde_json::json!({ "status": status }));
        }
    }

    Ok(())
}
