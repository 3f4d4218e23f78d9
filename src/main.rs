use anyhow::Result;
use clap::Parser;

use content_workflow::cli::{self, Cli};
use content_workflow::config::ContentWorkflowConfig;
use content_workflow::telemetry::init_telemetry;

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = ContentWorkflowConfig::load_env_file() {
        eprintln!("⚠️  Could not read .env: {e}");
    }
    let config = ContentWorkflowConfig::load()?;
    init_telemetry(&config.observability)?;

    tokio::runtime::Runtime::new()?.block_on(async { cli::run(cli.command, config).await })
}
