use std::sync::Arc;

use dotenvy::dotenv;
use tracing::{error, info};

mod cli;
mod commands;
mod config;
mod db;
mod jobs;
mod llm;
mod state;
mod utils;

use cli::{parse_args, Command};
use config::CONFIG;
use db::database::Database;
use jobs::orchestrator::{JobOrchestrator, PipelinePolicy};
use llm::GeminiGateway;
use state::JobBoard;
use utils::logging::init_logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let _guards = init_logging();

    let args: Vec<String> = std::env::args().collect();
    let command = parse_args(&args)?;
    if command == Command::Help {
        println!("{}", cli::usage());
        return Ok(());
    }

    info!(database_url = %CONFIG.database_url, "Starting character studio");
    let db = Database::init(&CONFIG.database_url).await?;
    db.health_check().await?;

    let gateway = Arc::new(GeminiGateway::from_config(&CONFIG));
    let orchestrator = JobOrchestrator::new(
        db,
        gateway,
        JobBoard::new(),
        PipelinePolicy::from_config(&CONFIG),
    );
    orchestrator.recover().await?;

    match commands::run_command(&orchestrator, command, CONFIG.max_image_dimension).await {
        Ok(output) => {
            println!("{output}");
            Ok(())
        }
        Err(err) => {
            error!("Command failed: {err:#}");
            Err(err)
        }
    }
}
