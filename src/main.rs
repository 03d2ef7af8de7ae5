mod main_runtime;

use clap::Parser;
use main_runtime::{init_logging, init_logging_simple};
use patchops::cli::output::OutputMode;
use patchops::cli::{commands, Cli, Commands};
use patchops::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut app = AppConfig::load()?;
    if let Some(dir) = &cli.data_dir {
        app.data_dir = dir.clone();
    }
    let mode = OutputMode::from_json_flag(cli.json);

    match cli.command {
        Commands::Run => {
            init_logging(&app.logging, cli.json);
            main_runtime::run(app).await?;
        }
        Commands::Status => {
            init_logging_simple();
            commands::show_status(&app, mode).await?;
        }
        Commands::Events { limit } => {
            init_logging_simple();
            commands::show_events(&app, limit, mode).await?;
        }
        Commands::Alerts { history } => {
            init_logging_simple();
            commands::show_alerts(&app, history, mode).await?;
        }
        Commands::Config {
            target,
            set,
            validate,
            live,
        } => {
            init_logging_simple();
            commands::config(&app, target, set, validate, live).await?;
        }
        Commands::Ack { id, by } => {
            init_logging_simple();
            commands::acknowledge(&app, &id, &by).await?;
        }
        Commands::Resolve { id, by } => {
            init_logging_simple();
            commands::resolve(&app, &id, &by).await?;
        }
        Commands::Restart { id } => {
            init_logging_simple();
            commands::restart(&app, &id).await?;
        }
    }

    Ok(())
}
