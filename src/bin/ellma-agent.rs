//! Minimal host binary: wires an [`Agent`] to stdin/stdout.
//!
//! Reads one command per line, dispatches it, and prints the result.
//! Built-in commands (anything without a `module.action` dot) are echoed
//! back rather than interpreted — this binary has no shell of its own.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use ellma_core::agent::{Agent, StatePaths};
use ellma_core::config::Config;
use ellma_core::dispatcher::Dispatched;
use ellma_core::module::CargoModuleBuilder;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), String> {
    setup_tracing();

    let data_dir = std::env::var("ELLMA_DATA_DIR").unwrap_or_else(|_| ".ellma".to_string());
    std::fs::create_dir_all(&data_dir).map_err(|e| e.to_string())?;
    let paths = StatePaths::under(&data_dir);

    let config = Config::load(&paths.config).unwrap_or_default();

    info!("starting agent");
    let agent = Agent::new(config, Arc::new(CargoModuleBuilder), None, paths);
    agent.initialize_all().await.map_err(|e| e.to_string())?;

    let stdin = io::stdin();
    print!("> ");
    io::stdout().flush().ok();
    for line in stdin.lock().lines() {
        let line = line.map_err(|e| e.to_string())?;
        let line = line.trim();
        if line.is_empty() {
            print!("> ");
            io::stdout().flush().ok();
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        match agent.execute(line).await {
            Ok(Dispatched::Called(value)) => println!("{value}"),
            Ok(Dispatched::BuiltIn { command, .. }) => {
                println!("(built-in, not handled by this binary: {command})")
            }
            Err(err) => error!(error = %err, "command failed"),
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    agent.close().await.map_err(|e| e.to_string())?;
    info!("agent shut down cleanly");
    Ok(())
}
