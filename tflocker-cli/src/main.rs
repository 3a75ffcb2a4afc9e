mod config;
mod server;
mod shutdown;

use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use log::info;

use tflocker_state::{StateStore, create_ledger};

use config::{Cli, Commands, DatabaseArgs, ServeArgs};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => run_serve(&args).await,
        Commands::InitDb(args) => run_init_db(&args).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run_serve(args: &ServeArgs) -> Result<(), String> {
    info!("Starting tflocker...");
    let addr = args.listen_addr()?;

    if args.ledger == "memory" {
        info!("Using in-memory ledger; state is lost on shutdown");
    } else {
        info!("Connecting to {} ledger", args.ledger);
    }

    let ledger = create_ledger(&args.ledger_config())
        .await
        .map_err(|e| format!("Failed to open ledger: {}", e))?;
    ledger
        .init()
        .await
        .map_err(|e| format!("Failed to create states table: {}", e))?;

    let store = StateStore::new(Arc::from(ledger));
    server::serve(addr, store).await?;

    info!("This node went down gracefully");
    Ok(())
}

async fn run_init_db(args: &DatabaseArgs) -> Result<(), String> {
    let ledger = create_ledger(&args.ledger_config("postgres"))
        .await
        .map_err(|e| format!("Failed to connect to database: {}", e))?;
    ledger
        .init()
        .await
        .map_err(|e| format!("Failed to create states table: {}", e))?;

    println!("{}", "States table is ready".green());
    Ok(())
}
