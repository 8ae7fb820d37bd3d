mod config;
mod feed;
mod import;
mod webhook;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use import::Importer;

#[derive(Parser)]
#[command(name = "marprom-sync", about = "Reconcile scraped transit feed snapshots into the relational store")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one import cycle over the configured feed files
    Import {
        /// Service date for single-day schedule feeds (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run the deploy webhook listener
    Webhook,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).expect("Failed to load config");

    match cli.command {
        Command::Import { date } => {
            let pool = SqlitePool::connect(&config.database_url)
                .await
                .expect("Failed to connect to SQLite database");

            let migrator = sqlx::migrate!("./migrations");
            migrator.run(&pool).await.expect("Failed to run migrations");
            tracing::info!("Database migrations completed");

            let service_date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let summary = Importer::new(pool, config.feeds).run(service_date).await;
            summary.log();
        }
        Command::Webhook => {
            if let Err(e) = webhook::serve(config.webhook).await {
                tracing::error!(error = %e, "Webhook listener exited");
                std::process::exit(1);
            }
        }
    }
}
