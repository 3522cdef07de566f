use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod collector;
mod config;
mod crypto;
mod db;
mod derive;
mod ews;
mod models;
mod parse;
mod prediction;
mod source_api;
mod stats;

use config::Config;
use crypto::PiiCipher;

#[derive(Parser)]
#[command(name = "learning-analytics-pipeline")]
#[command(about = "Course analytics collection, derivation, and early warning pipeline", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Run the full pipeline: collect, derive, update early warning data
    Run,
    /// Run only the collection stages
    Collect,
    /// Run only the derivation jobs
    Derive,
    /// Rebuild course and actor summaries
    EwsUpdate,
    /// Print at-risk students for a course
    EwsResults {
        #[arg(long)]
        course: String,
        /// Keep student identity encrypted in the output
        #[arg(long, default_value_t = false)]
        privacy: bool,
    },
    /// Apply a saved prediction webhook payload
    IngestPredictions {
        #[arg(long)]
        payload: PathBuf,
    },
    /// Import textbook interaction events from a CSV file
    ImportEvents {
        #[arg(long)]
        csv: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = cli.config;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let cipher = PiiCipher::new(&config.pii_encryption_key);

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Run => {
            collector::run_collectors(&pool, &config, &cipher).await?;
            if !derive::run_processors(&pool).await {
                tracing::warn!("one or more derivation jobs failed; summaries may be partial");
            }
            ews::update_ews_data(&pool, &config).await?;
            println!("Pipeline run complete.");
        }
        Commands::Collect => {
            collector::run_collectors(&pool, &config, &cipher).await?;
            println!("Collection complete.");
        }
        Commands::Derive => {
            if derive::run_processors(&pool).await {
                println!("All derivation jobs succeeded.");
            } else {
                println!("Some derivation jobs failed; see logs.");
            }
        }
        Commands::EwsUpdate => {
            ews::update_ews_data(&pool, &config).await?;
            println!("Early warning summaries updated.");
        }
        Commands::EwsResults { course, privacy } => {
            if let Some(status) = db::fetch_course_summary_status(&pool, &course).await? {
                println!("Course {course} status: {}", status.as_str());
            }
            let results = ews::get_ews_results(&pool, &cipher, &course, privacy).await?;
            if results.is_empty() {
                println!("No at-risk students for course {course}.");
            } else {
                println!("At-risk students for course {course}:");
                for result in &results {
                    println!(
                        "- {} predicted {:.1} ({:+.1} vs course avg {:.1}, z {:.2}) status {}",
                        result.name,
                        result.estimated_final,
                        result.course_avg_diff,
                        result.course_avg,
                        result.z_score,
                        result.status.as_str()
                    );
                }
            }
        }
        Commands::IngestPredictions { payload } => {
            let raw = std::fs::read_to_string(&payload)
                .with_context(|| format!("failed to read {}", payload.display()))?;
            let webhook: models::PredictionWebhook =
                serde_json::from_str(&raw).context("invalid prediction webhook payload")?;
            let applied = ews::ingest_prediction_webhook(&pool, &webhook).await?;
            println!(
                "Applied {applied} predictions for course {}.",
                webhook.course_id
            );
        }
        Commands::ImportEvents { csv } => {
            let inserted = import_events(&pool, &csv).await?;
            println!("Inserted {inserted} events from {}.", csv.display());
        }
    }

    Ok(())
}

async fn import_events(pool: &sqlx::PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<models::TextbookEvent>() {
        let event = result?;
        if db::insert_textbook_event(pool, &event).await? {
            inserted += 1;
        }
    }
    Ok(inserted)
}
