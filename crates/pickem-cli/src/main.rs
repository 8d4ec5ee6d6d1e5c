use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use pickem_store::ImageStore;
use pickem_sync::{
    cleanup_weekly_shows, connect_store, remove_duplicate_events, set_admin_flag,
    upload_image_folder, SyncConfig, SyncPipeline,
};

#[derive(Debug, Parser)]
#[command(name = "pickem-cli")]
#[command(about = "Pick'em backend command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AdminAction {
    Grant,
    Revoke,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every enabled source once and upsert the results.
    Sync,
    /// Serve the dashboard and the /sync endpoint (starts the cron
    /// scheduler when enabled).
    Serve,
    /// Remove duplicate events, keeping the most complete record per
    /// normalized name.
    Reconcile,
    /// Delete weekly TV shows from the events collection.
    CleanupWeekly,
    /// Grant or revoke a user's admin flag.
    Admin {
        email: String,
        action: AdminAction,
    },
    /// Upload every file in a folder to the image store.
    UploadImages { folder: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} found={} saved={}",
                summary.run_id, summary.events_found, summary.events_saved
            );
            for event in &summary.events {
                println!(
                    "  {} {} ({}, {} matches)",
                    event.date, event.name, event.promotion_name, event.match_count
                );
            }
        }
        Commands::Serve => {
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            if let Some(scheduler) = Arc::clone(&pipeline).maybe_build_scheduler().await? {
                scheduler.start().await?;
                println!("cron scheduler started");
            }
            pickem_web::serve_from_env().await?;
        }
        Commands::Reconcile => {
            let store = connect_store(&config).await?;
            let report = remove_duplicate_events(store.as_ref()).await?;
            println!(
                "reconcile complete: groups={} deleted={} protected={}",
                report.groups, report.deleted, report.protected
            );
        }
        Commands::CleanupWeekly => {
            let store = connect_store(&config).await?;
            let report = cleanup_weekly_shows(store.as_ref()).await?;
            println!(
                "cleanup complete: scanned={} deleted={} protected={}",
                report.scanned, report.deleted, report.protected
            );
        }
        Commands::Admin { email, action } => {
            let store = connect_store(&config).await?;
            let grant = matches!(action, AdminAction::Grant);
            let user = set_admin_flag(store.as_ref(), &email, grant).await?;
            println!(
                "{} admin for {} (user {})",
                if grant { "granted" } else { "revoked" },
                email,
                user.id
            );
        }
        Commands::UploadImages { folder } => {
            let store = connect_store(&config).await?;
            let images = ImageStore::new(&config.images_dir);
            let report = upload_image_folder(store.as_ref(), &images, &folder).await?;
            println!(
                "upload complete: uploaded={} failed={}",
                report.uploaded, report.failed
            );
        }
    }

    Ok(())
}
