use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tgstat_client::{
    EntityInfo, ForumTopic, MessagingPlatform, PlatformError, PlatformMessage,
};
use tgstat_store::JsonTableStore;
use tgstat_sync::{SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tgstat")]
#[command(about = "Telegram channel activity sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collect-and-merge cycle.
    Sync,
    /// Keep running and fire sync on the configured cron schedules.
    Watch,
    /// Resolve and print the configured entities (masked).
    Entities,
}

/// Placeholder transport. Every call fails until a real client backend is
/// wired in; the rest of the pipeline is exercised through it in tests.
struct StubPlatform;

fn no_transport() -> PlatformError {
    PlatformError::Unexpected("no platform transport configured".into())
}

#[async_trait]
impl MessagingPlatform for StubPlatform {
    async fn resolve_entity(&self, _entity_ref: &str) -> Result<EntityInfo, PlatformError> {
        Err(no_transport())
    }

    async fn participant_count(&self, _entity: &EntityInfo) -> Result<u64, PlatformError> {
        Err(no_transport())
    }

    async fn recent_messages(
        &self,
        _entity: &EntityInfo,
        _limit: usize,
    ) -> Result<Vec<PlatformMessage>, PlatformError> {
        Err(no_transport())
    }

    async fn latest_message_id(
        &self,
        _entity: &EntityInfo,
    ) -> Result<Option<i64>, PlatformError> {
        Err(no_transport())
    }

    async fn forum_topics(
        &self,
        _entity: &EntityInfo,
        _limit: usize,
    ) -> Result<Vec<ForumTopic>, PlatformError> {
        Err(no_transport())
    }

    async fn topic_messages(
        &self,
        _entity: &EntityInfo,
        _topic_id: i64,
        _min_id: i64,
        _max_id: Option<i64>,
    ) -> Result<Vec<PlatformMessage>, PlatformError> {
        Err(no_transport())
    }
}

fn build_pipeline() -> SyncPipeline<JsonTableStore> {
    let config = SyncConfig::from_env();
    let store = JsonTableStore::new(&config.data_dir);
    SyncPipeline::new(config, Arc::new(StubPlatform), store)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = build_pipeline();
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} from_cache={} channels={} chats={} rows={}/{}/{}",
                summary.run_id,
                summary.from_cache,
                summary.channels,
                summary.chats,
                summary.channel_rows,
                summary.word_rows,
                summary.topic_rows,
            );
        }
        Commands::Watch => {
            let pipeline = Arc::new(build_pipeline());
            match pipeline.maybe_build_scheduler().await? {
                Some(sched) => {
                    sched.start().await.context("starting scheduler")?;
                    info!("scheduler running, press ctrl-c to stop");
                    tokio::signal::ctrl_c()
                        .await
                        .context("waiting for shutdown signal")?;
                    info!("shutting down");
                }
                None => {
                    eprintln!("scheduler disabled; set TGSTAT_SCHEDULER_ENABLED=true");
                }
            }
        }
        Commands::Entities => {
            let pipeline = build_pipeline();
            let registry = tgstat_sync::EntityRegistry::load(&pipeline.config().registry_path)
                .await
                .context("loading entity registry")?;
            let mut refs = registry.channels.clone();
            refs.extend(registry.chats.clone());
            for (entity_ref, title) in pipeline.entity_names(&refs).await {
                println!("{entity_ref}  {title}");
            }
        }
    }

    Ok(())
}
