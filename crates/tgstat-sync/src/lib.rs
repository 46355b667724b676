//! Sync pipeline orchestration: incremental collection from the messaging
//! platform, durable staging of each run, and merge into persisted tables.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, Utc};
use serde::Deserialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use tgstat_client::{
    EntityInfo, ForumTopic, MessagingPlatform, PlatformMessage, RequestExecutor, RetryPolicy,
};
use tgstat_core::{
    mask_entity_ref, ChannelMessage, ChannelRecord, ChannelSnapshot, ChatSnapshot, RunSnapshot,
    TopicActivity, TopicHourRecord, WordRecord, MERGE_TIMESTAMP_FORMAT,
};
use tgstat_nlp::{extract_hashtags, TextNormalizer};
use tgstat_store::{
    MergeReconciler, Table, TableStore, CHANNELS_DAILY, CHANNEL_WORDS, TOPIC_HOURLY,
};

pub const CRATE_NAME: &str = "tgstat-sync";

/// The fixed set of entities to collect, loaded from a YAML registry file.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityRegistry {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub chats: Vec<String>,
}

impl EntityRegistry {
    pub async fn load(path: &PathBuf) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Regular runs derive windows incrementally; backfill runs use an explicit
/// date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Regular,
    Backfill {
        start: NaiveDate,
        end: NaiveDate,
    },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub cache_file: PathBuf,
    pub registry_path: PathBuf,
    pub timezone: FixedOffset,
    pub mode: RunMode,
    pub message_limit: usize,
    pub topic_limit: usize,
    pub safety_margin: i64,
    pub chunk_size: i64,
    /// Pause after folding each topic message, on top of executor spacing.
    pub message_pace: Duration,
    /// Pause before starting each entity.
    pub entity_pace: Duration,
    pub incremental_skip: bool,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("TGSTAT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let mode = match std::env::var("TGSTAT_MODE").as_deref() {
            Ok("backfill") => {
                let start = parse_env_date("START_DATE");
                let end = parse_env_date("END_DATE");
                match (start, end) {
                    (Some(start), Some(end)) => RunMode::Backfill { start, end },
                    _ => {
                        warn!("backfill mode without valid START_DATE/END_DATE, running regular");
                        RunMode::Regular
                    }
                }
            }
            _ => RunMode::Regular,
        };
        Self {
            cache_file: data_dir.join("data_cache.json"),
            registry_path: std::env::var("TGSTAT_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("entities.yaml")),
            timezone: std::env::var("TGSTAT_TZ_OFFSET")
                .ok()
                .and_then(|v| parse_offset(&v))
                .unwrap_or_else(|| FixedOffset::east_opt(3 * 3600).expect("static offset")),
            mode,
            message_limit: env_usize("TGSTAT_MESSAGE_LIMIT", 100),
            topic_limit: env_usize("TGSTAT_TOPIC_LIMIT", 100),
            safety_margin: env_usize("TGSTAT_SAFETY_MARGIN", 100) as i64,
            chunk_size: env_usize("TGSTAT_CHUNK_SIZE", 5000) as i64,
            message_pace: Duration::from_millis(100),
            entity_pace: Duration::from_secs(2),
            incremental_skip: std::env::var("TGSTAT_INCREMENTAL_SKIP")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            scheduler_enabled: std::env::var("TGSTAT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or_else(|_| "0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or_else(|_| "0 18 * * *".to_string()),
            data_dir,
        }
    }
}

/// Parse a `+HH:MM`/`-HH:MM` UTC offset.
pub fn parse_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    let (sign, rest) = if let Some(rest) = value.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = value.strip_prefix('-') {
        (-1, rest)
    } else {
        (1, value)
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn parse_env_date(var: &str) -> Option<NaiveDate> {
    std::env::var(var)
        .ok()
        .and_then(|v| NaiveDate::parse_from_str(&v, "%Y-%m-%d").ok())
}

fn env_usize(var: &str, default: usize) -> usize {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Durable staging of one collection run's output between collection and
/// confirmed storage. A present cache file means "collection succeeded but
/// the merge has not been confirmed yet".
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    path: PathBuf,
}

impl SnapshotCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Serialize the run result durably; write-then-rename keeps the file
    /// atomic from any reader's perspective.
    pub async fn stage(&self, snapshot: &RunSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec(snapshot).context("serializing run snapshot")?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("staging cache file {}", self.path.display()))?;
        info!(path = %self.path.display(), "run snapshot staged");
        Ok(())
    }

    /// An absent cache file is the normal "no in-flight run" state. An
    /// unparseable one is logged and treated as absent.
    pub async fn load_staged(&self) -> Result<Option<RunSnapshot>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading cache file {}", self.path.display()))
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "unparseable cache file, ignoring");
                Ok(None)
            }
        }
    }

    /// Called only after the merge phase completes without raising.
    pub async fn clear_staged(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("cache cleared");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("clearing cache file {}", self.path.display()))
            }
        }
    }
}

/// Per-topic collection window (see the chat flow).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicWindow {
    /// Resume from `start_id` (already margin-adjusted).
    FromId { start_id: i64 },
    /// Collect messages dated within `[start, end]`.
    DateRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Collects channel and chat snapshots through the rate-limited executor,
/// deciding per entity whether fresh collection is needed at all.
pub struct Collector<'a, S: TableStore> {
    platform: &'a dyn MessagingPlatform,
    executor: &'a RequestExecutor,
    normalizer: &'a TextNormalizer,
    reconciler: &'a MergeReconciler<S>,
    config: &'a SyncConfig,
}

impl<'a, S: TableStore> Collector<'a, S> {
    pub fn new(
        platform: &'a dyn MessagingPlatform,
        executor: &'a RequestExecutor,
        normalizer: &'a TextNormalizer,
        reconciler: &'a MergeReconciler<S>,
        config: &'a SyncConfig,
    ) -> Self {
        Self {
            platform,
            executor,
            normalizer,
            reconciler,
            config,
        }
    }

    /// Channel flow. `Ok(None)` means the channel is skipped this run,
    /// either because nothing changed or because a platform failure was
    /// contained (logged with the masked id). Store failures propagate.
    pub async fn collect_channel(&self, entity_ref: &str) -> Result<Option<ChannelSnapshot>> {
        let masked = mask_entity_ref(entity_ref);
        info!(channel = %masked, "processing channel");

        let entity = match self
            .executor
            .execute(entity_ref, || self.platform.resolve_entity(entity_ref))
            .await
        {
            Ok(entity) => entity,
            Err(err) => {
                error!(channel = %masked, %err, "failed to resolve channel, skipping");
                return Ok(None);
            }
        };

        if self.config.incremental_skip {
            if let Some(skip) = self.channel_unchanged(entity_ref, &masked, &entity).await? {
                if skip {
                    return Ok(None);
                }
            }
        }

        let member_count = match self
            .executor
            .execute(entity_ref, || self.platform.participant_count(&entity))
            .await
        {
            Ok(count) => count,
            Err(err) => {
                error!(channel = %masked, %err, "failed to count participants, skipping");
                return Ok(None);
            }
        };

        let raw_messages = match self
            .executor
            .execute(entity_ref, || {
                self.platform
                    .recent_messages(&entity, self.config.message_limit)
            })
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                error!(channel = %masked, %err, "failed to fetch messages, skipping");
                return Ok(None);
            }
        };

        let last_message_id = raw_messages
            .iter()
            .map(|message| message.id)
            .max()
            .unwrap_or(0);
        let messages: Vec<ChannelMessage> = raw_messages
            .into_iter()
            .filter(|message| !message.text.is_empty())
            .map(|message| ChannelMessage {
                id: message.id,
                date: message.date.with_timezone(&self.config.timezone),
                normalized_text: self.normalizer.normalize(&message.text),
                hashtags: extract_hashtags(&message.text),
                text: message.text,
            })
            .collect();

        info!(
            channel = %masked,
            name = %entity.title,
            messages = messages.len(),
            "channel collected"
        );
        Ok(Some(ChannelSnapshot {
            channel_id: masked,
            channel_name: entity.title,
            member_count,
            last_message_id,
            messages,
            collected_at: Utc::now(),
        }))
    }

    /// `Some(true)` when the persisted last message id matches the platform's
    /// current latest, i.e. there is nothing new; `None` when no history
    /// exists or the check itself failed (fall through to full collection).
    async fn channel_unchanged(
        &self,
        entity_ref: &str,
        masked: &str,
        entity: &EntityInfo,
    ) -> Result<Option<bool>> {
        let persisted = self
            .reconciler
            .last_known_max(&CHANNELS_DAILY, &[("channel_id", masked)], "last_message_id")
            .await?;
        let Some(persisted) = persisted else {
            return Ok(None);
        };
        match self
            .executor
            .execute(entity_ref, || self.platform.latest_message_id(entity))
            .await
        {
            Ok(Some(latest)) if latest == persisted => {
                info!(
                    channel = %masked,
                    last_message_id = latest,
                    "no new messages, skipping collection"
                );
                Ok(Some(true))
            }
            Ok(_) => Ok(Some(false)),
            Err(err) => {
                warn!(channel = %masked, %err, "latest-id probe failed, collecting fully");
                Ok(None)
            }
        }
    }

    /// Chat/topic flow. Entity-level failures yield `Ok(None)`; a failing
    /// topic is skipped while the rest of the chat still contributes.
    pub async fn collect_chat(&self, entity_ref: &str) -> Result<Option<ChatSnapshot>> {
        let masked = mask_entity_ref(entity_ref);
        info!(chat = %masked, "processing chat");

        let entity = match self
            .executor
            .execute(entity_ref, || self.platform.resolve_entity(entity_ref))
            .await
        {
            Ok(entity) => entity,
            Err(err) => {
                error!(chat = %masked, %err, "failed to resolve chat, skipping");
                return Ok(None);
            }
        };

        let topics = match self
            .executor
            .execute(entity_ref, || {
                self.platform.forum_topics(&entity, self.config.topic_limit)
            })
            .await
        {
            Ok(topics) => topics,
            Err(err) => {
                error!(chat = %masked, %err, "failed to enumerate topics, skipping chat");
                return Ok(None);
            }
        };

        info!(chat = %masked, topics = topics.len(), "processing topics");
        let mut collected = Vec::with_capacity(topics.len());
        for topic in &topics {
            match self.collect_topic(entity_ref, &masked, &entity, topic).await? {
                Some(activity) => collected.push(activity),
                None => continue,
            }
        }

        Ok(Some(ChatSnapshot {
            chat_id: masked,
            chat_name: entity.title,
            topics: collected,
            collected_at: Utc::now(),
        }))
    }

    async fn collect_topic(
        &self,
        entity_ref: &str,
        masked: &str,
        entity: &EntityInfo,
        topic: &ForumTopic,
    ) -> Result<Option<TopicActivity>> {
        let window = self.topic_window(masked, topic).await?;
        let mut activity = TopicActivity::new(topic.id, &topic.title);

        let latest = match self
            .executor
            .execute(entity_ref, || self.platform.latest_message_id(entity))
            .await
        {
            Ok(latest) => latest.unwrap_or(0),
            Err(err) => {
                error!(chat = %masked, topic = topic.id, %err, "latest-id fetch failed, skipping topic");
                return Ok(None);
            }
        };

        let mut total = 0u64;
        match window {
            TopicWindow::FromId { start_id } => {
                let mut cursor = start_id;
                while cursor < latest {
                    // Bound each request window so one call never spans more
                    // than chunk_size ids.
                    let upper = if latest - cursor > self.config.chunk_size {
                        Some(cursor + self.config.chunk_size)
                    } else {
                        None
                    };
                    let Some(batch) = self
                        .fetch_topic_chunk(entity_ref, masked, entity, topic, cursor, upper)
                        .await
                    else {
                        return Ok(None);
                    };
                    for message in batch {
                        self.fold_topic_message(&mut activity, &mut total, topic, &message)
                            .await;
                    }
                    cursor = upper.unwrap_or(latest);
                }
            }
            TopicWindow::DateRange { start, end } => {
                // Ids ascend with time, so walking chunks newest-first lets a
                // date window stop at its start instead of visiting the whole
                // topic history from id 0.
                let mut high = latest;
                while high > 0 {
                    let low = (high - self.config.chunk_size).max(0);
                    let Some(batch) = self
                        .fetch_topic_chunk(entity_ref, masked, entity, topic, low, Some(high))
                        .await
                    else {
                        return Ok(None);
                    };
                    // Batches come back ascending; an oldest message dated
                    // before the window means every earlier chunk is too.
                    let reached_window_start = batch
                        .first()
                        .map(|message| message.date < start)
                        .unwrap_or(false);
                    for message in batch {
                        if message.date < start || message.date > end {
                            continue;
                        }
                        self.fold_topic_message(&mut activity, &mut total, topic, &message)
                            .await;
                    }
                    if reached_window_start {
                        break;
                    }
                    high = low;
                }
            }
        }

        info!(
            chat = %masked,
            topic = %topic.title,
            messages = total,
            buckets = activity.buckets.len(),
            "topic collected"
        );
        Ok(Some(activity))
    }

    /// One bounded `(min_id, max_id]` fetch through the executor. `None`
    /// means the fetch failed and the whole topic should be skipped.
    async fn fetch_topic_chunk(
        &self,
        entity_ref: &str,
        masked: &str,
        entity: &EntityInfo,
        topic: &ForumTopic,
        min_id: i64,
        max_id: Option<i64>,
    ) -> Option<Vec<PlatformMessage>> {
        match self
            .executor
            .execute(entity_ref, || {
                self.platform
                    .topic_messages(entity, topic.id, min_id, max_id)
            })
            .await
        {
            Ok(batch) => Some(batch),
            Err(err) => {
                error!(
                    chat = %masked,
                    topic = topic.id,
                    %err,
                    "message fetch failed, skipping topic"
                );
                None
            }
        }
    }

    async fn fold_topic_message(
        &self,
        activity: &mut TopicActivity,
        total: &mut u64,
        topic: &ForumTopic,
        message: &PlatformMessage,
    ) {
        let local = message.date.with_timezone(&self.config.timezone);
        activity.observe(message.id, local);
        *total += 1;
        if *total % 1000 == 0 {
            info!(topic = %topic.title, processed = *total, "still collecting");
        }
        tokio::time::sleep(self.config.message_pace).await;
    }

    /// Choose the collection window for one topic: explicit range in
    /// backfill mode, margin-adjusted resume point when history exists,
    /// trailing 24 hours otherwise.
    async fn topic_window(&self, masked: &str, topic: &ForumTopic) -> Result<TopicWindow> {
        if let RunMode::Backfill { start, end } = self.config.mode {
            let tz = self.config.timezone;
            let start = start
                .and_hms_opt(0, 0, 0)
                .expect("midnight is valid")
                .and_local_timezone(tz)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_default();
            let end = end
                .and_hms_opt(23, 59, 59)
                .expect("end of day is valid")
                .and_local_timezone(tz)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            return Ok(TopicWindow::DateRange { start, end });
        }

        let topic_id = topic.id.to_string();
        let last = self
            .reconciler
            .last_known_max(
                &TOPIC_HOURLY,
                &[("chat_id", masked), ("topic_id", &topic_id)],
                "last_message_id",
            )
            .await?;
        if let Some(last) = last {
            // Deliberate overlap: re-aggregated buckets replace their
            // previous values on merge, so re-reading the margin is safe.
            let start_id = (last - self.config.safety_margin).max(0);
            return Ok(TopicWindow::FromId { start_id });
        }

        let end = Utc::now();
        let start = end - ChronoDuration::hours(24);
        Ok(TopicWindow::DateRange { start, end })
    }

    /// Best-effort display names for a pre-run summary; failures fall back
    /// to the masked reference and never abort the batch.
    pub async fn resolve_entity_names(&self, refs: &[String]) -> Vec<(String, String)> {
        let mut names = Vec::with_capacity(refs.len());
        for entity_ref in refs {
            let masked = mask_entity_ref(entity_ref);
            let name = match self
                .executor
                .execute(entity_ref, || self.platform.resolve_entity(entity_ref))
                .await
            {
                Ok(entity) => entity.title,
                Err(err) => {
                    error!(entity = %masked, %err, "failed to resolve name");
                    masked.clone()
                }
            };
            names.push((masked, name));
        }
        names
    }
}

#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub from_cache: bool,
    pub channels: usize,
    pub chats: usize,
    pub channel_rows: usize,
    pub word_rows: usize,
    pub topic_rows: usize,
}

/// One full run: staged collection, record shaping, and the three merges.
pub struct SyncPipeline<S: TableStore> {
    config: SyncConfig,
    platform: Arc<dyn MessagingPlatform>,
    executor: RequestExecutor,
    normalizer: TextNormalizer,
    reconciler: MergeReconciler<S>,
    cache: SnapshotCache,
}

impl<S: TableStore + 'static> SyncPipeline<S> {
    pub fn new(config: SyncConfig, platform: Arc<dyn MessagingPlatform>, store: S) -> Self {
        Self {
            cache: SnapshotCache::new(config.cache_file.clone()),
            executor: RequestExecutor::new(RetryPolicy::default()),
            normalizer: TextNormalizer::new(),
            reconciler: MergeReconciler::new(store),
            config,
            platform,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.executor = RequestExecutor::new(policy);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &MergeReconciler<S> {
        &self.reconciler
    }

    /// Best-effort entity name resolution for the pre-run summary.
    pub async fn entity_names(&self, refs: &[String]) -> Vec<(String, String)> {
        let collector = Collector::new(
            self.platform.as_ref(),
            &self.executor,
            &self.normalizer,
            &self.reconciler,
            &self.config,
        );
        collector.resolve_entity_names(refs).await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "starting sync run");

        let registry = EntityRegistry::load(&self.config.registry_path).await?;

        let (snapshot, from_cache) = match self.cache.load_staged().await? {
            Some(snapshot) => {
                info!("reusing staged snapshot, skipping collection");
                (snapshot, true)
            }
            None => {
                info!("collecting fresh data");
                let snapshot = self.collect_all(&registry).await?;
                self.cache.stage(&snapshot).await?;
                (snapshot, false)
            }
        };

        let processed_at = Utc::now()
            .with_timezone(&self.config.timezone)
            .format(MERGE_TIMESTAMP_FORMAT)
            .to_string();
        let channel_table = shape_channel_rows(&snapshot, &processed_at);
        let word_table = shape_word_rows(&snapshot, &processed_at);
        let topic_table = shape_topic_rows(&snapshot, &processed_at);
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            from_cache,
            channels: snapshot.channels.len(),
            chats: snapshot.chats.len(),
            channel_rows: channel_table.rows.len(),
            word_rows: word_table.rows.len(),
            topic_rows: topic_table.rows.len(),
        };

        self.reconciler.merge(&CHANNELS_DAILY, channel_table).await?;
        self.reconciler.merge(&CHANNEL_WORDS, word_table).await?;
        self.reconciler.merge(&TOPIC_HOURLY, topic_table).await?;

        self.cache.clear_staged().await?;

        let finished_at = Utc::now();
        info!(%run_id, "sync run complete");
        Ok(SyncRunSummary {
            finished_at,
            ..summary
        })
    }

    async fn collect_all(&self, registry: &EntityRegistry) -> Result<RunSnapshot> {
        let collector = Collector::new(
            self.platform.as_ref(),
            &self.executor,
            &self.normalizer,
            &self.reconciler,
            &self.config,
        );
        let mut snapshot = RunSnapshot::empty(Utc::now());

        for entity_ref in &registry.channels {
            tokio::time::sleep(self.config.entity_pace).await;
            if let Some(channel) = collector.collect_channel(entity_ref).await? {
                snapshot.channels.push(channel);
            }
        }
        for entity_ref in &registry.chats {
            tokio::time::sleep(self.config.entity_pace).await;
            if let Some(chat) = collector.collect_chat(entity_ref).await? {
                snapshot.chats.push(chat);
            }
        }

        info!(
            channels = snapshot.channels.len(),
            chats = snapshot.chats.len(),
            "data collection completed"
        );
        Ok(snapshot)
    }

    /// Cron-driven repeated runs, enabled by config (off by default).
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(run_id = %summary.run_id, "scheduled run complete"),
                        Err(err) => error!(%err, "scheduled run failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

/// One channels_daily row per collected channel (current-state dataset).
pub fn shape_channel_rows(snapshot: &RunSnapshot, processed_at: &str) -> Table {
    let mut table = Table::from_header(ChannelRecord::header());
    for channel in &snapshot.channels {
        let record = ChannelRecord {
            channel_id: channel.channel_id.clone(),
            channel_name: channel.channel_name.clone(),
            member_count: channel.member_count,
            message_count: channel.messages.len() as u64,
            last_message_id: channel.last_message_id,
            processed_at: processed_at.to_string(),
        };
        table.rows.push(record.into_row());
    }
    table
}

/// One channel_words row per normalized token occurrence.
pub fn shape_word_rows(snapshot: &RunSnapshot, processed_at: &str) -> Table {
    let mut table = Table::from_header(WordRecord::header());
    for channel in &snapshot.channels {
        for message in &channel.messages {
            for word in message.normalized_text.split_whitespace() {
                let record = WordRecord {
                    channel_id: channel.channel_id.clone(),
                    message_id: message.id,
                    word: word.to_string(),
                    date: message.date.format(MERGE_TIMESTAMP_FORMAT).to_string(),
                    processed_at: processed_at.to_string(),
                };
                table.rows.push(record.into_row());
            }
        }
    }
    table
}

/// One topic_hourly row per (chat, topic, hour) bucket.
pub fn shape_topic_rows(snapshot: &RunSnapshot, processed_at: &str) -> Table {
    let mut table = Table::from_header(TopicHourRecord::header());
    for chat in &snapshot.chats {
        for topic in &chat.topics {
            for (hour, bucket) in &topic.buckets {
                let record = TopicHourRecord {
                    chat_id: chat.chat_id.clone(),
                    topic_id: topic.topic_id,
                    hour: hour.clone(),
                    chat_name: chat.chat_name.clone(),
                    topic_name: topic.topic_name.clone(),
                    message_count: bucket.message_count,
                    first_message_id: bucket.first_message_id,
                    last_message_id: bucket.last_message_id,
                    processed_at: processed_at.to_string(),
                };
                table.rows.push(record.into_row());
            }
        }
    }
    table
}
