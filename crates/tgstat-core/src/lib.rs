//! Core domain model for tgstat: entity masking, collection snapshots,
//! and the typed records that feed the merge-reconciler.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tgstat-core";

/// Wire format for timestamp columns in persisted tables. String-comparable,
/// so last-write-wins merges stay deterministic.
pub const MERGE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Key format for hour buckets (top-of-hour, entity-local time).
pub const HOUR_KEY_FORMAT: &str = "%Y-%m-%dT%H:00:00";

/// Derive a privacy-safe display form of a channel/chat reference.
///
/// Deterministic and total: the same input always masks the same way, empty
/// input passes through, and the original reference is not recoverable from
/// the output. Private invite refs (`domain+hash`) keep the `domain+` prefix
/// and the trailing half of the hash; public refs (`domain/name`) keep
/// everything up to the last `/` and the trailing half of the name.
pub fn mask_entity_ref(entity_ref: &str) -> String {
    if entity_ref.is_empty() {
        return String::new();
    }
    if let Some((base, hash)) = entity_ref.split_once('+') {
        return format!("{base}+{}", mask_segment(hash));
    }
    if let Some((prefix, name)) = entity_ref.rsplit_once('/') {
        return format!("{prefix}/{}", mask_segment(name));
    }
    entity_ref.to_string()
}

/// Star out the leading half of a segment, char-wise. For odd lengths the
/// revealed trailing part is the longer (ceiling) half.
fn mask_segment(segment: &str) -> String {
    let hidden = segment.chars().count() / 2;
    let revealed: String = segment.chars().skip(hidden).collect();
    format!("{}{}", "*".repeat(hidden), revealed)
}

/// A single captured channel message, already shaped for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub id: i64,
    /// Capture time converted to the configured reporting offset.
    pub date: DateTime<FixedOffset>,
    pub text: String,
    pub normalized_text: String,
    pub hashtags: Vec<String>,
}

/// Full per-channel collection result for one run. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// Masked reference; raw refs are never persisted.
    pub channel_id: String,
    pub channel_name: String,
    pub member_count: u64,
    /// Newest message id seen on the platform, taken before the empty-text
    /// filter. Persisting the pre-filter id keeps the skip check honest when
    /// the newest message is media-only.
    pub last_message_id: i64,
    pub messages: Vec<ChannelMessage>,
    pub collected_at: DateTime<Utc>,
}

/// Hour-truncated activity aggregate for one forum topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourBucket {
    pub message_count: u64,
    pub first_message_id: i64,
    pub last_message_id: i64,
}

impl HourBucket {
    pub fn seed(message_id: i64) -> Self {
        Self {
            message_count: 1,
            first_message_id: message_id,
            last_message_id: message_id,
        }
    }

    /// Fold one message into the bucket. Commutative per message, so final
    /// bucket state does not depend on arrival order within a window.
    pub fn fold(&mut self, message_id: i64) {
        self.message_count += 1;
        self.first_message_id = self.first_message_id.min(message_id);
        self.last_message_id = self.last_message_id.max(message_id);
    }
}

/// Activity of one topic, bucketed by hour key (`YYYY-MM-DDTHH:00:00`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicActivity {
    pub topic_id: i64,
    pub topic_name: String,
    pub buckets: BTreeMap<String, HourBucket>,
}

impl TopicActivity {
    pub fn new(topic_id: i64, topic_name: impl Into<String>) -> Self {
        Self {
            topic_id,
            topic_name: topic_name.into(),
            buckets: BTreeMap::new(),
        }
    }

    /// Fold a message observed at `date` (entity-local time) into its bucket.
    pub fn observe(&mut self, message_id: i64, date: DateTime<FixedOffset>) {
        let key = date.format(HOUR_KEY_FORMAT).to_string();
        self.buckets
            .entry(key)
            .and_modify(|bucket| bucket.fold(message_id))
            .or_insert_with(|| HourBucket::seed(message_id));
    }
}

/// Full per-chat collection result for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSnapshot {
    pub chat_id: String,
    pub chat_name: String,
    pub topics: Vec<TopicActivity>,
    pub collected_at: DateTime<Utc>,
}

/// Whole collection run output; the snapshot-cache payload staged between
/// collection and storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub channels: Vec<ChannelSnapshot>,
    pub chats: Vec<ChatSnapshot>,
    pub collected_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn empty(collected_at: DateTime<Utc>) -> Self {
        Self {
            channels: Vec::new(),
            chats: Vec::new(),
            collected_at,
        }
    }
}

/// One row of the `channels_daily` table: the current state of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub channel_name: String,
    pub member_count: u64,
    pub message_count: u64,
    pub last_message_id: i64,
    pub processed_at: String,
}

impl ChannelRecord {
    pub fn header() -> &'static [&'static str] {
        &[
            "channel_id",
            "channel_name",
            "member_count",
            "message_count",
            "last_message_id",
            "processed_at",
        ]
    }

    pub fn into_row(self) -> Vec<String> {
        vec![
            self.channel_id,
            self.channel_name,
            self.member_count.to_string(),
            self.message_count.to_string(),
            self.last_message_id.to_string(),
            self.processed_at,
        ]
    }
}

/// One row of the `channel_words` index: a normalized token occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordRecord {
    pub channel_id: String,
    pub message_id: i64,
    pub word: String,
    pub date: String,
    pub processed_at: String,
}

impl WordRecord {
    pub fn header() -> &'static [&'static str] {
        &["channel_id", "message_id", "word", "date", "processed_at"]
    }

    pub fn into_row(self) -> Vec<String> {
        vec![
            self.channel_id,
            self.message_id.to_string(),
            self.word,
            self.date,
            self.processed_at,
        ]
    }
}

/// One row of the `topic_hourly` table: a topic's activity within one hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicHourRecord {
    pub chat_id: String,
    pub topic_id: i64,
    pub hour: String,
    pub chat_name: String,
    pub topic_name: String,
    pub message_count: u64,
    pub first_message_id: i64,
    pub last_message_id: i64,
    pub processed_at: String,
}

impl TopicHourRecord {
    pub fn header() -> &'static [&'static str] {
        &[
            "chat_id",
            "topic_id",
            "hour",
            "chat_name",
            "topic_name",
            "message_count",
            "first_message_id",
            "last_message_id",
            "processed_at",
        ]
    }

    pub fn into_row(self) -> Vec<String> {
        vec![
            self.chat_id,
            self.topic_id.to_string(),
            self.hour,
            self.chat_name,
            self.topic_name,
            self.message_count.to_string(),
            self.first_message_id.to_string(),
            self.last_message_id.to_string(),
            self.processed_at,
        ]
    }
}
