use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::data_schema::data::channels)]
pub struct NewChannel<'a> {
    pub id: Uuid,
    pub tenant: &'a str,
    pub tg_channel_id: Option<i64>,
    pub username: Option<&'a str>,
    pub title: Option<&'a str>,
    pub active: bool,
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Identifiable, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::channels)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbChannel {
    pub id: Uuid,
    pub tenant: String,
    pub tg_channel_id: Option<i64>,
    pub username: Option<String>,
    pub title: Option<String>,
    pub active: bool,
    pub last_parsed_at: Option<DateTime<Utc>>,
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl DbChannel {
    /// The reference the source gateway accepts: numeric id when we have
    /// one, else the username. A channel with neither is invalid by
    /// construction and rejected at subscribe time.
    pub fn source_ref(&self) -> Option<String> {
        if let Some(id) = self.tg_channel_id {
            Some(id.to_string())
        } else {
            self.username.clone()
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::data_schema::data::user_channel)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub channel_id: Uuid,
    pub active: bool,
}

#[derive(Debug, Identifiable, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::user_channel)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbSubscription {
    pub id: i64,
    pub user_id: Uuid,
    pub channel_id: Uuid,
    pub active: bool,
    pub subscribed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::data_schema::data::posts)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewPost<'a> {
    pub id: Uuid,
    pub tenant: &'a str,
    pub channel_id: Uuid,
    pub tg_message_id: i64,
    pub source: &'a str,
    pub posted_at: DateTime<Utc>,
    pub content: &'a str,
    pub word_count: i32,
    pub grouped_id: Option<i64>,
    pub forward_from_channel_id: Option<i64>,
    pub forward_from_message_id: Option<i64>,
    pub reply_to_message_id: Option<i64>,
    pub author: Option<&'a str>,
    pub expires_at: DateTime<Utc>,
    pub content_hash: &'a str,
    pub enrichment_status: &'a str,
}

#[derive(Debug, Clone, Identifiable, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::data_schema::data::posts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbPost {
    pub id: Uuid,
    pub tenant: String,
    pub channel_id: Uuid,
    pub tg_message_id: i64,
    pub source: String,
    pub posted_at: DateTime<Utc>,
    pub content: String,
    pub word_count: i32,
    pub grouped_id: Option<i64>,
    pub forward_from_channel_id: Option<i64>,
    pub forward_from_message_id: Option<i64>,
    pub reply_to_message_id: Option<i64>,
    pub author: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub content_hash: String,
    pub enrichment_status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::data_schema::data::media_objects)]
pub struct NewMediaObject<'a> {
    pub sha256: &'a str,
    pub tenant: &'a str,
    pub mime: &'a str,
    pub size_bytes: i64,
    pub s3_key: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::media_objects)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbMediaObject {
    pub sha256: String,
    pub tenant: String,
    pub mime: String,
    pub size_bytes: i64,
    pub s3_key: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::data_schema::data::post_media_map)]
pub struct NewPostMediaMap<'a> {
    pub post_id: Uuid,
    pub sha256: &'a str,
    pub position: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::data_schema::data::media_groups)]
pub struct NewMediaGroup<'a> {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub grouped_id: i64,
    pub items_count: i32,
    pub post_ids: Vec<Uuid>,
    pub media_types: Vec<&'a str>,
    pub media_sha256s: Vec<&'a str>,
}

#[derive(Debug, Clone, Identifiable, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::media_groups)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbMediaGroup {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub grouped_id: i64,
    pub items_count: i32,
    pub post_ids: Vec<Uuid>,
    pub media_types: Vec<String>,
    pub media_sha256s: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Identifiable, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::post_enrichment)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbPostEnrichment {
    pub id: i64,
    pub post_id: Uuid,
    pub kind: String,
    pub provider: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::indexing_status)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbIndexingStatus {
    pub post_id: Uuid,
    pub embedding_status: String,
    pub graph_status: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::data_schema::data::trend_clusters)]
pub struct NewTrendCluster<'a> {
    pub id: Uuid,
    pub tenant: &'a str,
    pub label: &'a str,
    pub primary_topic: &'a str,
    pub centroid: Vec<f64>,
    pub status: &'a str,
    pub is_generic: bool,
    pub coherence: f64,
    pub parent_id: Option<Uuid>,
    pub level: i32,
    pub freq_short: i64,
    pub baseline: f64,
    pub source_channels: Vec<Uuid>,
}

#[derive(Debug, Clone, Identifiable, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::trend_clusters)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbTrendCluster {
    pub id: Uuid,
    pub tenant: String,
    pub label: String,
    pub primary_topic: String,
    pub centroid: Vec<f64>,
    pub status: String,
    pub is_generic: bool,
    pub coherence: f64,
    pub parent_id: Option<Uuid>,
    pub level: i32,
    pub freq_short: i64,
    pub baseline: f64,
    pub source_channels: Vec<Uuid>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::data_schema::data::digest_history)]
pub struct NewDigestHistory<'a> {
    pub tenant: &'a str,
    pub user_id: Uuid,
    pub digest_date: NaiveDate,
    pub status: &'a str,
}

#[derive(Debug, Identifiable, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::digest_history)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbDigestHistory {
    pub id: i64,
    pub tenant: String,
    pub user_id: Uuid,
    pub digest_date: NaiveDate,
    pub status: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::info_schema::info::outbox_events)]
pub struct NewOutboxEvent<'a> {
    pub event_type: &'a str,
    pub aggregate_id: &'a str,
    pub content_hash: &'a str,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Identifiable, Queryable, Selectable)]
#[diesel(table_name = crate::info_schema::info::outbox_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbOutboxEvent {
    pub id: i64,
    pub event_type: String,
    pub aggregate_id: String,
    pub content_hash: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retries: i32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::info_schema::info::storage_usage)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbStorageUsage {
    pub id: i64,
    pub tenant: String,
    pub content_type: String,
    pub bytes: i64,
    pub objects: i64,
    pub last_updated: DateTime<Utc>,
}
