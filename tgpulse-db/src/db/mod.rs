// Third-party imports
use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::upsert::excluded;
use diesel::{PgConnection, prelude::*, sql_query, sql_types::*};
use itertools::Itertools;
use log::debug;
use thiserror::Error;
use uuid::Uuid;
// First-party imports
use crate::models::{
    DbChannel, DbIndexingStatus, DbMediaGroup, DbMediaObject, DbOutboxEvent, DbPost,
    DbPostEnrichment, DbStorageUsage, DbTrendCluster, NewChannel, NewDigestHistory, NewMediaGroup,
    NewMediaObject, NewOutboxEvent, NewPost, NewPostMediaMap, NewSubscription, NewTrendCluster,
};
use crate::statuses::{ClusterStatus, DigestStatus, EnrichmentStatus, IndexStatus};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Diesel(#[from] diesel::result::Error),
}

impl QueryError {
    /// Unique-index hits are how idempotent replays surface; callers treat
    /// them as success.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            QueryError::Diesel(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            ))
        )
    }
}

pub type QueryResult<T> = Result<T, QueryError>;

/// `alter role` can't be parameterized, but an i64's Display output can't
/// contain a quote, so formatting it in is safe.
pub fn set_statement_timeout(conn: &mut PgConnection, timeout_seconds: i64) -> QueryResult<()> {
    sql_query(format!(
        "alter role CURRENT_USER set statement_timeout='{}s'",
        timeout_seconds
    ))
    .execute(conn)?;
    Ok(())
}

/// Binds the row-level-security session variable. Must be called on every
/// fresh connection before touching tenant-scoped tables.
pub fn set_current_tenant(conn: &mut PgConnection, tenant: &str) -> QueryResult<()> {
    sql_query("select set_config('app.current_tenant', $1, false)")
        .bind::<Text, _>(tenant)
        .execute(conn)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Channels and subscriptions
// ---------------------------------------------------------------------------

pub fn create_channel(conn: &mut PgConnection, channel: &NewChannel) -> QueryResult<Uuid> {
    use crate::data_schema::data::channels::dsl;

    let id = diesel::insert_into(dsl::channels)
        .values(channel)
        .returning(dsl::id)
        .get_result(conn)?;
    Ok(id)
}

pub fn get_channel(conn: &mut PgConnection, channel_id: Uuid) -> QueryResult<Option<DbChannel>> {
    use crate::data_schema::data::channels::dsl;

    let channel = dsl::channels
        .filter(dsl::id.eq(channel_id))
        .select(DbChannel::as_select())
        .first(conn)
        .optional()?;
    Ok(channel)
}

/// Channels eligible for a parse pass, most-stale first. Channels that have
/// never been parsed sort before everything else.
pub fn due_channels(conn: &mut PgConnection, limit: i64) -> QueryResult<Vec<DbChannel>> {
    use crate::data_schema::data::channels::dsl;

    let channels = dsl::channels
        .filter(dsl::active.eq(true))
        .order((dsl::last_parsed_at.asc().nulls_first(), dsl::created_at.asc()))
        .limit(limit)
        .select(DbChannel::as_select())
        .get_results(conn)?;
    Ok(channels)
}

/// Advances `last_parsed_at`, but never backwards. The row lock serializes
/// concurrent parse jobs for the same channel.
pub fn advance_last_parsed_at(
    conn: &mut PgConnection,
    channel_id: Uuid,
    parsed_at: DateTime<Utc>,
) -> QueryResult<usize> {
    use crate::data_schema::data::channels::dsl;

    let updated = diesel::update(dsl::channels)
        .filter(dsl::id.eq(channel_id))
        .filter(
            dsl::last_parsed_at
                .is_null()
                .or(dsl::last_parsed_at.lt(parsed_at)),
        )
        .set(dsl::last_parsed_at.eq(parsed_at))
        .execute(conn)?;
    Ok(updated)
}

pub fn deactivate_channel(conn: &mut PgConnection, channel_id: Uuid) -> QueryResult<usize> {
    use crate::data_schema::data::channels::dsl;

    let updated = diesel::update(dsl::channels)
        .filter(dsl::id.eq(channel_id))
        .set(dsl::active.eq(false))
        .execute(conn)?;
    Ok(updated)
}

/// Only the explicit subscribe operation creates rows here. The parser
/// checks for existence and refuses to persist for unsubscribed channels.
pub fn subscribe(conn: &mut PgConnection, sub: &NewSubscription) -> QueryResult<usize> {
    use crate::data_schema::data::user_channel::dsl;

    let inserted = diesel::insert_into(dsl::user_channel)
        .values(sub)
        .on_conflict((dsl::user_id, dsl::channel_id))
        .do_update()
        .set(dsl::active.eq(true))
        .execute(conn)?;
    Ok(inserted)
}

pub fn has_active_subscription(conn: &mut PgConnection, channel: Uuid) -> QueryResult<bool> {
    use crate::data_schema::data::user_channel::dsl;

    let n: i64 = dsl::user_channel
        .filter(dsl::channel_id.eq(channel))
        .filter(dsl::active.eq(true))
        .select(count_star())
        .get_result(conn)?;
    Ok(n > 0)
}

// ---------------------------------------------------------------------------
// Posts: idempotent batch persistence
// ---------------------------------------------------------------------------

pub struct ParsedBatch<'a> {
    pub posts: Vec<NewPost<'a>>,
    pub media_map: Vec<NewPostMediaMap<'a>>,
    pub media_groups: Vec<NewMediaGroup<'a>>,
    /// Outbox rows keyed by the post id in `aggregate_id`. Rows whose post
    /// turned out to be a duplicate are dropped rather than published twice.
    pub outbox: Vec<NewOutboxEvent<'a>>,
    /// Outbox rows that publish regardless of post-insert outcome
    /// (media uploads are deduplicated by sha256, not by post).
    pub outbox_unconditional: Vec<NewOutboxEvent<'a>>,
}

pub struct BatchOutcome {
    pub posts_inserted: usize,
    pub posts_duplicate: usize,
    pub outbox_inserted: usize,
}

/// The aggregate ids whose conditional outbox rows should publish: the
/// posts that were actually inserted, plus any album with at least one
/// inserted member post (the album's own group id is its aggregate id).
/// A fully duplicate batch keeps all of its events suppressed.
fn relayable_aggregates(
    inserted: &hashbrown::HashSet<Uuid>,
    media_groups: &[NewMediaGroup],
) -> hashbrown::HashSet<String> {
    let mut aggregates: hashbrown::HashSet<String> =
        inserted.iter().map(Uuid::to_string).collect();
    aggregates.extend(
        media_groups
            .iter()
            .filter(|g| g.post_ids.iter().any(|id| inserted.contains(id)))
            .map(|g| g.id.to_string()),
    );
    aggregates
}

/// Saves one parse batch in a single transaction: posts (conflict-skipped on
/// `(channel_id, tg_message_id)`), media mappings, album records, and the
/// outbox rows that make event publication atomic with the write. Replaying
/// the same batch is a no-op apart from `last_seen_at` bumps.
pub fn insert_parsed_batch(
    conn: &mut PgConnection,
    batch: &ParsedBatch,
) -> QueryResult<BatchOutcome> {
    use crate::data_schema::data::media_groups::dsl as groups_dsl;
    use crate::data_schema::data::post_media_map::dsl as map_dsl;
    use crate::data_schema::data::posts::dsl as posts_dsl;

    let outcome = conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let inserted_ids: Vec<Uuid> = diesel::insert_into(posts_dsl::posts)
            .values(&batch.posts)
            .on_conflict((posts_dsl::channel_id, posts_dsl::tg_message_id))
            .do_nothing()
            .returning(posts_dsl::id)
            .get_results(conn)?;

        let inserted: hashbrown::HashSet<Uuid> = inserted_ids.iter().copied().collect();

        let media_map = batch
            .media_map
            .iter()
            .filter(|m| inserted.contains(&m.post_id))
            .collect_vec();
        if !media_map.is_empty() {
            diesel::insert_into(map_dsl::post_media_map)
                .values(media_map)
                .on_conflict_do_nothing()
                .execute(conn)?;
        }

        if !batch.media_groups.is_empty() {
            diesel::insert_into(groups_dsl::media_groups)
                .values(&batch.media_groups)
                .on_conflict((groups_dsl::channel_id, groups_dsl::grouped_id))
                .do_nothing()
                .execute(conn)?;
        }

        let aggregates = relayable_aggregates(&inserted, &batch.media_groups);
        let outbox = batch
            .outbox
            .iter()
            .filter(|e| aggregates.contains(e.aggregate_id))
            .chain(batch.outbox_unconditional.iter())
            .collect_vec();
        let outbox_inserted = insert_outbox_rows(conn, &outbox)?;

        Ok(BatchOutcome {
            posts_inserted: inserted_ids.len(),
            posts_duplicate: batch.posts.len() - inserted_ids.len(),
            outbox_inserted,
        })
    })?;

    debug!(
        "Persisted batch: {} posts inserted, {} duplicates, {} outbox rows",
        outcome.posts_inserted, outcome.posts_duplicate, outcome.outbox_inserted
    );
    Ok(outcome)
}

pub fn get_post(conn: &mut PgConnection, post_id: Uuid) -> QueryResult<Option<DbPost>> {
    use crate::data_schema::data::posts::dsl;

    let post = dsl::posts
        .filter(dsl::id.eq(post_id))
        .select(DbPost::as_select())
        .first(conn)
        .optional()?;
    Ok(post)
}

/// Single round trip for the common stage preamble: the post plus its channel.
pub fn get_post_with_channel(
    conn: &mut PgConnection,
    post_id: Uuid,
) -> QueryResult<Option<(DbPost, DbChannel)>> {
    use crate::data_schema::data::channels::dsl as channels_dsl;
    use crate::data_schema::data::posts::dsl as posts_dsl;

    let row = posts_dsl::posts
        .inner_join(channels_dsl::channels)
        .filter(posts_dsl::id.eq(post_id))
        .select((DbPost::as_select(), DbChannel::as_select()))
        .first(conn)
        .optional()?;
    Ok(row)
}

/// Monotonic status transition. Returns false when the post was already at
/// or past the target (a replayed event), which callers treat as success.
pub fn transition_enrichment_status(
    conn: &mut PgConnection,
    post_id: Uuid,
    to: EnrichmentStatus,
) -> QueryResult<bool> {
    use crate::data_schema::data::posts::dsl;

    let allowed = to
        .allowed_predecessors()
        .iter()
        .map(|s| s.to_string())
        .collect_vec();

    let updated = diesel::update(dsl::posts)
        .filter(dsl::id.eq(post_id))
        .filter(dsl::enrichment_status.eq_any(allowed))
        .set(dsl::enrichment_status.eq(to.to_string()))
        .execute(conn)?;
    Ok(updated > 0)
}

pub fn delete_expired_posts(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> QueryResult<usize> {
    // Diesel has no DELETE ... LIMIT, so go through a subselect.
    let deleted = sql_query(
        "delete from data.posts where id in \
         (select id from data.posts where expires_at < $1 limit $2)",
    )
    .bind::<Timestamptz, _>(now)
    .bind::<BigInt, _>(limit)
    .execute(conn)?;
    Ok(deleted)
}

/// Posts for a digest window, newest first.
pub fn posts_in_window(
    conn: &mut PgConnection,
    for_tenant: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> QueryResult<Vec<DbPost>> {
    use crate::data_schema::data::posts::dsl;

    let posts = dsl::posts
        .filter(dsl::tenant.eq(for_tenant))
        .filter(dsl::posted_at.ge(from))
        .filter(dsl::posted_at.lt(to))
        .order(dsl::posted_at.desc())
        .select(DbPost::as_select())
        .get_results(conn)?;
    Ok(posts)
}

/// `posted_at` history for the adaptive-threshold statistics window.
pub fn channel_posted_at_window(
    conn: &mut PgConnection,
    channel: Uuid,
    since: DateTime<Utc>,
) -> QueryResult<Vec<DateTime<Utc>>> {
    use crate::data_schema::data::posts::dsl;

    let stamps = dsl::posts
        .filter(dsl::channel_id.eq(channel))
        .filter(dsl::posted_at.ge(since))
        .order(dsl::posted_at.asc())
        .select(dsl::posted_at)
        .get_results(conn)?;
    Ok(stamps)
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

pub fn get_media_object(
    conn: &mut PgConnection,
    sha: &str,
) -> QueryResult<Option<DbMediaObject>> {
    use crate::data_schema::data::media_objects::dsl;

    let object = dsl::media_objects
        .filter(dsl::sha256.eq(sha))
        .select(DbMediaObject::as_select())
        .first(conn)
        .optional()?;
    Ok(object)
}

/// One row per unique blob. A re-seen blob only bumps `last_seen_at`;
/// returns true when the row was newly created (caller then owns the CAS
/// upload and the usage accounting).
pub fn upsert_media_object(conn: &mut PgConnection, object: &NewMediaObject) -> QueryResult<bool> {
    use crate::data_schema::data::media_objects::dsl;

    let inserted: Option<String> = diesel::insert_into(dsl::media_objects)
        .values(object)
        .on_conflict(dsl::sha256)
        .do_nothing()
        .returning(dsl::sha256)
        .get_results(conn)?
        .into_iter()
        .next();

    if inserted.is_none() {
        diesel::update(dsl::media_objects)
            .filter(dsl::sha256.eq(object.sha256))
            .set(dsl::last_seen_at.eq(diesel::dsl::now))
            .execute(conn)?;
    }
    Ok(inserted.is_some())
}

/// All media objects referenced by one post, in slot order.
pub fn post_media_objects(
    conn: &mut PgConnection,
    post: Uuid,
) -> QueryResult<Vec<DbMediaObject>> {
    use crate::data_schema::data::media_objects::dsl as media_dsl;
    use crate::data_schema::data::post_media_map::dsl as map_dsl;

    let objects = map_dsl::post_media_map
        .inner_join(
            media_dsl::media_objects.on(media_dsl::sha256.eq(map_dsl::sha256)),
        )
        .filter(map_dsl::post_id.eq(post))
        .order(map_dsl::position.asc())
        .select(DbMediaObject::as_select())
        .get_results(conn)?;
    Ok(objects)
}

pub fn get_media_group(
    conn: &mut PgConnection,
    channel: Uuid,
    grouped_id: i64,
) -> QueryResult<Option<DbMediaGroup>> {
    use crate::data_schema::data::media_groups::dsl;

    let group = dsl::media_groups
        .filter(dsl::channel_id.eq(channel))
        .filter(dsl::grouped_id.eq(grouped_id))
        .select(DbMediaGroup::as_select())
        .first(conn)
        .optional()?;
    Ok(group)
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// UPSERT on `(post_id, kind)`. The payload is bound as text and cast inside
/// the statement; NULL travels as the empty string through NULLIF so the
/// driver's parameter-type inference stays stable.
pub fn upsert_enrichment(
    conn: &mut PgConnection,
    post_id: Uuid,
    kind: &str,
    provider: &str,
    data: Option<&serde_json::Value>,
) -> QueryResult<usize> {
    let data_text = data.map(|d| d.to_string()).unwrap_or_default();

    let n = sql_query(
        "insert into data.post_enrichment (post_id, kind, provider, data) \
         values ($1, $2, $3, coalesce(nullif($4, '')::jsonb, '{}'::jsonb)) \
         on conflict (post_id, kind) do update \
         set provider = excluded.provider, data = excluded.data, created_at = now()",
    )
    .bind::<diesel::sql_types::Uuid, _>(post_id)
    .bind::<Text, _>(kind)
    .bind::<Text, _>(provider)
    .bind::<Text, _>(data_text)
    .execute(conn)?;
    Ok(n)
}

pub fn get_enrichment(
    conn: &mut PgConnection,
    post_id: Uuid,
    kind: &str,
) -> QueryResult<Option<DbPostEnrichment>> {
    use crate::data_schema::data::post_enrichment::dsl;

    let row = dsl::post_enrichment
        .filter(dsl::post_id.eq(post_id))
        .filter(dsl::kind.eq(kind))
        .select(DbPostEnrichment::as_select())
        .first(conn)
        .optional()?;
    Ok(row)
}

// ---------------------------------------------------------------------------
// Indexing status
// ---------------------------------------------------------------------------

pub fn get_indexing_status(
    conn: &mut PgConnection,
    post_id: Uuid,
) -> QueryResult<Option<DbIndexingStatus>> {
    use crate::data_schema::data::indexing_status::dsl;

    let row = dsl::indexing_status
        .filter(dsl::post_id.eq(post_id))
        .select(DbIndexingStatus::as_select())
        .first(conn)
        .optional()?;
    Ok(row)
}

pub fn set_embedding_status(
    conn: &mut PgConnection,
    post_id: Uuid,
    status: IndexStatus,
    error: Option<&str>,
) -> QueryResult<usize> {
    use crate::data_schema::data::indexing_status::dsl;

    let bump_retry = matches!(status, IndexStatus::Failed);
    let updated = diesel::update(dsl::indexing_status)
        .filter(dsl::post_id.eq(post_id))
        .set((
            dsl::embedding_status.eq(status.to_string()),
            dsl::last_error.eq(error),
            dsl::retry_count.eq(dsl::retry_count + if bump_retry { 1 } else { 0 }),
            dsl::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)?;
    Ok(updated)
}

pub fn set_graph_status(
    conn: &mut PgConnection,
    post_id: Uuid,
    status: IndexStatus,
    error: Option<&str>,
) -> QueryResult<usize> {
    use crate::data_schema::data::indexing_status::dsl;

    let updated = diesel::update(dsl::indexing_status)
        .filter(dsl::post_id.eq(post_id))
        .set((
            dsl::graph_status.eq(status.to_string()),
            dsl::last_error.eq(error),
            dsl::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)?;
    Ok(updated)
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

pub(crate) fn insert_outbox_rows(
    conn: &mut PgConnection,
    rows: &[&NewOutboxEvent],
) -> Result<usize, diesel::result::Error> {
    use crate::info_schema::info::outbox_events::dsl;

    if rows.is_empty() {
        return Ok(0);
    }
    // The partial unique index on (aggregate_id, event_type, content_hash)
    // where processed_at is null absorbs duplicate publishes.
    diesel::insert_into(dsl::outbox_events)
        .values(rows.to_vec())
        .on_conflict_do_nothing()
        .execute(conn)
}

pub fn insert_outbox_event(conn: &mut PgConnection, event: &NewOutboxEvent) -> QueryResult<usize> {
    Ok(insert_outbox_rows(conn, &[event])?)
}

/// Claims a batch of unprocessed outbox rows for the relay. SKIP LOCKED lets
/// several relay instances coexist without double-publishing.
pub fn claim_outbox_batch(
    conn: &mut PgConnection,
    limit: i64,
) -> QueryResult<Vec<DbOutboxEvent>> {
    use crate::info_schema::info::outbox_events::dsl;

    let rows = dsl::outbox_events
        .filter(dsl::processed_at.is_null())
        .order(dsl::created_at.asc())
        .limit(limit)
        .for_update()
        .skip_locked()
        .select(DbOutboxEvent::as_select())
        .get_results(conn)?;
    Ok(rows)
}

pub fn mark_outbox_processed(conn: &mut PgConnection, ids: &[i64]) -> QueryResult<usize> {
    use crate::info_schema::info::outbox_events::dsl;

    if ids.is_empty() {
        return Ok(0);
    }
    let updated = diesel::update(dsl::outbox_events)
        .filter(dsl::id.eq_any(ids))
        .set(dsl::processed_at.eq(diesel::dsl::now))
        .execute(conn)?;
    Ok(updated)
}

pub fn record_outbox_failure(
    conn: &mut PgConnection,
    id: i64,
    error: &str,
) -> QueryResult<usize> {
    use crate::info_schema::info::outbox_events::dsl;

    let updated = diesel::update(dsl::outbox_events)
        .filter(dsl::id.eq(id))
        .set((
            dsl::retries.eq(dsl::retries + 1),
            dsl::last_error.eq(error),
        ))
        .execute(conn)?;
    Ok(updated)
}

// ---------------------------------------------------------------------------
// Stage idempotency
// ---------------------------------------------------------------------------

pub fn is_processed(conn: &mut PgConnection, idempotency_key: &str) -> QueryResult<bool> {
    use crate::info_schema::info::processed_events::dsl;

    let n: i64 = dsl::processed_events
        .filter(dsl::idempotency_key.eq(idempotency_key))
        .select(count_star())
        .get_result(conn)?;
    Ok(n > 0)
}

/// Records an idempotency key for a stage. Returns false when the key was
/// already present, meaning the side effect already happened and the caller
/// should ack without re-doing it.
pub fn try_mark_processed(
    conn: &mut PgConnection,
    idempotency_key: &str,
    stage: &str,
) -> QueryResult<bool> {
    use crate::info_schema::info::processed_events::dsl;

    let inserted = diesel::insert_into(dsl::processed_events)
        .values((
            dsl::idempotency_key.eq(idempotency_key),
            dsl::stage.eq(stage),
        ))
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(inserted > 0)
}

// ---------------------------------------------------------------------------
// Storage usage
// ---------------------------------------------------------------------------

/// UPSERT with increment arithmetic, inside whatever transaction the caller
/// holds. Deltas may be negative (reclaimed space).
pub fn add_storage_usage(
    conn: &mut PgConnection,
    tenant: &str,
    content_type: &str,
    bytes_delta: i64,
    objects_delta: i64,
) -> QueryResult<usize> {
    use crate::info_schema::info::storage_usage::dsl;

    let n = diesel::insert_into(dsl::storage_usage)
        .values((
            dsl::tenant.eq(tenant),
            dsl::content_type.eq(content_type),
            dsl::bytes.eq(bytes_delta),
            dsl::objects.eq(objects_delta),
        ))
        .on_conflict((dsl::tenant, dsl::content_type))
        .do_update()
        .set((
            dsl::bytes.eq(dsl::bytes + excluded(dsl::bytes)),
            dsl::objects.eq(dsl::objects + excluded(dsl::objects)),
            dsl::last_updated.eq(diesel::dsl::now),
        ))
        .execute(conn)?;
    Ok(n)
}

pub fn get_storage_usage(
    conn: &mut PgConnection,
    tenant: &str,
    content_type: &str,
) -> QueryResult<Option<DbStorageUsage>> {
    use crate::info_schema::info::storage_usage::dsl;

    let row = dsl::storage_usage
        .filter(dsl::tenant.eq(tenant))
        .filter(dsl::content_type.eq(content_type))
        .select(DbStorageUsage::as_select())
        .first(conn)
        .optional()?;
    Ok(row)
}

/// Reconciliation overwrite: the caller has re-listed the CAS prefix and
/// hands us ground truth.
pub fn set_storage_usage(
    conn: &mut PgConnection,
    tenant: &str,
    content_type: &str,
    bytes: i64,
    objects: i64,
) -> QueryResult<usize> {
    use crate::info_schema::info::storage_usage::dsl;

    let n = diesel::insert_into(dsl::storage_usage)
        .values((
            dsl::tenant.eq(tenant),
            dsl::content_type.eq(content_type),
            dsl::bytes.eq(bytes),
            dsl::objects.eq(objects),
        ))
        .on_conflict((dsl::tenant, dsl::content_type))
        .do_update()
        .set((
            dsl::bytes.eq(bytes),
            dsl::objects.eq(objects),
            dsl::last_updated.eq(diesel::dsl::now),
        ))
        .execute(conn)?;
    Ok(n)
}

// ---------------------------------------------------------------------------
// Trend clusters
// ---------------------------------------------------------------------------

pub fn active_clusters(conn: &mut PgConnection, for_tenant: &str) -> QueryResult<Vec<DbTrendCluster>> {
    use crate::data_schema::data::trend_clusters::dsl;

    let clusters = dsl::trend_clusters
        .filter(dsl::tenant.eq(for_tenant))
        .filter(dsl::status.ne(ClusterStatus::Closed.to_string()))
        .select(DbTrendCluster::as_select())
        .get_results(conn)?;
    Ok(clusters)
}

pub fn insert_cluster(conn: &mut PgConnection, cluster: &NewTrendCluster) -> QueryResult<usize> {
    use crate::data_schema::data::trend_clusters::dsl;

    let n = diesel::insert_into(dsl::trend_clusters)
        .values(cluster)
        .execute(conn)?;
    Ok(n)
}

pub fn update_cluster_stats(
    conn: &mut PgConnection,
    cluster_id: Uuid,
    freq_short: i64,
    baseline: f64,
    coherence: f64,
    source_channels: &[Uuid],
    last_activity_at: DateTime<Utc>,
) -> QueryResult<usize> {
    use crate::data_schema::data::trend_clusters::dsl;

    let n = diesel::update(dsl::trend_clusters)
        .filter(dsl::id.eq(cluster_id))
        .set((
            dsl::freq_short.eq(freq_short),
            dsl::baseline.eq(baseline),
            dsl::coherence.eq(coherence),
            dsl::source_channels.eq(source_channels),
            dsl::last_activity_at.eq(last_activity_at),
        ))
        .execute(conn)?;
    Ok(n)
}

pub fn set_cluster_cooldown(
    conn: &mut PgConnection,
    cluster_id: Uuid,
    until: DateTime<Utc>,
) -> QueryResult<usize> {
    use crate::data_schema::data::trend_clusters::dsl;

    let n = diesel::update(dsl::trend_clusters)
        .filter(dsl::id.eq(cluster_id))
        .set((
            dsl::cooldown_until.eq(until),
            dsl::status.eq(ClusterStatus::Emerging.to_string()),
        ))
        .execute(conn)?;
    Ok(n)
}

// ---------------------------------------------------------------------------
// Digest history
// ---------------------------------------------------------------------------

/// Inserts a digest-history row unless one already exists for
/// `(user, digest_date)`. Returns the new row id, or None when the insert
/// was deduplicated (the double-click case).
pub fn try_insert_digest_history(
    conn: &mut PgConnection,
    row: &NewDigestHistory,
) -> QueryResult<Option<i64>> {
    use crate::data_schema::data::digest_history::dsl;

    let id = diesel::insert_into(dsl::digest_history)
        .values(row)
        .on_conflict((dsl::user_id, dsl::digest_date))
        .do_nothing()
        .returning(dsl::id)
        .get_results(conn)?
        .into_iter()
        .next();
    Ok(id)
}

pub fn update_digest_status(
    conn: &mut PgConnection,
    id: i64,
    status: DigestStatus,
    detail: Option<&str>,
    sent_at: Option<DateTime<Utc>>,
) -> QueryResult<usize> {
    use crate::data_schema::data::digest_history::dsl;

    let n = diesel::update(dsl::digest_history)
        .filter(dsl::id.eq(id))
        .set((
            dsl::status.eq(status.to_string()),
            dsl::detail.eq(detail),
            dsl::sent_at.eq(sent_at),
        ))
        .execute(conn)?;
    Ok(n)
}

// ---------------------------------------------------------------------------
// Counts used by health reporting
// ---------------------------------------------------------------------------

pub fn post_count(conn: &mut PgConnection) -> QueryResult<i64> {
    use crate::data_schema::data::posts::dsl::*;

    Ok(posts.count().get_result(conn)?)
}

pub fn unprocessed_outbox_count(conn: &mut PgConnection) -> QueryResult<i64> {
    use crate::info_schema::info::outbox_events::dsl;

    Ok(dsl::outbox_events
        .filter(dsl::processed_at.is_null())
        .count()
        .get_result(conn)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: Uuid, post_ids: Vec<Uuid>) -> NewMediaGroup<'static> {
        NewMediaGroup {
            id,
            channel_id: Uuid::nil(),
            grouped_id: 7,
            items_count: post_ids.len() as i32,
            post_ids,
            media_types: vec!["image/jpeg"; 2],
            media_sha256s: vec!["aa", "bb"],
        }
    }

    #[test]
    fn relayable_aggregates_keep_posts_and_their_albums() {
        let post_a = Uuid::new_v4();
        let post_b = Uuid::new_v4();
        let album = Uuid::new_v4();

        let inserted: hashbrown::HashSet<Uuid> = [post_a, post_b].into_iter().collect();
        let groups = [group(album, vec![post_a, post_b])];

        let aggregates = relayable_aggregates(&inserted, &groups);
        assert!(aggregates.contains(&post_a.to_string()));
        assert!(aggregates.contains(&post_b.to_string()));
        // The album's event rides on its member posts being new, even
        // though the group id itself is never a post id.
        assert!(aggregates.contains(&album.to_string()));
    }

    #[test]
    fn duplicate_batch_relays_nothing() {
        let album = Uuid::new_v4();
        let groups = [group(album, vec![Uuid::new_v4(), Uuid::new_v4()])];

        let aggregates = relayable_aggregates(&hashbrown::HashSet::new(), &groups);
        assert!(aggregates.is_empty());
    }

    #[test]
    fn partially_duplicate_album_still_relays_once() {
        let fresh = Uuid::new_v4();
        let replayed = Uuid::new_v4();
        let album = Uuid::new_v4();

        let inserted: hashbrown::HashSet<Uuid> = [fresh].into_iter().collect();
        let groups = [group(album, vec![fresh, replayed])];

        let aggregates = relayable_aggregates(&inserted, &groups);
        assert!(aggregates.contains(&album.to_string()));
        assert!(!aggregates.contains(&replayed.to_string()));
    }
}
