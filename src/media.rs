use crate::context::AppContext;
use crate::quota::{self, QuotaDecision};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tgclient::RawMedia;
use tgpulse_cas::media_key;
use tgpulse_db::db;
use tgpulse_db::models::NewMediaObject;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("error downloading media from the source gateway")]
    Fetch(#[from] tgclient::MediaFetchError),

    #[error("error talking to the blob store")]
    Cas(#[from] tgpulse_cas::CasError),

    #[error("database error during media processing")]
    Db(#[from] tgpulse_db::QueryError),

    #[error("couldn't get a database connection")]
    Pool(#[from] tgpulse_db::PoolError),

    #[error("quota check failed")]
    Quota(#[from] crate::quota::QuotaError),

    #[error("sha256 task was cancelled")]
    HashJoin(#[source] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct ProcessedMedia {
    pub sha256: String,
    pub s3_key: String,
    pub mime: String,
    pub size_bytes: i64,
    /// True when this call uploaded the blob and created the row, meaning
    /// the caller should emit the vision event for it.
    pub newly_stored: bool,
}

fn extension_for(media: &RawMedia) -> &str {
    if let Some(name) = &media.file_name {
        if let Some((_, ext)) = name.rsplit_once('.') {
            if !ext.is_empty() && ext.len() <= 5 {
                return ext;
            }
        }
    }
    match media.mime.as_str() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}

/// Downloads one attachment, dedups it by content hash, and makes sure the
/// blob is in the CAS with a `media_objects` row and accurate usage
/// counters. Returns None when the tenant's storage quota is exhausted
/// (terminal-skip: the post still persists, just without this blob).
pub async fn process_media(
    ctx: &AppContext,
    tenant: &str,
    media: &RawMedia,
) -> Result<Option<ProcessedMedia>, MediaError> {
    let body = ctx.tg.download_media(&media.file_ref).await?;
    let size_bytes = body.len() as i64;

    // Hashing a multi-megabyte video is real CPU work; keep it off the
    // scheduler threads.
    let (sha, body) = tokio::task::spawn_blocking(move || {
        let sha = format!("{:x}", Sha256::digest(&body));
        (sha, body)
    })
    .await
    .map_err(MediaError::HashJoin)?;

    let existing = {
        let mut conn = ctx.conn()?;
        db::get_media_object(&mut conn, &sha)?
    };
    if let Some(existing) = existing {
        debug!("Media {sha} already known, reusing {}", existing.s3_key);
        let mut conn = ctx.conn()?;
        let object = NewMediaObject {
            sha256: &sha,
            tenant,
            mime: &existing.mime,
            size_bytes: existing.size_bytes,
            s3_key: &existing.s3_key,
        };
        db::upsert_media_object(&mut conn, &object)?;
        return Ok(Some(ProcessedMedia {
            sha256: sha,
            s3_key: existing.s3_key,
            mime: existing.mime,
            size_bytes: existing.size_bytes,
            newly_stored: false,
        }));
    }

    if quota::check_quota_before_upload(ctx, tenant, size_bytes as u64)? == QuotaDecision::Exhausted
    {
        info!("Skipping media {sha} for tenant {tenant}: storage quota exhausted");
        return Ok(None);
    }

    let key = media_key(tenant, &sha, extension_for(media));

    // Content-addressed, so a pre-existing object is always the same bytes.
    if ctx.cas.head(&key).await?.is_none() {
        ctx.cas.put(&key, body, &media.mime).await?;
    } else {
        debug!("Blob {key} already in CAS, skipping upload");
    }

    let mut conn = ctx.conn()?;
    let object = NewMediaObject {
        sha256: &sha,
        tenant,
        mime: &media.mime,
        size_bytes,
        s3_key: &key,
    };
    let newly_stored = db::upsert_media_object(&mut conn, &object)?;
    if newly_stored {
        db::add_storage_usage(&mut conn, tenant, "media", size_bytes, 1)?;
        metrics::counter!("media_stored_total", "tenant" => tenant.to_string()).increment(1);
    } else {
        // Another worker won the insert race. Their accounting stands.
        warn!("Lost the media insert race for {sha}; not double-counting usage");
    }

    Ok(Some(ProcessedMedia {
        sha256: sha,
        s3_key: key,
        mime: media.mime.clone(),
        size_bytes,
        newly_stored,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(mime: &str, file_name: Option<&str>) -> RawMedia {
        RawMedia {
            file_ref: "ref".into(),
            mime: mime.into(),
            size_hint: None,
            file_name: file_name.map(|s| s.to_string()),
        }
    }

    #[test]
    fn extension_prefers_file_name() {
        assert_eq!(extension_for(&media("image/jpeg", Some("photo.jpeg"))), "jpeg");
        assert_eq!(extension_for(&media("image/jpeg", None)), "jpg");
        assert_eq!(extension_for(&media("application/x-unknown", None)), "bin");
        // A "file with no extension" name falls back to the mime mapping.
        assert_eq!(extension_for(&media("image/png", Some("photo"))), "png");
    }
}
