use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, stream};
use log::{debug, warn};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Longest we're willing to honor a single floodwait before giving up and
/// surfacing the error to the caller.
const MAX_FLOODWAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Error, Diagnostic)]
pub enum TgStreamError {
    #[error("background fetch task exited abnormally")]
    JoinFailure(#[source] tokio::task::JoinError),

    #[error("error building history request")]
    RequestBuildError(#[source] reqwest::Error),

    #[error("error executing history request")]
    RequestExecuteError(#[source] reqwest::Error),

    #[error("source gateway reported a server error")]
    GatewayStatusError(#[source] reqwest::Error),

    #[error("source gateway rejected our credentials")]
    Unauthorized,

    #[error("source gateway asked us to wait {0} seconds, which is over our limit")]
    FloodwaitTooLong(u64),

    #[error("error extracting response body")]
    RequestBodyError(#[source] reqwest::Error),

    #[error("error deserializing history response")]
    DeserializeError(#[source] serde_json::Error),
}

#[derive(Debug, Error, Diagnostic)]
pub enum MediaFetchError {
    #[error("error executing media download")]
    RequestExecuteError(#[source] reqwest::Error),

    #[error("source gateway reported a server error for media download")]
    GatewayStatusError(#[source] reqwest::Error),

    #[error("error reading media body")]
    BodyError(#[source] reqwest::Error),
}

/// One attachment on a message. `file_ref` is an opaque token the gateway
/// accepts on its download endpoint; it is only valid for a bounded time,
/// so callers should download promptly rather than persist it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMedia {
    pub file_ref: String,
    pub mime: String,
    #[serde(default)]
    pub size_hint: Option<u64>,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRef {
    pub from_channel_id: i64,
    #[serde(default)]
    pub from_channel_title: Option<String>,
    pub from_message_id: i64,
}

/// A message as the gateway reports it, before any normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub tg_message_id: i64,
    #[serde(default)]
    pub text: Option<String>,
    pub posted_at: DateTime<Utc>,
    #[serde(default)]
    pub media: Vec<RawMedia>,
    #[serde(default)]
    pub forward: Option<ForwardRef>,
    #[serde(default)]
    pub reply_to_message_id: Option<i64>,
    #[serde(default)]
    pub grouped_id: Option<i64>,
    #[serde(default)]
    pub author: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryPage {
    items: Vec<RawMessage>,
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct FloodwaitBody {
    retry_after: u64,
}

/// Client for the message-source gateway. The inner reqwest client is
/// reference counted, so cloning is cheap and all clones share one
/// connection pool.
#[derive(Clone)]
pub struct TgClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    page_size: usize,
}

impl TgClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, page_size: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            page_size,
        }
    }

    /// Stream of messages for one channel, oldest first, starting at
    /// `since`. The gateway treats `since` as inclusive, so callers that
    /// resume from a stored cursor will see the boundary message again and
    /// must rely on their own dedup.
    pub fn history(
        &self,
        channel_ref: String,
        since: DateTime<Utc>,
    ) -> impl Stream<Item = Result<RawMessage, TgStreamError>> {
        self.pages(channel_ref, since).flat_map(|page| match page {
            Ok(items) => stream::iter(items.into_iter().map(Ok)).left_stream(),
            Err(e) => stream::once(async { Err(e) }).right_stream(),
        })
    }

    fn pages(
        &self,
        channel_ref: String,
        since: DateTime<Utc>,
    ) -> impl Stream<Item = Result<Vec<RawMessage>, TgStreamError>> {
        let page_size = self.page_size;
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let token = self.token.clone();

        // Eagerly fetch the next page while the caller is busy with the
        // current one. A read-ahead buffer of depth one.
        let first = tokio::spawn({
            let channel_ref = channel_ref.clone();
            async move { fetch_page(client, base_url, token, channel_ref, since, page_size, None) }
        });

        stream::unfold(Some(first), move |pending| {
            async move {
                let pending = pending?;

                // Double nesting: the join can fail, and the joined task can
                // itself have produced an error.
                let (ctx, page) = match pending.await {
                    Ok(fut) => match fut.await {
                        Ok(ok) => ok,
                        Err(err) => {
                            debug!("History page stream yielding an error");
                            return Some((Err(err), None));
                        }
                    },
                    Err(err) => {
                        return Some((Err(TgStreamError::JoinFailure(err)), None));
                    }
                };

                match page.next_cursor {
                    Some(cursor) if page.items.len() >= ctx.page_size => {
                        let next = tokio::spawn(async move {
                            fetch_page(
                                ctx.client,
                                ctx.base_url,
                                ctx.token,
                                ctx.channel_ref,
                                ctx.since,
                                ctx.page_size,
                                Some(cursor),
                            )
                        });
                        Some((Ok(page.items), Some(next)))
                    }
                    _ => {
                        debug!("Yielding the last history page");
                        Some((Ok(page.items), None))
                    }
                }
            }
        })
    }

    /// Download one media attachment. The gateway streams the bytes back
    /// directly; dedup and storage are the caller's concern.
    pub async fn download_media(&self, file_ref: &str) -> Result<Bytes, MediaFetchError> {
        let url = format!("{}/v1/media/{}", self.base_url, file_ref);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(MediaFetchError::RequestExecuteError)?
            .error_for_status()
            .map_err(MediaFetchError::GatewayStatusError)?;

        response.bytes().await.map_err(MediaFetchError::BodyError)
    }
}

/// Everything `fetch_page` needs to hand to the next spawn. Threading it
/// back out through the result keeps the unfold closure free of lifetime
/// trouble.
struct FetchCtx {
    client: reqwest::Client,
    base_url: String,
    token: String,
    channel_ref: String,
    since: DateTime<Utc>,
    page_size: usize,
}

async fn fetch_page(
    client: reqwest::Client,
    base_url: String,
    token: String,
    channel_ref: String,
    since: DateTime<Utc>,
    page_size: usize,
    cursor: Option<String>,
) -> Result<(FetchCtx, HistoryPage), TgStreamError> {
    let url = format!("{base_url}/v1/channels/{channel_ref}/messages");

    loop {
        debug!("Fetching history page {cursor:?} for {channel_ref} since {since}");

        let page_size_string = page_size.to_string();
        let mut request_builder = client.get(&url).bearer_auth(&token).query(&[
            ("since", &since.to_rfc3339()),
            ("count", &page_size_string),
            ("order", &"asc".to_string()),
        ]);

        if let Some(cursor) = &cursor {
            request_builder = request_builder.query(&[("cursor", cursor)]);
        }

        let request = request_builder
            .build()
            .map_err(TgStreamError::RequestBuildError)?;

        let response = client
            .execute(request)
            .await
            .map_err(TgStreamError::RequestExecuteError)?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            // Floodwait. The gateway tells us exactly how long to sleep, and
            // honoring it does not count against any retry budget.
            let advised = response
                .json::<FloodwaitBody>()
                .await
                .map(|b| b.retry_after)
                .unwrap_or(5);
            if Duration::from_secs(advised) > MAX_FLOODWAIT {
                return Err(TgStreamError::FloodwaitTooLong(advised));
            }
            warn!("Floodwait on {channel_ref}: sleeping {advised}s as advised");
            tokio::time::sleep(Duration::from_secs(advised)).await;
            continue;
        }

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(TgStreamError::Unauthorized);
        }

        let response = response
            .error_for_status()
            .map_err(TgStreamError::GatewayStatusError)?;

        let body = response
            .text()
            .await
            .map_err(TgStreamError::RequestBodyError)?;

        let page: HistoryPage =
            serde_json::from_str(&body).map_err(TgStreamError::DeserializeError)?;

        let ctx = FetchCtx {
            client,
            base_url,
            token,
            channel_ref,
            since,
            page_size,
        };
        return Ok((ctx, page));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_message_defaults_optional_fields() {
        let msg: RawMessage =
            serde_json::from_str(r#"{"tg_message_id": 100, "posted_at": "2026-01-05T10:00:00Z"}"#)
                .expect("minimal message must deserialize");

        assert_eq!(msg.tg_message_id, 100);
        assert!(msg.text.is_none());
        assert!(msg.media.is_empty());
        assert!(msg.grouped_id.is_none());
    }

    #[test]
    fn history_page_roundtrip() {
        let page = HistoryPage {
            items: vec![RawMessage {
                tg_message_id: 7,
                text: Some("hello".into()),
                posted_at: "2026-01-05T10:00:00Z".parse().unwrap(),
                media: vec![RawMedia {
                    file_ref: "abc".into(),
                    mime: "image/jpeg".into(),
                    size_hint: Some(1024),
                    file_name: Some("photo.jpg".into()),
                }],
                forward: None,
                reply_to_message_id: Some(6),
                grouped_id: None,
                author: None,
            }],
            next_cursor: Some("tok".into()),
        };

        let encoded = serde_json::to_string(&page).unwrap();
        let decoded: HistoryPage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.items.len(), 1);
        assert_eq!(decoded.items[0].tg_message_id, 7);
        assert_eq!(decoded.next_cursor.as_deref(), Some("tok"));
    }
}
