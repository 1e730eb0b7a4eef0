use chrono::{DateTime, NaiveDate, Utc};
use miette::Diagnostic;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Diagnostic)]
pub enum DecodeError {
    #[error("event body is not valid JSON at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("event schema field {0:?} is malformed")]
    MalformedSchema(String),

    #[error("event schema {got:?} does not belong to this consumer (expected {expected:?})")]
    WrongSchema { expected: &'static str, got: String },

    #[error("event schema {got:?} is version {got_version}, newer than supported {supported}")]
    IncompatibleVersion {
        got: String,
        got_version: u32,
        supported: u32,
    },
}

impl DecodeError {
    /// Incompatible shapes go to the DLQ; everything else in this enum does
    /// too, but this distinction feeds the error_class label.
    pub fn error_class(&self) -> &'static str {
        match self {
            DecodeError::IncompatibleVersion { .. } => "incompatible_version",
            _ => "schema_invalid",
        }
    }
}

/// Splits `"posts.parsed.v1"` into `("posts.parsed", 1)`.
pub fn parse_schema(schema: &str) -> Result<(&str, u32), DecodeError> {
    let (name, version) = schema
        .rsplit_once(".v")
        .ok_or_else(|| DecodeError::MalformedSchema(schema.to_string()))?;
    let version = version
        .parse()
        .map_err(|_| DecodeError::MalformedSchema(schema.to_string()))?;
    Ok((name, version))
}

/// A typed stream-event payload. `SCHEMA_NAME` doubles as the stream name.
pub trait EventPayload: Serialize + DeserializeOwned {
    const SCHEMA_NAME: &'static str;
    const SCHEMA_VERSION: u32;

    fn schema() -> String {
        format!("{}.v{}", Self::SCHEMA_NAME, Self::SCHEMA_VERSION)
    }
}

/// Wire envelope shared by every stream message. Unknown payload fields are
/// captured into `extra` so they survive a decode/re-encode pass-through,
/// but no logic ever reads them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<T> {
    pub schema: String,
    pub idempotency_key: String,
    pub tenant: String,
    pub ts: DateTime<Utc>,
    pub trace_id: String,
    #[serde(flatten)]
    pub payload: T,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl<T: EventPayload> Envelope<T> {
    pub fn new(
        tenant: impl Into<String>,
        trace_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: T,
    ) -> Self {
        Envelope {
            schema: T::schema(),
            idempotency_key: idempotency_key.into(),
            tenant: tenant.into(),
            ts: Utc::now(),
            trace_id: trace_id.into(),
            payload,
            extra: serde_json::Map::new(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("event envelopes contain no non-serializable values")
    }

    /// Decodes and version-checks one event body. Same schema name with an
    /// older (or equal) version is accepted; a newer version than this
    /// consumer supports is incompatible and belongs in the DLQ.
    pub fn decode(body: &str) -> Result<Self, DecodeError> {
        let de = &mut serde_json::Deserializer::from_str(body);
        let envelope: Envelope<T> =
            serde_path_to_error::deserialize(de).map_err(|err| DecodeError::Json {
                path: err.path().to_string(),
                source: err.into_inner(),
            })?;

        let (name, version) = parse_schema(&envelope.schema)?;
        if name != T::SCHEMA_NAME {
            return Err(DecodeError::WrongSchema {
                expected: T::SCHEMA_NAME,
                got: envelope.schema,
            });
        }
        if version > T::SCHEMA_VERSION {
            return Err(DecodeError::IncompatibleVersion {
                got: envelope.schema.clone(),
                got_version: version,
                supported: T::SCHEMA_VERSION,
            });
        }
        Ok(envelope)
    }
}

/// Accepts both the flat `["a", "b"]` shape and the legacy
/// `[{"name": "a"}]` shape some older producers still emit.
fn tags_either_shape<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TagShape {
        Plain(String),
        Named { name: String },
    }

    let tags = Vec::<TagShape>::deserialize(de)?;
    Ok(tags
        .into_iter()
        .map(|t| match t {
            TagShape::Plain(s) => s,
            TagShape::Named { name } => name,
        })
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostParsed {
    pub post_id: Uuid,
    pub channel_id: Uuid,
    pub tg_message_id: i64,
    pub posted_at: DateTime<Utc>,
    pub content_hash: String,
    pub word_count: i32,
    #[serde(default)]
    pub grouped_id: Option<i64>,
    #[serde(default)]
    pub has_media: bool,
}

impl EventPayload for PostParsed {
    const SCHEMA_NAME: &'static str = "posts.parsed";
    const SCHEMA_VERSION: u32 = 1;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlbumParsed {
    pub group_id: Uuid,
    pub channel_id: Uuid,
    pub grouped_id: i64,
    pub items_count: i32,
    pub post_ids: Vec<Uuid>,
}

impl EventPayload for AlbumParsed {
    const SCHEMA_NAME: &'static str = "albums.parsed";
    const SCHEMA_VERSION: u32 = 1;
}

/// Tags are always published as a flat array of lowercase strings; the
/// deserializer additionally tolerates the legacy object shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostTagged {
    pub post_id: Uuid,
    pub channel_id: Uuid,
    #[serde(deserialize_with = "tags_either_shape")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl EventPayload for PostTagged {
    const SCHEMA_NAME: &'static str = "posts.tagged";
    const SCHEMA_VERSION: u32 = 1;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostEnriched {
    pub post_id: Uuid,
    pub channel_id: Uuid,
    /// "enrichment" when a crawl actually happened, "none" otherwise.
    pub kind: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl EventPayload for PostEnriched {
    const SCHEMA_NAME: &'static str = "posts.enriched";
    const SCHEMA_VERSION: u32 = 1;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostIndexed {
    pub post_id: Uuid,
    pub channel_id: Uuid,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl EventPayload for PostIndexed {
    const SCHEMA_NAME: &'static str = "posts.indexed";
    const SCHEMA_VERSION: u32 = 1;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostVision {
    pub post_id: Uuid,
    pub sha256: String,
    pub s3_key: String,
    pub mime: String,
}

impl EventPayload for PostVision {
    const SCHEMA_NAME: &'static str = "posts.vision";
    const SCHEMA_VERSION: u32 = 1;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendEmerging {
    pub cluster_id: Uuid,
    pub label: String,
    pub freq_ratio: f64,
    pub source_diversity: i32,
    pub coherence: f64,
    pub sample_post_ids: Vec<Uuid>,
}

impl EventPayload for TrendEmerging {
    const SCHEMA_NAME: &'static str = "trends.emerging";
    const SCHEMA_VERSION: u32 = 1;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DigestGenerate {
    pub user_id: Uuid,
    pub digest_date: NaiveDate,
}

impl EventPayload for DigestGenerate {
    const SCHEMA_NAME: &'static str = "digests.generate";
    const SCHEMA_VERSION: u32 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_envelope() -> Envelope<PostParsed> {
        Envelope::new(
            "acme",
            "trace-1",
            "0c7c98b1-0000-0000-0000-000000000001:parsed:v1",
            PostParsed {
                post_id: Uuid::nil(),
                channel_id: Uuid::nil(),
                tg_message_id: 42,
                posted_at: "2026-01-05T10:00:00Z".parse().unwrap(),
                content_hash: "abc".into(),
                word_count: 12,
                grouped_id: None,
                has_media: false,
            },
        )
    }

    #[test]
    fn encode_decode_reencode_is_byte_equal() {
        let envelope = sample_envelope();
        let first = envelope.encode();
        let decoded = Envelope::<PostParsed>::decode(&first).unwrap();
        let second = decoded.encode();
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_fields_survive_passthrough() {
        let mut body: serde_json::Value =
            serde_json::from_str(&sample_envelope().encode()).unwrap();
        body.as_object_mut()
            .unwrap()
            .insert("future_field".into(), serde_json::json!({"x": 1}));
        let body = serde_json::to_string(&body).unwrap();

        let decoded = Envelope::<PostParsed>::decode(&body).unwrap();
        assert!(decoded.extra.contains_key("future_field"));
        let reencoded = decoded.encode();
        assert!(reencoded.contains("future_field"));
    }

    #[test]
    fn newer_version_is_incompatible() {
        let mut envelope = sample_envelope();
        envelope.schema = "posts.parsed.v2".into();
        let body = envelope.encode();
        let err = Envelope::<PostParsed>::decode(&body).unwrap_err();
        assert!(matches!(err, DecodeError::IncompatibleVersion { .. }));
        assert_eq!(err.error_class(), "incompatible_version");
    }

    #[test]
    fn wrong_stream_schema_is_rejected() {
        let mut envelope = sample_envelope();
        envelope.schema = "posts.tagged.v1".into();
        let body = envelope.encode();
        let err = Envelope::<PostParsed>::decode(&body).unwrap_err();
        assert!(matches!(err, DecodeError::WrongSchema { .. }));
    }

    #[test]
    fn tags_accept_both_shapes() {
        let plain = r#"{"schema":"posts.tagged.v1","idempotency_key":"k","tenant":"t",
            "ts":"2026-01-05T10:00:00Z","trace_id":"tr",
            "post_id":"00000000-0000-0000-0000-000000000000",
            "channel_id":"00000000-0000-0000-0000-000000000000",
            "tags":["a","b"]}"#;
        let legacy = r#"{"schema":"posts.tagged.v1","idempotency_key":"k","tenant":"t",
            "ts":"2026-01-05T10:00:00Z","trace_id":"tr",
            "post_id":"00000000-0000-0000-0000-000000000000",
            "channel_id":"00000000-0000-0000-0000-000000000000",
            "tags":[{"name":"a"},{"name":"b"}]}"#;

        let plain = Envelope::<PostTagged>::decode(plain).unwrap();
        let legacy = Envelope::<PostTagged>::decode(legacy).unwrap();
        assert_eq!(plain.payload.tags, vec!["a", "b"]);
        assert_eq!(legacy.payload.tags, vec!["a", "b"]);
    }

    #[test]
    fn schema_parse_rejects_garbage() {
        assert!(parse_schema("posts.parsed").is_err());
        assert!(parse_schema("posts.parsed.vx").is_err());
        assert_eq!(parse_schema("posts.parsed.v3").unwrap(), ("posts.parsed", 3));
    }

    proptest! {
        // Round-trip stability for arbitrary payload contents, not just the
        // happy-path sample.
        #[test]
        fn parsed_roundtrip(tg_message_id in any::<i64>(), word_count in 0..100_000i32, hash in "[a-f0-9]{8}") {
            let envelope = Envelope::new(
                "tenant",
                "trace",
                "key",
                PostParsed {
                    post_id: Uuid::nil(),
                    channel_id: Uuid::nil(),
                    tg_message_id,
                    posted_at: "2026-01-05T10:00:00Z".parse().unwrap(),
                    content_hash: hash,
                    word_count,
                    grouped_id: None,
                    has_media: true,
                },
            );
            let body = envelope.encode();
            let decoded = Envelope::<PostParsed>::decode(&body).unwrap();
            prop_assert_eq!(body, decoded.encode());
        }
    }
}
