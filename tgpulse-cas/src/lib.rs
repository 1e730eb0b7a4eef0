use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use log::debug;
use miette::Diagnostic;
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CasError {
    #[error("error checking object existence for {key}")]
    Head {
        key: String,
        #[source]
        source: Box<aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>>,
    },

    #[error("error uploading object {key}")]
    Put {
        key: String,
        #[source]
        source: Box<aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::put_object::PutObjectError>>,
    },

    #[error("error downloading object {key}")]
    Get {
        key: String,
        #[source]
        source: Box<aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>>,
    },

    #[error("error reading object body for {key}")]
    Body {
        key: String,
        #[source]
        source: aws_sdk_s3::primitives::ByteStreamError,
    },

    #[error("error listing objects under {prefix}")]
    List {
        prefix: String,
        #[source]
        source: Box<
            aws_sdk_s3::error::SdkError<
                aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error,
            >,
        >,
    },

    #[error("error gzip-compressing artifact for {key}")]
    Compress {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Key for a media blob: sharded by the first two hash characters so no
/// single listing prefix grows unbounded.
pub fn media_key(tenant: &str, sha256: &str, ext: &str) -> String {
    format!("media/{tenant}/{}/{sha256}.{ext}", &sha256[..2])
}

/// Key for a vision-analysis artifact. Provider, model, and schema version
/// are all part of the key so a re-analysis never clobbers older output.
pub fn vision_key(
    tenant: &str,
    sha256: &str,
    provider: &str,
    model: &str,
    schema_version: u32,
) -> String {
    format!("vision/{tenant}/{sha256}_{provider}_{model}_v{schema_version}.json")
}

pub fn crawl_key(tenant: &str, content_hash: &str) -> String {
    format!("crawl/{tenant}/{content_hash}.json")
}

/// Content-addressed store on S3. Keys embed a content hash, so writes never
/// need locking: two racing writers of the same key write the same bytes.
#[derive(Clone)]
pub struct Cas {
    client: aws_sdk_s3::Client,
    bucket: String,
}

pub struct PutOutcome {
    /// Exact compressed bytes written, for storage accounting.
    pub bytes_written: u64,
}

impl Cas {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Cas {
            client,
            bucket: bucket.into(),
        }
    }

    /// Builds a client from the ambient AWS environment. A custom endpoint
    /// (MinIO and friends) is honored via `AWS_ENDPOINT_URL`.
    pub async fn from_environment(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Cas::new(aws_sdk_s3::Client::new(&config), bucket)
    }

    /// HEAD pre-check. Returns the object size when present.
    pub async fn head(&self, key: &str) -> Result<Option<u64>, CasError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0) as u64)),
            Err(err) => {
                if let aws_sdk_s3::error::SdkError::ServiceError(service_err) = &err {
                    if service_err.err().is_not_found() {
                        return Ok(None);
                    }
                }
                Err(CasError::Head {
                    key: key.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    pub async fn put(&self, key: &str, body: Bytes, mime: &str) -> Result<PutOutcome, CasError> {
        let bytes_written = body.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(mime)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| CasError::Put {
                key: key.to_string(),
                source: Box::new(err),
            })?;
        debug!("Stored {bytes_written} bytes at {key}");
        Ok(PutOutcome { bytes_written })
    }

    /// Gzip-compresses and stores a JSON artifact. Returns the exact number
    /// of compressed bytes written, which is what storage accounting needs.
    pub async fn put_json_gz(&self, key: &str, json: &str) -> Result<PutOutcome, CasError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let compressed = encoder
            .write_all(json.as_bytes())
            .and_then(|_| encoder.finish())
            .map(Bytes::from)
            .map_err(|source| CasError::Compress {
                key: key.to_string(),
                source,
            })?;

        self.put(key, compressed, "application/gzip").await
    }

    pub async fn get(&self, key: &str) -> Result<Bytes, CasError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| CasError::Get {
                key: key.to_string(),
                source: Box::new(err),
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|source| CasError::Body {
                key: key.to_string(),
                source,
            })?;
        Ok(data.into_bytes())
    }

    /// Total bytes and object count under a prefix, for the storage-usage
    /// reconciliation pass.
    pub async fn usage_under_prefix(&self, prefix: &str) -> Result<(u64, u64), CasError> {
        let mut bytes = 0u64;
        let mut objects = 0u64;
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(|err| CasError::List {
                prefix: prefix.to_string(),
                source: Box::new(err),
            })?;

            for object in output.contents() {
                bytes += object.size().unwrap_or(0) as u64;
                objects += 1;
            }

            match output.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok((bytes, objects))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_keys_are_sharded_by_hash_prefix() {
        let key = media_key("acme", "ab34ef", "jpg");
        assert_eq!(key, "media/acme/ab/ab34ef.jpg");
    }

    #[test]
    fn vision_keys_embed_provider_and_schema() {
        let key = vision_key("acme", "ab34ef", "visionx", "m1", 2);
        assert_eq!(key, "vision/acme/ab34ef_visionx_m1_v2.json");
    }
}
