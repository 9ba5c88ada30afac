use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{ClientOptions, GetOptions, ObjectStore, PutPayload};

use crate::config::S3Config;
use crate::error::{Result, UploadError};
use crate::retry::RetryError;
use crate::store::PartStore;

/// `PartStore` over an S3-compatible endpoint.
pub struct S3Store {
    client: AmazonS3,
    builder: AmazonS3Builder,
    options: ClientOptions,
    timeout: Duration,
}

impl S3Store {
    pub fn new(s3: &S3Config, bucket: &str, content_type: Option<&str>) -> Result<Self> {
        let mut options = ClientOptions::new();
        if let Some(content_type) = content_type {
            options = options.with_default_content_type(content_type);
        }

        let mut builder = AmazonS3Builder::new()
            .with_region(&s3.region)
            .with_bucket_name(bucket)
            .with_access_key_id(&s3.access_key)
            .with_secret_access_key(&s3.secret_key)
            // retries happen per part in the pool
            .with_retry(object_store::RetryConfig {
                max_retries: 0,
                ..Default::default()
            });

        if let Some(endpoint) = &s3.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"))
                // Use path-style URLs (https://endpoint/bucket/key): network
                // volume and MinIO endpoints do not resolve bucket subdomains
                .with_virtual_hosted_style_request(false);
        }

        let client = build(&builder, &options, s3.timeout)
            .map_err(|err| UploadError::Config(format!("invalid S3 configuration: {err}")))?;
        Ok(Self {
            client,
            builder,
            options,
            timeout: s3.timeout,
        })
    }

    /// Client for one completion request, never below the configured timeout.
    fn completion_client(&self, timeout: Duration) -> Result<AmazonS3, RetryError> {
        build(&self.builder, &self.options, self.timeout.max(timeout))
            .map_err(|err| RetryError::NonRetryable(err.into()))
    }
}

fn build(
    builder: &AmazonS3Builder,
    options: &ClientOptions,
    timeout: Duration,
) -> object_store::Result<AmazonS3> {
    builder
        .clone()
        .with_client_options(
            options
                .clone()
                .with_timeout(timeout)
                .with_connect_timeout(timeout),
        )
        .build()
}

#[async_trait]
impl PartStore for S3Store {
    async fn create_upload(&self, key: &str) -> Result<String, RetryError> {
        self.client
            .create_multipart(&Path::from(key))
            .await
            .map_err(classify)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, RetryError> {
        // object_store counts parts from zero
        let part_idx = part_number as usize - 1;
        let part = self
            .client
            .put_part(
                &Path::from(key),
                &upload_id.to_string(),
                part_idx,
                PutPayload::from(data),
            )
            .await
            .map_err(classify)?;
        Ok(part.content_id)
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        etags: Vec<String>,
        timeout: Duration,
    ) -> Result<(), RetryError> {
        let parts = etags
            .into_iter()
            .map(|content_id| PartId { content_id })
            .collect();
        self.completion_client(timeout)?
            .complete_multipart(&Path::from(key), &upload_id.to_string(), parts)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<(), RetryError> {
        match self
            .client
            .abort_multipart(&Path::from(key), &upload_id.to_string())
            .await
        {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    async fn object_size(&self, key: &str) -> Result<Option<u64>, RetryError> {
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        match self.client.get_opts(&Path::from(key), options).await {
            Ok(result) => Ok(Some(result.meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(classify(err)),
        }
    }
}

/// Sort an `object_store` error into retryable and non-retryable.
///
/// Rejections the client maps to a dedicated variant are final. Everything
/// else arrives as `Generic`, with the HTTP status only in its rendering:
/// 4xx rejections (400 `InvalidPart`, `EntityTooSmall`, 405, 413 ...) and
/// 507 Insufficient Storage are final, except 408 and 429. Timeouts,
/// connection resets, 5xx and proxy 524 are retried.
fn classify(err: object_store::Error) -> RetryError {
    use object_store::Error;

    let retryable = match &err {
        Error::NotFound { .. }
        | Error::Precondition { .. }
        | Error::AlreadyExists { .. }
        | Error::NotSupported { .. }
        | Error::InvalidPath { .. }
        | Error::PermissionDenied { .. }
        | Error::Unauthenticated { .. } => false,
        other => match status_code(other) {
            Some(408 | 429) => true,
            Some(400..=499 | 507) => false,
            Some(_) => true,
            None => !is_insufficient_storage(&other.to_string()),
        },
    };

    if retryable {
        RetryError::Retryable(err.into())
    } else {
        RetryError::NonRetryable(err.into())
    }
}

/// HTTP status reported anywhere in the error chain.
fn status_code(err: &(dyn std::error::Error + 'static)) -> Option<u16> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(status) = parse_status(&err.to_string()) {
            return Some(status);
        }
        current = err.source();
    }
    None
}

/// First status code in a rendering such as `status code: 400 Bad Request`.
fn parse_status(message: &str) -> Option<u16> {
    message.match_indices("status").find_map(|(at, marker)| {
        let rest = message[at + marker.len()..]
            .trim_start_matches(|c: char| c == ' ' || c == ':')
            .trim_start_matches("code")
            .trim_start_matches(|c: char| c == ' ' || c == ':');
        let digits = rest.get(..3)?;
        let boundary = rest[3..].chars().next().map_or(true, |c| !c.is_ascii_digit());
        if boundary && digits.bytes().all(|b| b.is_ascii_digit()) {
            digits.parse().ok().filter(|code| (100..600).contains(code))
        } else {
            None
        }
    })
}

fn is_insufficient_storage(message: &str) -> bool {
    message.contains("Insufficient Storage")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: Option<&str>) -> S3Config {
        S3Config {
            endpoint: endpoint.map(str::to_string),
            region: "eu-ro-1".into(),
            access_key: "access".into(),
            secret_key: "secret".into(),
            timeout: Duration::from_secs(600),
        }
    }

    fn generic(message: &str) -> object_store::Error {
        object_store::Error::Generic {
            store: "S3",
            source: message.to_string().into(),
        }
    }

    #[test]
    fn test_build_with_custom_endpoint() {
        assert!(S3Store::new(
            &config(Some("https://s3api-eu-ro-1.runpod.io")),
            "volume",
            Some("video/mp4")
        )
        .is_ok());
        assert!(S3Store::new(&config(Some("http://localhost:9000")), "volume", None).is_ok());
    }

    #[test]
    fn test_build_with_aws_default_endpoint() {
        assert!(S3Store::new(&config(None), "bucket", None).is_ok());
    }

    #[test]
    fn test_timeouts_and_server_errors_are_retryable() {
        assert!(classify(generic("error sending request: operation timed out")).is_retryable());
        assert!(classify(generic("Server returned non-2xx status code: 503 Service Unavailable"))
            .is_retryable());
        assert!(classify(generic("Server returned non-2xx status code: 524 <unknown status code>"))
            .is_retryable());
    }

    #[test]
    fn test_rejections_are_not_retryable() {
        let not_found = object_store::Error::NotFound {
            path: "videos/input.mp4".into(),
            source: "NoSuchUpload".into(),
        };
        assert!(!classify(not_found).is_retryable());
        assert!(!classify(generic("Server returned non-2xx status code: 507 Insufficient Storage"))
            .is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        for message in [
            "Error performing PUT http://localhost:9000/volume/clip.mp4?partNumber=3 in 12ms \
             - Server returned non-2xx status code: 400 Bad Request: <Code>EntityTooSmall</Code>",
            "Error performing complete multipart request: clip.mp4: Server returned non-2xx \
             status code: 400 Bad Request: <Code>InvalidPart</Code>",
            "Client error with status 400 Bad Request: <Code>MalformedXML</Code>",
            "Server returned non-2xx status code: 405 Method Not Allowed: ",
            "Server returned non-2xx status code: 413 Payload Too Large: ",
        ] {
            assert!(!classify(generic(message)).is_retryable(), "{message}");
        }
    }

    #[test]
    fn test_throttling_and_request_timeout_are_retryable() {
        assert!(classify(generic("Server returned non-2xx status code: 429 Too Many Requests: "))
            .is_retryable());
        assert!(classify(generic("Server returned non-2xx status code: 408 Request Timeout: "))
            .is_retryable());
    }

    #[test]
    fn test_status_read_from_error_chain() {
        let inner = std::io::Error::other("Server returned non-2xx status code: 411 Length Required");
        let err = object_store::Error::Generic {
            store: "S3",
            source: Box::new(std::io::Error::other(inner)),
        };
        assert_eq!(status_code(&err), Some(411));
        assert!(!classify(err).is_retryable());

        assert_eq!(parse_status("status code: 5000"), None);
        assert_eq!(parse_status("connection reset by peer"), None);
    }

    #[test]
    fn test_completion_client_builds_per_timeout() {
        let store = S3Store::new(&config(Some("http://localhost:9000")), "volume", None).unwrap();
        assert!(store.completion_client(Duration::from_secs(60)).is_ok());
        assert!(store.completion_client(Duration::from_secs(4800)).is_ok());
    }
}
