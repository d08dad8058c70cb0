//! S3 client implementation
//!
//! Wraps aws-sdk-s3 and implements the ObjectStore trait from sk-core.
//! One client is built at startup and shared by every cycle and sweep.

use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use bytes::Bytes;
use jiff::Timestamp;
use sk_core::{Error, ListOptions, ListResult, ObjectInfo, ObjectStore, Result, StorageSettings};

/// S3 client wrapper
#[derive(Debug, Clone)]
pub struct S3Client {
    inner: aws_sdk_s3::Client,
}

impl S3Client {
    /// Create a new S3 client from the storage settings
    ///
    /// Static credentials are used when both keys are set; otherwise the
    /// SDK's default provider chain (environment, profile, instance
    /// metadata) resolves them.
    pub async fn new(settings: &StorageSettings) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        match (&settings.access_key, &settings.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = aws_credential_types::Credentials::new(
                    access_key.clone(),
                    secret_key.clone(),
                    None, // session token
                    None, // expiry
                    "snapkeeper-static-credentials",
                );
                loader = loader.credentials_provider(credentials);
            }
            (None, None) => {}
            _ => {
                return Err(Error::Config(
                    "access key and secret key must be set together".to_string(),
                ));
            }
        }

        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let config = loader.load().await;

        // Path-style addressing for MinIO and other S3-compatible services
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(settings.force_path_style)
            .build();

        tracing::debug!(
            region = %settings.region,
            endpoint = settings.endpoint.as_deref().unwrap_or("default"),
            "Created S3 client"
        );

        Ok(Self {
            inner: aws_sdk_s3::Client::from_conf(s3_config),
        })
    }

    /// Get the underlying aws-sdk-s3 client
    pub fn inner(&self) -> &aws_sdk_s3::Client {
        &self.inner
    }

    /// List every object below `prefix`, following continuation tokens
    pub async fn list_all(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<ObjectInfo>> {
        let mut items = Vec::new();
        let mut continuation_token = None;
        loop {
            let options = ListOptions {
                prefix: prefix.map(str::to_string),
                max_keys: None,
                continuation_token,
            };
            let page = self.list_objects(bucket, options).await?;
            items.extend(page.items);
            if !page.truncated || page.continuation_token.is_none() {
                return Ok(items);
            }
            continuation_token = page.continuation_token;
        }
    }

    pub async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        let body = aws_sdk_s3::primitives::ByteStream::from(data);
        self.inner
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("put {bucket}/{key}: {}", Self::format_sdk_error(&e))))?;
        Ok(())
    }

    /// Server-side copy of `src_bucket/src_key` to `bucket/key`
    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        bucket: &str,
        key: &str,
    ) -> Result<()> {
        let copy_source = format!("{src_bucket}/{}", urlencoding::encode(src_key));

        self.inner
            .copy_object()
            .copy_source(&copy_source)
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if Self::is_not_found(&e) {
                    Error::NotFound(format!("{src_bucket}/{src_key}"))
                } else {
                    Error::Network(format!(
                        "copy {src_bucket}/{src_key} to {bucket}/{key}: {}",
                        Self::format_sdk_error(&e)
                    ))
                }
            })?;
        Ok(())
    }

    fn is_not_found<E: ProvideErrorMetadata>(error: &SdkError<E>) -> bool {
        let code = error.as_service_error().and_then(|e| e.code());
        matches!(code, Some("NoSuchKey" | "NoSuchBucket" | "NotFound"))
            || error
                .raw_response()
                .is_some_and(|r| r.status().as_u16() == 404)
    }

    /// Format AWS SDK error into a detailed error message
    fn format_sdk_error<E: std::fmt::Display + ProvideErrorMetadata>(error: &SdkError<E>) -> String {
        match error {
            SdkError::ServiceError(service_err) => {
                let err = service_err.err();
                let mut msg = match err.code() {
                    Some(code) => format!("Service error: {code}"),
                    None => format!("Service error: {err}"),
                };
                if let Some(message) = err.message() {
                    msg.push_str(&format!(": {message}"));
                }
                msg.push_str(&format!(" (status: {})", service_err.raw().status().as_u16()));
                msg
            }
            SdkError::ConstructionFailure(err) => {
                format!("Request construction failed: {:?}", err)
            }
            SdkError::TimeoutError(_) => "Request timeout".to_string(),
            SdkError::DispatchFailure(err) => {
                format!("Network dispatch error: {:?}", err)
            }
            SdkError::ResponseError(err) => {
                format!("Response error: {:?}", err)
            }
            _ => error.to_string(),
        }
    }
}

fn to_timestamp(dt: &aws_smithy_types::DateTime) -> Option<Timestamp> {
    Timestamp::new(dt.secs(), dt.subsec_nanos() as i32).ok()
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn list_buckets(&self) -> Result<Vec<String>> {
        let response = self
            .inner
            .list_buckets()
            .send()
            .await
            .map_err(|e| Error::Network(Self::format_sdk_error(&e)))?;

        Ok(response
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    async fn list_objects(&self, bucket: &str, options: ListOptions) -> Result<ListResult> {
        let mut request = self.inner.list_objects_v2().bucket(bucket);

        if let Some(p) = options.prefix {
            request = request.prefix(p);
        }
        if let Some(max) = options.max_keys {
            request = request.max_keys(max);
        }
        if let Some(token) = options.continuation_token {
            request = request.continuation_token(token);
        }

        let response = request.send().await.map_err(|e| {
            if Self::is_not_found(&e) {
                Error::NotFound(format!("Bucket not found: {bucket}"))
            } else {
                Error::Network(Self::format_sdk_error(&e))
            }
        })?;

        let items = response
            .contents()
            .iter()
            .map(|object| ObjectInfo {
                key: object.key().unwrap_or_default().to_string(),
                size_bytes: object.size(),
                last_modified: object.last_modified().and_then(to_timestamp),
            })
            .collect();

        Ok(ListResult {
            items,
            truncated: response.is_truncated().unwrap_or(false),
            continuation_token: response.next_continuation_token().map(|s| s.to_string()),
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.inner
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if Self::is_not_found(&e) {
                    Error::NotFound(format!("{bucket}/{key}"))
                } else {
                    Error::Network(Self::format_sdk_error(&e))
                }
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> S3Client {
        let settings = StorageSettings {
            access_key: Some("AKIDEXAMPLE".to_string()),
            secret_key: Some("wJalrXUtnFEMI".to_string()),
            region: "us-east-1".to_string(),
            endpoint: Some(server.uri()),
            force_path_style: true,
        };
        S3Client::new(&settings).await.unwrap()
    }

    fn xml(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.to_string(), "application/xml")
    }

    #[tokio::test]
    async fn test_keys_must_be_set_together() {
        let settings = StorageSettings {
            access_key: Some("AKIDEXAMPLE".to_string()),
            secret_key: None,
            region: "us-east-1".to_string(),
            endpoint: None,
            force_path_style: false,
        };
        let err = S3Client::new(&settings).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_list_buckets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(xml(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<ListAllMyBucketsResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Owner><ID>owner</ID></Owner>
  <Buckets>
    <Bucket><Name>backups</Name><CreationDate>2024-01-01T00:00:00.000Z</CreationDate></Bucket>
    <Bucket><Name>logs</Name><CreationDate>2024-01-02T00:00:00.000Z</CreationDate></Bucket>
  </Buckets>
</ListAllMyBucketsResult>"#,
            ))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert_eq!(client.list_buckets().await.unwrap(), vec!["backups", "logs"]);
    }

    #[tokio::test]
    async fn test_list_objects_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/backups/"))
            .and(query_param("list-type", "2"))
            .respond_with(xml(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>backups</Name>
  <Prefix></Prefix>
  <KeyCount>2</KeyCount>
  <MaxKeys>2</MaxKeys>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>page-2</NextContinuationToken>
  <Contents>
    <Key>vm/2024-03-10-12-00/data/values.bin</Key>
    <LastModified>2024-03-10T12:00:00.500Z</LastModified>
    <Size>1024</Size>
  </Contents>
  <Contents>
    <Key>vm/2024-03-10-12-00/backup_complete.ignore</Key>
    <LastModified>2024-03-10T12:01:00.000Z</LastModified>
    <Size>0</Size>
  </Contents>
</ListBucketResult>"#,
            ))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let page = client
            .list_objects(
                "backups",
                ListOptions {
                    max_keys: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(page.truncated);
        assert_eq!(page.continuation_token.as_deref(), Some("page-2"));
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].key, "vm/2024-03-10-12-00/data/values.bin");
        assert_eq!(page.items[0].size_bytes, Some(1024));
        assert_eq!(
            page.items[0].last_modified,
            Some("2024-03-10T12:00:00.5Z".parse().unwrap())
        );
    }

    fn listing(keys: &[&str], next: Option<&str>) -> ResponseTemplate {
        let contents: String = keys
            .iter()
            .map(|key| {
                format!(
                    "<Contents><Key>{key}</Key><LastModified>2024-03-10T12:00:00.000Z</LastModified><Size>1</Size></Contents>"
                )
            })
            .collect();
        let truncated = match next {
            Some(token) => format!(
                "<IsTruncated>true</IsTruncated><NextContinuationToken>{token}</NextContinuationToken>"
            ),
            None => "<IsTruncated>false</IsTruncated>".to_string(),
        };
        xml(&format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Name>backups</Name>{truncated}{contents}</ListBucketResult>"#
        ))
    }

    #[tokio::test]
    async fn test_list_all_follows_continuation_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/backups/"))
            .and(query_param("list-type", "2"))
            .and(query_param_is_missing("continuation-token"))
            .respond_with(listing(&["vm/a", "vm/b"], Some("page-2")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/backups/"))
            .and(query_param("list-type", "2"))
            .and(query_param("continuation-token", "page-2"))
            .respond_with(listing(&["vm/c"], None))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let keys: Vec<String> = client
            .list_all("backups", None)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.key)
            .collect();
        assert_eq!(keys, vec!["vm/a", "vm/b", "vm/c"]);
    }

    #[tokio::test]
    async fn test_list_objects_missing_bucket() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone/"))
            .respond_with(ResponseTemplate::new(404).set_body_raw(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>NoSuchBucket</Code><Message>The specified bucket does not exist</Message></Error>"#,
                "application/xml",
            ))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .list_objects("gone", ListOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_object() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/backups/vm/2024-03-10-12-00/data/values.bin"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client
            .delete_object("backups", "vm/2024-03-10-12-00/data/values.bin")
            .await
            .unwrap();
    }
}
