//! `s3://` backup views
//!
//! A backup lives under `bucket/prefix`; parts are stored at
//! `prefix/<part path>`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sk_core::{DestinationView, Error, Location, ObjectStore, OriginView, Part, Result};

use crate::client::S3Client;

/// Backup directory in an S3 bucket, usable as destination and as origin
#[derive(Debug, Clone)]
pub struct S3View {
    client: Arc<S3Client>,
    location: Location,
    bucket: String,
    prefix: String,
}

impl S3View {
    pub fn new(client: Arc<S3Client>, location: &Location) -> Result<Self> {
        let Location::S3 { bucket, prefix } = location else {
            return Err(Error::InvalidPath(format!("{location} is not an s3:// location")));
        };
        Ok(Self {
            client,
            location: location.clone(),
            bucket: bucket.clone(),
            prefix: prefix.clone(),
        })
    }

    fn key(&self, path: &str) -> String {
        object_key(&self.prefix, path)
    }

    async fn list(&self) -> Result<Vec<Part>> {
        let dir = if self.prefix.is_empty() {
            None
        } else {
            Some(format!("{}/", self.prefix))
        };
        let objects = self.client.list_all(&self.bucket, dir.as_deref()).await?;

        let mut parts: Vec<Part> = objects
            .into_iter()
            .filter_map(|object| {
                let path = match &dir {
                    Some(dir) => object.key.strip_prefix(dir.as_str())?.to_string(),
                    None => object.key,
                };
                if path.is_empty() || path.ends_with('/') {
                    return None;
                }
                let size = object.size_bytes.unwrap_or(0).max(0) as u64;
                Some(Part::new(path, size))
            })
            .collect();
        parts.sort();
        Ok(parts)
    }
}

fn object_key(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}/{path}")
    }
}

#[async_trait]
impl DestinationView for S3View {
    fn describe(&self) -> String {
        self.location.to_string()
    }

    fn location(&self) -> &Location {
        &self.location
    }

    async fn list_parts(&self) -> Result<Vec<Part>> {
        self.list().await
    }

    async fn write_part(&self, part: &Part, data: Bytes) -> Result<()> {
        self.client
            .put_object(&self.bucket, &self.key(&part.path), data)
            .await
    }

    async fn delete_part(&self, path: &str) -> Result<()> {
        self.client.delete_object(&self.bucket, &self.key(path)).await
    }

    async fn copy_part(&self, origin: &dyn OriginView, part: &Part) -> Result<bool> {
        let Some(Location::S3 { bucket, prefix }) = origin.location() else {
            return Ok(false);
        };

        self.client
            .copy_object(
                bucket,
                &object_key(prefix, &part.path),
                &self.bucket,
                &self.key(&part.path),
            )
            .await?;
        Ok(true)
    }

    async fn stop(&self) {
        tracing::debug!(location = %self.location, "Stopped s3 view");
    }
}

#[async_trait]
impl OriginView for S3View {
    fn describe(&self) -> String {
        self.location.to_string()
    }

    fn location(&self) -> Option<&Location> {
        Some(&self.location)
    }

    async fn list_parts(&self) -> Result<Vec<Part>> {
        self.list().await
    }

    async fn stop(&self) {}
}
