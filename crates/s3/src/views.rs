//! View factory resolving `fs://` and `s3://` locations to views

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sk_core::fs::{LocalViews, NilOrigin};
use sk_core::{
    BandwidthLimiter, DestinationView, Error, Location, OriginView, Result, SourceView, ViewFactory,
};

use crate::client::S3Client;
use crate::remote::S3View;

/// View factory for `fs://` and `s3://` locations
///
/// The S3 session is optional: a process that only backs up to local
/// directories never builds one.
#[derive(Debug, Clone, Default)]
pub struct StorageViews {
    s3: Option<Arc<S3Client>>,
}

impl StorageViews {
    pub fn new(s3: Option<Arc<S3Client>>) -> Self {
        Self { s3 }
    }

    fn s3_view(&self, location: &Location) -> Result<S3View> {
        let client = self.s3.clone().ok_or_else(|| {
            Error::InvalidPath(format!("{location} needs an object-storage session"))
        })?;
        S3View::new(client, location)
    }
}

#[async_trait]
impl ViewFactory for StorageViews {
    async fn source(&self, dir: &Path, limiter: BandwidthLimiter) -> Result<Box<dyn SourceView>> {
        LocalViews.source(dir, limiter).await
    }

    async fn destination(&self, location: &Location) -> Result<Box<dyn DestinationView>> {
        match location {
            Location::Local(_) => LocalViews.destination(location).await,
            Location::S3 { .. } => Ok(Box::new(self.s3_view(location)?)),
        }
    }

    async fn origin(&self, location: Option<&Location>) -> Result<Box<dyn OriginView>> {
        match location {
            None => Ok(Box::new(NilOrigin)),
            Some(local @ Location::Local(_)) => LocalViews.origin(Some(local)).await,
            Some(remote) => Ok(Box::new(self.s3_view(remote)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_s3_needs_session() {
        let views = StorageViews::default();
        let location: Location = "s3://backups/vm".parse().unwrap();
        assert!(matches!(
            views.destination(&location).await,
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(
            views.origin(Some(&location)).await,
            Err(Error::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_local_locations_without_session() {
        let tmp = tempfile::TempDir::new().unwrap();
        let views = StorageViews::default();

        let dst = views
            .destination(&Location::Local(tmp.path().join("backup")))
            .await
            .unwrap();
        assert!(dst.list_parts().await.unwrap().is_empty());

        let origin = views.origin(None).await.unwrap();
        assert_eq!(origin.describe(), "nil");
    }
}
