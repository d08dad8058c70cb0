use async_trait::async_trait;

use super::{OriginView, Part};
use crate::error::Result;
use crate::path::Location;

/// Origin used when no previous backup is configured; it never has data
#[derive(Debug, Clone, Copy, Default)]
pub struct NilOrigin;

#[async_trait]
impl OriginView for NilOrigin {
    fn describe(&self) -> String {
        "nil".to_string()
    }

    fn location(&self) -> Option<&Location> {
        None
    }

    async fn list_parts(&self) -> Result<Vec<Part>> {
        Ok(Vec::new())
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nil_origin_has_nothing() {
        let origin = NilOrigin;
        assert!(origin.list_parts().await.unwrap().is_empty());
        assert!(origin.location().is_none());
        assert_eq!(origin.describe(), "nil");
    }
}
