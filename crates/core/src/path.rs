//! Backup location parsing
//!
//! Destinations and origins are URIs whose scheme selects the backend:
//! - `fs:///abs/path` for a local (or mounted) directory
//! - `s3://bucket/prefix` for S3-compatible object storage

use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// A parsed backup location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Local filesystem directory
    Local(PathBuf),
    /// Bucket plus key prefix on the configured object-storage endpoint
    S3 { bucket: String, prefix: String },
}

impl Location {
    /// Append a single path segment to this location
    pub fn join(&self, segment: &str) -> Location {
        let segment = segment.trim_matches('/');
        match self {
            Location::Local(dir) => Location::Local(dir.join(segment)),
            Location::S3 { bucket, prefix } => {
                let prefix = if prefix.is_empty() {
                    segment.to_string()
                } else {
                    format!("{prefix}/{segment}")
                };
                Location::S3 {
                    bucket: bucket.clone(),
                    prefix,
                }
            }
        }
    }

    pub fn is_object_storage(&self) -> bool {
        matches!(self, Location::S3 { .. })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(dir) => write!(f, "fs://{}", dir.display()),
            Location::S3 { bucket, prefix } if prefix.is_empty() => write!(f, "s3://{bucket}"),
            Location::S3 { bucket, prefix } => write!(f, "s3://{bucket}/{prefix}"),
        }
    }
}

impl std::str::FromStr for Location {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_location(s)
    }
}

/// Parse a location URI
///
/// # Examples
/// - `fs:///var/backups/vm` -> `Local("/var/backups/vm")`
/// - `s3://backups/vm/daily` -> `S3 { bucket: "backups", prefix: "vm/daily" }`
pub fn parse_location(uri: &str) -> Result<Location> {
    let uri = uri.trim();
    let Some((scheme, rest)) = uri.split_once("://") else {
        return Err(Error::InvalidPath(format!(
            "{uri:?} has no scheme; expected fs:///path or s3://bucket/prefix"
        )));
    };

    match scheme.to_lowercase().as_str() {
        "fs" => {
            if rest.is_empty() {
                return Err(Error::InvalidPath(format!("{uri:?} has an empty path")));
            }
            let trimmed = rest.trim_end_matches('/');
            let dir = if trimmed.is_empty() { "/" } else { trimmed };
            Ok(Location::Local(PathBuf::from(dir)))
        }
        "s3" => {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(Error::InvalidPath(format!("{uri:?} is missing a bucket name")));
            }
            Ok(Location::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
            })
        }
        "gs" | "azblob" => Err(Error::InvalidPath(format!(
            "scheme {scheme:?} is not supported; use fs:// or s3://"
        ))),
        _ => Err(Error::InvalidPath(format!("unknown scheme {scheme:?} in {uri:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local() {
        let loc = parse_location("fs:///var/backups/vm/").unwrap();
        assert_eq!(loc, Location::Local(PathBuf::from("/var/backups/vm")));
        assert!(!loc.is_object_storage());
    }

    #[test]
    fn test_parse_s3() {
        let loc = parse_location("s3://backups/vm/daily/").unwrap();
        assert_eq!(
            loc,
            Location::S3 {
                bucket: "backups".to_string(),
                prefix: "vm/daily".to_string()
            }
        );
        assert!(loc.is_object_storage());
    }

    #[test]
    fn test_parse_s3_bucket_only() {
        let loc = parse_location("s3://backups").unwrap();
        assert_eq!(loc.to_string(), "s3://backups");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_location("/no/scheme"),
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(parse_location("s3:///key"), Err(Error::InvalidPath(_))));
        assert!(matches!(parse_location("fs://"), Err(Error::InvalidPath(_))));
        assert!(matches!(
            parse_location("gs://bucket/x"),
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(
            parse_location("ftp://host/x"),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn test_join() {
        let base = parse_location("s3://backups/vm").unwrap();
        assert_eq!(
            base.join("2024-03-10-12-34").to_string(),
            "s3://backups/vm/2024-03-10-12-34"
        );

        let bare = parse_location("s3://backups").unwrap();
        assert_eq!(bare.join("x").to_string(), "s3://backups/x");

        let local = parse_location("fs:///srv/bk").unwrap();
        assert_eq!(local.join("x"), Location::Local(PathBuf::from("/srv/bk/x")));
    }

    #[test]
    fn test_display_roundtrip() {
        for uri in ["fs:///srv/bk", "s3://b/p/q"] {
            assert_eq!(parse_location(uri).unwrap().to_string(), uri);
        }
    }
}
