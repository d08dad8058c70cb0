//! sk-s3: storage adapters for snapkeeper
//!
//! Implements the sk-core collaborator traits on top of aws-sdk-s3
//! (object listing, deletion, upload and server-side copy) and reqwest
//! (the database snapshot HTTP API).

mod client;
mod remote;
mod snapshot;
mod views;

pub use client::S3Client;
pub use remote::S3View;
pub use snapshot::SnapshotClient;
pub use views::StorageViews;
