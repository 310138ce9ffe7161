//! Media pipeline: size-capped download, archive with retention, multipart
//! upload, classification, and voice transcoding.

pub mod error;
pub mod mime;
pub mod store;
pub mod transcode;
pub mod upload;

pub use {
    error::{Error, Result},
    store::{DownloadRequest, DownloadedFile, MediaConfig, MediaService},
};
