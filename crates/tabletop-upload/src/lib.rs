//! # tabletop-upload
//!
//! Durable delivery of recorded media chunks to storage.
//!
//! Three providers share one contract ([`UploadProvider`]):
//! - `local`: chunks are collected and posted to the application server as one form upload
//! - `multipart_cloud`: the application server issues an S3-compatible multipart upload id,
//!   chunks are regrouped into parts and sent as they fill up
//! - `resumable_direct`: the application server issues a resumable session URI and bytes
//!   go straight to the storage vendor, bypassing the application server
//!
//! The provider is chosen once with [`providers::create`]; callers never branch on the kind.

pub mod error;
pub mod provider;
pub mod providers;
pub mod session;

pub use error::{Result, UploadError};
pub use provider::UploadProvider;
pub use session::{SessionHandle, UploadSession, UploadStats, UploadStatus, UploadTuning};
