//! Encrypted object storage for recording media

use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{MetadataDirective, ServerSideEncryption, StorageClass},
};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::StorageConfig;

/// Longest lifetime of a presigned playback URL
pub const MAX_PRESIGN_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("upload of {key} failed: {message}")]
    Upload { key: String, message: String },

    #[error("delete of {key} failed: {message}")]
    Delete { key: String, message: String },

    #[error("storage request failed: {0}")]
    Request(String),
}

/// Clamp a requested URL lifetime to [`MAX_PRESIGN_TTL`]
pub fn clamp_presign_ttl(requested: Duration) -> Duration {
    requested.min(MAX_PRESIGN_TTL).max(Duration::from_secs(1))
}

/// An object to be written with its descriptive metadata and tags
#[derive(Debug, Clone, Default)]
pub struct UploadObject {
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
    /// URL-encoded tag set, e.g. `Type=TelehealthRecording&SessionId=...`
    pub tagging: Option<String>,
}

/// Where an upload landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub region: String,
    pub encryption: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

/// Durable encrypted-at-rest blob storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn is_configured(&self) -> bool;

    fn bucket(&self) -> &str;

    async fn upload(&self, object: UploadObject) -> Result<StoredObject, StorageError>;

    /// Time-limited read URL; `ttl` is clamped to [`MAX_PRESIGN_TTL`]
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<(), StorageError>;

    async fn metadata(&self, key: &str) -> Result<ObjectInfo, StorageError>;
}

/// S3-backed store: SSE on every write, infrequent-access storage class
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    region: String,
    encryption: ServerSideEncryption,
}

impl S3Storage {
    pub fn new(client: Client, config: &StorageConfig) -> Self {
        Self {
            client,
            bucket: config.bucket_name().to_string(),
            region: config.region.clone(),
            encryption: ServerSideEncryption::from(config.encryption.as_str()),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    fn is_configured(&self) -> bool {
        true
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(&self, object: UploadObject) -> Result<StoredObject, StorageError> {
        let size_bytes = object.body.len() as u64;
        let key = object.key;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(object.body))
            .content_type(&object.content_type)
            .server_side_encryption(self.encryption.clone())
            .storage_class(StorageClass::StandardIa)
            .set_metadata(Some(object.metadata))
            .set_tagging(object.tagging)
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                key: key.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        info!(bucket = %self.bucket, key = %key, size_bytes, "Uploaded recording to S3");

        Ok(StoredObject {
            bucket: self.bucket.clone(),
            key,
            region: self.region.clone(),
            encryption: self.encryption.as_str().to_string(),
            size_bytes,
        })
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let presigning = PresigningConfig::expires_in(clamp_presign_ttl(ttl))
            .map_err(|e| StorageError::Request(e.to_string()))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::Request(DisplayErrorContext(&e).to_string()))?;

        Ok(request.uri().to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        info!(bucket = %self.bucket, key, "Deleted recording from S3");
        Ok(())
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<(), StorageError> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, source_key))
            .key(dest_key)
            .server_side_encryption(self.encryption.clone())
            .metadata_directive(MetadataDirective::Copy)
            .send()
            .await
            .map_err(|e| StorageError::Request(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    async fn metadata(&self, key: &str) -> Result<ObjectInfo, StorageError> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Request(DisplayErrorContext(&e).to_string())
                }
            })?;

        Ok(ObjectInfo {
            size_bytes: head.content_length().unwrap_or(0).max(0) as u64,
            content_type: head.content_type().map(str::to_string),
            last_modified: head
                .last_modified()
                .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
            metadata: head.metadata().cloned().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
struct MemoryBlob {
    body: Vec<u8>,
    content_type: String,
    metadata: HashMap<String, String>,
    tagging: Option<String>,
}

/// In-process store for local runs and tests
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: DashMap<String, MemoryBlob>,
    fail_uploads: AtomicBool,
    fail_deletes: AtomicBool,
    rejected_deletes: DashSet<String>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Reject deletes of one key only
    pub fn reject_delete_of(&self, key: impl Into<String>) {
        self.rejected_deletes.insert(key.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn tagging(&self, key: &str) -> Option<String> {
        self.objects.get(key).and_then(|blob| blob.tagging.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn is_configured(&self) -> bool {
        false
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(&self, object: UploadObject) -> Result<StoredObject, StorageError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::Upload {
                key: object.key,
                message: "upload rejected".to_string(),
            });
        }

        let size_bytes = object.body.len() as u64;
        let key = object.key.clone();
        self.objects.insert(
            object.key,
            MemoryBlob {
                body: object.body,
                content_type: object.content_type,
                metadata: object.metadata,
                tagging: object.tagging,
            },
        );

        Ok(StoredObject {
            bucket: self.bucket.clone(),
            key,
            region: "local".to_string(),
            encryption: "AES256".to_string(),
            size_bytes,
        })
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        if !self.objects.contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(format!(
            "memory://{}/{}?expires_in={}",
            self.bucket,
            key,
            clamp_presign_ttl(ttl).as_secs()
        ))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) || self.rejected_deletes.contains(key) {
            warn!(key, "Simulated storage delete failure");
            return Err(StorageError::Delete {
                key: key.to_string(),
                message: "delete rejected".to_string(),
            });
        }
        self.objects.remove(key);
        Ok(())
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<(), StorageError> {
        let blob = self
            .objects
            .get(source_key)
            .map(|blob| blob.clone())
            .ok_or_else(|| StorageError::NotFound(source_key.to_string()))?;
        self.objects.insert(dest_key.to_string(), blob);
        Ok(())
    }

    async fn metadata(&self, key: &str) -> Result<ObjectInfo, StorageError> {
        let blob = self
            .objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        Ok(ObjectInfo {
            size_bytes: blob.body.len() as u64,
            content_type: Some(blob.content_type.clone()),
            last_modified: None,
            metadata: blob.metadata.clone(),
        })
    }
}
