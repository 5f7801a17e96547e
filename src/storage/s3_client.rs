//! S3-compatible blob backend.
//!
//! Works against MinIO, R2, B2, and AWS S3. Credentials and endpoint
//! come from [`StorageConfig`]; path-style addressing is on by default
//! so self-hosted MinIO works out of the box.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::config::StorageConfig;

use super::{BlobStore, ObjectMetadata, StorageError};

/// Blob store backed by an S3-compatible service.
#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub async fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "folio-config",
        );

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint)
            .credentials_provider(credentials)
            .load()
            .await;

        let s3_config = Builder::from(&shared)
            .force_path_style(config.force_path_style)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        }
    }

    /// Wrap an already-configured client, e.g. one sharing connection
    /// pools with other services in the same process.
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Collapse an SDK error into the coarse [`StorageError`] classes the
/// pipeline routes on.
fn classify_error<E>(err: SdkError<E>, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let classified = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            Some(StorageError::Timeout(key.to_string()))
        }
        SdkError::ServiceError(ctx) => match ctx.err().code() {
            Some("NoSuchKey" | "NotFound" | "NoSuchBucket") => {
                Some(StorageError::NotFound(key.to_string()))
            }
            Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => {
                Some(StorageError::AccessDenied(key.to_string()))
            }
            _ => None,
        },
        _ => None,
    };

    classified.unwrap_or_else(|| StorageError::Backend(DisplayErrorContext(err).to_string()))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| classify_error(err, key))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify_error(err, key))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;

        Ok(data.into_bytes().to_vec())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_not_found() => Ok(false),
            Err(err) => Err(classify_error(err, key)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify_error(err, key))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMetadata>, StorageError> {
        let mut stream = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = stream.next().await {
            let page = page.map_err(|err| classify_error(err, prefix))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ObjectMetadata {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0),
                    last_modified: object.last_modified().and_then(|ts| {
                        chrono::DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
                    }),
                    content_type: None,
                    etag: object.e_tag().map(str::to_string),
                });
            }
        }

        Ok(objects)
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let presigning = PresigningConfig::expires_in(ttl).map_err(|err| StorageError::Signing {
            key: key.to_string(),
            reason: err.to_string(),
        })?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| classify_error(err, key))?;

        Ok(request.uri().to_string())
    }
}
