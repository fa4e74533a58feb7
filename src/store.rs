use crate::error::ReportError;
use crate::retry::RetryPolicy;
use crate::workbook::XLSX_CONTENT_TYPE;
use async_trait::async_trait;
use chrono::NaiveDate;
use rusoto_core::credential::{DefaultCredentialsProvider, ProvideAwsCredentials};
use rusoto_core::Region;
use rusoto_s3::util::{PreSignedRequest, PreSignedRequestOption};
use rusoto_s3::{GetObjectRequest, PutObjectRequest, S3Client, S3};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ReportError>;

    /// A URL a recipient can follow to download `key`.
    async fn link(&self, key: &str) -> Result<String, ReportError>;

    fn bucket(&self) -> &str;
}

pub struct S3ObjectStore {
    client: S3Client,
    region: Region,
    bucket: String,
    link_expiry: Duration,
}

impl S3ObjectStore {
    pub fn new(region: Region, bucket: String, link_expiry: Duration) -> Self {
        Self::new_with_client(S3Client::new(region.clone()), region, bucket, link_expiry)
    }

    pub fn new_with_client(client: S3Client, region: Region, bucket: String, link_expiry: Duration) -> Self {
        S3ObjectStore {
            client,
            region,
            bucket,
            link_expiry,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ReportError> {
        self.client
            .put_object(PutObjectRequest {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                body: Some(body.into()),
                content_type: Some(content_type.to_string()),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn link(&self, key: &str) -> Result<String, ReportError> {
        let provider = DefaultCredentialsProvider::new()
            .map_err(|error| ReportError::StoreFailure(error.to_string()))?;
        let credentials = provider
            .credentials()
            .await
            .map_err(|error| ReportError::StoreFailure(error.to_string()))?;
        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            ..Default::default()
        };
        Ok(request.get_presigned_url(
            &self.region,
            &credentials,
            &PreSignedRequestOption {
                expires_in: self.link_expiry,
            },
        ))
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// A persisted workbook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportArtifact {
    pub bucket: String,
    pub key: String,
    pub size: usize,
    pub content_type: String,
    pub link: String,
}

impl ReportArtifact {
    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

pub struct ReportStore {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    prefix: String,
    function_name: String,
}

impl ReportStore {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy, prefix: &str, function_name: &str) -> Self {
        ReportStore {
            store,
            retry,
            prefix: prefix.trim_matches('/').to_string(),
            function_name: function_name.to_string(),
        }
    }

    /// `{prefix}/{YYYY-MM-DD}/{function}.xlsx`. Same day, same key.
    pub fn key_for(&self, date: NaiveDate) -> String {
        let file = format!("{}/{}.xlsx", date.format("%Y-%m-%d"), self.function_name);
        if self.prefix.is_empty() {
            file
        } else {
            format!("{}/{}", self.prefix, file)
        }
    }

    pub async fn put(&self, bytes: &[u8], date: NaiveDate) -> Result<ReportArtifact, ReportError> {
        let key = self.key_for(date);
        self.retry
            .run("put_object", || {
                self.store.put_object(&key, bytes.to_vec(), XLSX_CONTENT_TYPE)
            })
            .await
            .map_err(|error| match error {
                ReportError::StoreTransient(message) => ReportError::StoreFailure(message),
                other => other,
            })?;
        info!(bucket = self.store.bucket(), key = key.as_str(), bytes = bytes.len(), "report stored");

        let uri = format!("s3://{}/{}", self.store.bucket(), key);
        let link = match self.store.link(&key).await {
            Ok(link) => link,
            Err(error) => {
                warn!(error = %error, "could not sign download link, using object URI");
                uri
            }
        };
        Ok(ReportArtifact {
            bucket: self.store.bucket().to_string(),
            key,
            size: bytes.len(),
            content_type: XLSX_CONTENT_TYPE.to_string(),
            link,
        })
    }
}
