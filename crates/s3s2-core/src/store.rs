use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region, SharedCredentialsProvider};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::layout;
use crate::options::Options;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("client error: {0}")]
    Client(String),
    #[error("upload error: {0}")]
    Upload(String),
    #[error("download error: {0}")]
    Download(String),
    #[error("head error: {0}")]
    Head(String),
    #[error("secret store error: {0}")]
    Ssm(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Expired or rotating credentials surface as request failures; each retry
/// waits out the rotation window and re-acquires the session first.
const RETRY_BACKOFF: Duration = Duration::from_secs(10);
const S3_WRITE_ATTEMPTS: u32 = 3;
const GCS_WRITE_ATTEMPTS: u32 = 5;

/// Uniform capability set over the two backends. SDK types stay behind this
/// boundary; callers hold an `Arc<dyn ObjectStore>`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads a local file to `UPPER(org)/key`.
    async fn upload_file(&self, org: &str, key: &str, local_path: &Path)
        -> Result<(), StoreError>;
    /// Uploads an in-memory buffer to `UPPER(org)/key`.
    async fn upload_buffer(&self, org: &str, key: &str, bytes: Vec<u8>)
        -> Result<(), StoreError>;
    /// Uploads the zero-byte trigger object into `folder`.
    async fn upload_trigger(&self, org: &str, folder: &str) -> Result<(), StoreError>;
    /// Downloads an object to `dst`; returns the byte count (0 is a valid
    /// observation, not an error).
    async fn download(&self, bucket: &str, org: &str, key: &str, dst: &Path)
        -> Result<u64, StoreError>;
    /// True iff a GET of the object would succeed.
    async fn exists(&self, bucket: &str, org: &str, key: &str) -> Result<bool, StoreError>;
    /// Re-acquires the backend session from ambient credentials.
    async fn refresh(&self);
}

/// Builds the adapter for the configured backend.
pub async fn connect(opts: &Options) -> Result<Arc<dyn ObjectStore>, StoreError> {
    let store: Arc<dyn ObjectStore> = if opts.is_gcs {
        Arc::new(GcsStore::new(&opts.bucket).await?)
    } else {
        Arc::new(S3Store::new(opts).await)
    };
    Ok(store)
}

#[derive(Clone, Copy)]
enum PutSource<'a> {
    File(&'a Path),
    Bytes(&'a [u8]),
}

pub struct S3Store {
    bucket: String,
    region: String,
    profile: Option<String>,
    kms_key_id: Option<String>,
    client: RwLock<aws_sdk_s3::Client>,
}

impl S3Store {
    pub async fn new(opts: &Options) -> Self {
        let client = build_s3_client(&opts.region, opts.aws_profile.as_deref()).await;
        Self {
            bucket: opts.bucket.clone(),
            region: opts.region.clone(),
            profile: opts.aws_profile.clone(),
            kms_key_id: opts.aws_key.clone(),
            client: RwLock::new(client),
        }
    }

    async fn client(&self) -> aws_sdk_s3::Client {
        self.client.read().await.clone()
    }

    /// Swaps in temporary credentials minted by the refresher. In-flight
    /// requests keep their clone of the previous client.
    pub async fn install_credentials(&self, creds: Credentials) {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(SharedCredentialsProvider::new(creds))
            .build();
        *self.client.write().await = aws_sdk_s3::Client::from_conf(config);
        info!("installed refreshed object-store credentials");
    }

    async fn put_once(&self, key: &str, body: ByteStream) -> Result<(), StoreError> {
        let client = self.client().await;
        let mut request = client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body);
        if let Some(kms) = &self.kms_key_id {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(kms);
        }
        request
            .send()
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Upload(e.to_string()))
    }

    async fn put_with_retry(&self, key: &str, source: PutSource<'_>) -> Result<(), StoreError> {
        let mut last_err = StoreError::Upload("no attempt made".to_string());
        for attempt in 1..=S3_WRITE_ATTEMPTS {
            let body = match source {
                PutSource::File(path) => ByteStream::from_path(path)
                    .await
                    .map_err(|e| StoreError::Upload(e.to_string()))?,
                PutSource::Bytes(bytes) => ByteStream::from(bytes.to_vec()),
            };
            match self.put_once(key, body).await {
                Ok(()) => {
                    debug!(key, attempt, "uploaded object");
                    return Ok(());
                }
                Err(e) => {
                    warn!(key, attempt, error = %e, "upload failed");
                    last_err = e;
                    if attempt < S3_WRITE_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        self.refresh().await;
                    }
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload_file(
        &self,
        org: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<(), StoreError> {
        let final_key = layout::object_key(org, key);
        debug!(path = %local_path.display(), key = %final_key, "uploading file");
        self.put_with_retry(&final_key, PutSource::File(local_path))
            .await
    }

    async fn upload_buffer(&self, org: &str, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let final_key = layout::object_key(org, key);
        debug!(len = bytes.len(), key = %final_key, "uploading buffer");
        self.put_with_retry(&final_key, PutSource::Bytes(&bytes))
            .await
    }

    async fn upload_trigger(&self, org: &str, folder: &str) -> Result<(), StoreError> {
        let final_key = layout::object_key(org, &layout::trigger_key(folder));
        debug!(key = %final_key, "uploading trigger");
        self.put_with_retry(&final_key, PutSource::Bytes(&[])).await
    }

    async fn download(
        &self,
        bucket: &str,
        org: &str,
        key: &str,
        dst: &Path,
    ) -> Result<u64, StoreError> {
        let final_key = layout::object_key(org, key);
        debug!(key = %final_key, dst = %dst.display(), "downloading object");

        let client = self.client().await;
        let response = client
            .get_object()
            .bucket(bucket)
            .key(&final_key)
            .send()
            .await
            .map_err(|e| StoreError::Download(e.to_string()))?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Download(e.to_string()))?
            .into_bytes();

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dst, &data).await?;
        Ok(data.len() as u64)
    }

    async fn exists(&self, bucket: &str, org: &str, key: &str) -> Result<bool, StoreError> {
        let final_key = layout::object_key(org, key);
        let client = self.client().await;
        match client
            .head_object()
            .bucket(bucket)
            .key(&final_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let s = e.to_string();
                if s.contains("NotFound") || s.contains("404") {
                    Ok(false)
                } else {
                    Err(StoreError::Head(s))
                }
            }
        }
    }

    async fn refresh(&self) {
        let client = build_s3_client(&self.region, self.profile.as_deref()).await;
        *self.client.write().await = client;
        debug!("re-acquired object-store session");
    }
}

async fn build_s3_client(region: &str, profile: Option<&str>) -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()));
    if let Some(profile) = profile {
        loader = loader.profile_name(profile);
    }
    let config = loader.load().await;
    aws_sdk_s3::Client::new(&config)
}

pub struct GcsStore {
    bucket: String,
    client: google_cloud_storage::client::Client,
}

impl GcsStore {
    /// Auth comes from `GOOGLE_APPLICATION_CREDENTIALS` or the ambient
    /// service account.
    pub async fn new(bucket: &str) -> Result<Self, StoreError> {
        let config = google_cloud_storage::client::ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| StoreError::Client(e.to_string()))?;
        Ok(Self {
            bucket: bucket.to_string(),
            client: google_cloud_storage::client::Client::new(config),
        })
    }

    async fn put_once(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
        let media = Media::new(key.to_string());
        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                bytes,
                &UploadType::Simple(media),
            )
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Upload(e.to_string()))
    }

    async fn put_with_retry(&self, key: &str, source: PutSource<'_>) -> Result<(), StoreError> {
        let mut last_err = StoreError::Upload("no attempt made".to_string());
        for attempt in 1..=GCS_WRITE_ATTEMPTS {
            let bytes = match source {
                PutSource::File(path) => tokio::fs::read(path).await?,
                PutSource::Bytes(bytes) => bytes.to_vec(),
            };
            match self.put_once(key, bytes).await {
                Ok(()) => {
                    debug!(key, attempt, "uploaded object");
                    return Ok(());
                }
                Err(e) => {
                    warn!(key, attempt, error = %e, "upload failed");
                    last_err = e;
                    if attempt < GCS_WRITE_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn upload_file(
        &self,
        org: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<(), StoreError> {
        let final_key = layout::object_key(org, key);
        debug!(path = %local_path.display(), key = %final_key, "uploading file");
        self.put_with_retry(&final_key, PutSource::File(local_path))
            .await
    }

    async fn upload_buffer(&self, org: &str, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let final_key = layout::object_key(org, key);
        debug!(len = bytes.len(), key = %final_key, "uploading buffer");
        self.put_with_retry(&final_key, PutSource::Bytes(&bytes))
            .await
    }

    async fn upload_trigger(&self, org: &str, folder: &str) -> Result<(), StoreError> {
        let final_key = layout::object_key(org, &layout::trigger_key(folder));
        debug!(key = %final_key, "uploading trigger");
        self.put_with_retry(&final_key, PutSource::Bytes(&[])).await
    }

    async fn download(
        &self,
        bucket: &str,
        org: &str,
        key: &str,
        dst: &Path,
    ) -> Result<u64, StoreError> {
        use google_cloud_storage::http::objects::download::Range;
        use google_cloud_storage::http::objects::get::GetObjectRequest;

        let final_key = layout::object_key(org, key);
        debug!(key = %final_key, dst = %dst.display(), "downloading object");

        let data = self
            .client
            .download_object(
                &GetObjectRequest {
                    bucket: bucket.to_string(),
                    object: final_key,
                    ..Default::default()
                },
                &Range::default(),
            )
            .await
            .map_err(|e| StoreError::Download(e.to_string()))?;

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dst, &data).await?;
        Ok(data.len() as u64)
    }

    async fn exists(&self, bucket: &str, org: &str, key: &str) -> Result<bool, StoreError> {
        use google_cloud_storage::http::objects::get::GetObjectRequest;

        let final_key = layout::object_key(org, key);
        match self
            .client
            .get_object(&GetObjectRequest {
                bucket: bucket.to_string(),
                object: final_key,
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let s = e.to_string();
                if s.contains("404") || s.contains("No such object") {
                    Ok(false)
                } else {
                    Err(StoreError::Head(s))
                }
            }
        }
    }

    async fn refresh(&self) {
        // bucket-level auth; nothing to rotate here
    }
}

/// Fetches a decrypted parameter from SSM, with the same bounded
/// retry/refresh discipline as the S3 write path.
pub async fn get_ssm_parameter(opts: &Options, name: &str) -> Result<String, StoreError> {
    let mut last_err = StoreError::Ssm("no attempt made".to_string());
    for attempt in 1..=S3_WRITE_ATTEMPTS {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(opts.region.clone()));
        if let Some(profile) = &opts.aws_profile {
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;
        let client = aws_sdk_ssm::Client::new(&config);

        match client
            .get_parameter()
            .name(name)
            .with_decryption(true)
            .send()
            .await
        {
            Ok(output) => {
                return output
                    .parameter
                    .and_then(|p| p.value)
                    .ok_or_else(|| StoreError::Ssm(format!("parameter '{}' has no value", name)))
            }
            Err(e) => {
                warn!(name, attempt, error = %e, "parameter fetch failed");
                last_err = StoreError::Ssm(e.to_string());
                if attempt < S3_WRITE_ATTEMPTS {
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }
    Err(last_err)
}
