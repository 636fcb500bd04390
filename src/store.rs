use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use crate::{PeriodContext, RetryPolicy, Task, TaskError};

/// Object storage as seen by upload tasks.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, TaskError>;
    async fn make_bucket(&self, bucket: &str) -> Result<(), TaskError>;
    /// Store `data` under `key`, replacing whatever was there.
    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<(), TaskError>;
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    buckets: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .read()
            .await
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.buckets.read().await.get(bucket)?.get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, TaskError> {
        Ok(self.buckets.read().await.contains_key(bucket))
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), TaskError> {
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<(), TaskError> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| TaskError::permanent(format!("no such bucket {bucket}")))?;
        objects.insert(key.to_string(), data);
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Source {
    /// Local path template.
    File(String),
    Bytes(Vec<u8>),
}

/// Uploads one object to a key derived from the period.
///
/// Creates the bucket when missing, then overwrites the key, so repeated runs
/// for the same period leave exactly one object behind.
pub struct UploadTask {
    id: String,
    deps: Vec<String>,
    policy: RetryPolicy,
    store: Arc<dyn ObjectStore>,
    source: Source,
    bucket: String,
    key: String,
}

impl UploadTask {
    /// Upload the file at `path` (a `{param}` template) to `bucket`/`key`.
    pub fn from_file(
        id: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        path: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::with_source(id, store, Source::File(path.into()), bucket, key)
    }

    pub fn from_bytes(
        id: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        data: Vec<u8>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::with_source(id, store, Source::Bytes(data), bucket, key)
    }

    fn with_source(
        id: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        source: Source,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            deps: Vec::new(),
            policy: RetryPolicy::default(),
            store,
            source,
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn load(&self, ctx: &PeriodContext) -> Result<Vec<u8>, TaskError> {
        match &self.source {
            Source::Bytes(data) => Ok(data.clone()),
            Source::File(template) => {
                let path = ctx.render(template)?;
                tokio::fs::read(&path).await.map_err(|e| match e.kind() {
                    ErrorKind::NotFound => TaskError::permanent(format!("{path} not found")),
                    _ => TaskError::transient(format!("reading {path}: {e}")),
                })
            }
        }
    }
}

#[async_trait]
impl Task for UploadTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> Vec<String> {
        self.deps.clone()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy.clone()
    }

    async fn run(&self, ctx: &PeriodContext) -> Result<(), TaskError> {
        let key = ctx.render(&self.key)?;
        let data = self.load(ctx).await?;

        if !self.store.bucket_exists(&self.bucket).await? {
            self.store.make_bucket(&self.bucket).await?;
        }
        self.store.put_object(&self.bucket, &key, data).await?;
        info!(task = %self.id, bucket = %self.bucket, key = %key, "uploaded");
        Ok(())
    }
}
