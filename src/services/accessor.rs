//! Object metadata accessor: existence, stat, list, download, upload and
//! delete for `gs://` references. A thin translation layer over
//! `object_store`; it keeps no cache bookkeeping of its own.

use crate::{
    errors::{LocalizeError, LocalizeResult},
    models::{
        remote_ref::RemoteRef,
        stat::{
            MTIME_METADATA_KEY, ObjectEntry, ObjectStat, mtime_from_metadata, mtime_to_metadata,
            utc_to_file_time,
        },
    },
    services::{atomic::write_atomically, local_fs},
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, WriteMultipart, gcp::GoogleCloudStorageBuilder, local::LocalFileSystem,
    memory::InMemory,
};
use std::{
    fmt,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Files up to this size go up in a single request.
const SINGLE_PUT_LIMIT: u64 = 8 * 1024 * 1024;
const UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;
const MAX_PARTS_IN_FLIGHT: usize = 4;

/// The storage operations the cache, proxy and hooks rely on.
#[async_trait]
pub trait ObjectAccessor: Send + Sync {
    /// Size and mtime of an object. `NotFound` when absent.
    async fn stat(&self, reference: &RemoteRef) -> LocalizeResult<ObjectStat>;

    /// Objects below a prefix, with listing-level metadata (the store's
    /// last-modified time, not the mirrored `mtime`).
    async fn list(&self, prefix: &RemoteRef) -> LocalizeResult<Vec<ObjectEntry>>;

    /// Materialize an object at `destination` atomically; parents are
    /// created and the file's mtime is set to the object's mtime.
    async fn download(&self, reference: &RemoteRef, destination: &Path)
    -> LocalizeResult<ObjectStat>;

    /// Write a local file to `reference`, recording its mtime.
    async fn upload(&self, source: &Path, reference: &RemoteRef) -> LocalizeResult<()>;

    /// Remove an object; absent objects are not an error.
    async fn delete(&self, reference: &RemoteRef) -> LocalizeResult<()>;

    /// Whether at least one object lives below `prefix`.
    async fn has_objects_below(&self, prefix: &RemoteRef) -> LocalizeResult<bool> {
        Ok(!self.list(prefix).await?.is_empty())
    }

    /// Never fails for "not found", only for transport problems.
    async fn exists(&self, reference: &RemoteRef) -> LocalizeResult<bool> {
        match self.stat(reference).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Which `object_store` implementation serves each bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Google Cloud Storage. A credentials path may hold a service account
    /// key or authorized-user credentials; without one, ambient discovery
    /// (`GOOGLE_APPLICATION_CREDENTIALS`, metadata server) applies.
    Gcs { credentials: Option<PathBuf> },
    /// Process-local in-memory buckets.
    Memory,
    /// Buckets emulated as directories `<root>/<bucket>`.
    Dir(PathBuf),
}

impl StoreBackend {
    fn build(&self, bucket: &str) -> LocalizeResult<Arc<dyn ObjectStore>> {
        match self {
            StoreBackend::Gcs { credentials } => {
                let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
                if let Some(path) = credentials {
                    builder = builder.with_application_credentials(path.to_string_lossy());
                }
                let store = builder.build().map_err(|err| {
                    LocalizeError::Configuration(format!(
                        "cannot build GCS client for bucket `{bucket}`: {err}"
                    ))
                })?;
                Ok(Arc::new(store))
            }
            StoreBackend::Memory => Ok(Arc::new(InMemory::new())),
            StoreBackend::Dir(root) => {
                let bucket_root = root.join(bucket);
                std::fs::create_dir_all(&bucket_root)
                    .map_err(|err| LocalizeError::io(&bucket_root, err))?;
                let store = LocalFileSystem::new_with_prefix(&bucket_root).map_err(|err| {
                    LocalizeError::Configuration(format!(
                        "cannot open bucket directory {}: {err}",
                        bucket_root.display()
                    ))
                })?;
                Ok(Arc::new(store))
            }
        }
    }

    /// Whether the backend stores custom object metadata.
    fn supports_metadata(&self) -> bool {
        !matches!(self, StoreBackend::Dir(_))
    }

    /// File backing an object on the `dir:` backend.
    fn emulated_file(&self, reference: &RemoteRef) -> Option<PathBuf> {
        match self {
            StoreBackend::Dir(root) => Some(root.join(reference.bucket()).join(reference.key())),
            _ => None,
        }
    }
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Gcs { credentials: None }
    }
}

impl FromStr for StoreBackend {
    type Err = LocalizeError;

    /// `gcs`, `memory`, or `dir:<root>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "gcs" | "gs" => Ok(StoreBackend::default()),
            "memory" => Ok(StoreBackend::Memory),
            other => match other.strip_prefix("dir:") {
                Some(root) if !root.is_empty() => Ok(StoreBackend::Dir(PathBuf::from(root))),
                _ => Err(LocalizeError::Configuration(format!(
                    "unknown store `{other}` (expected gcs, memory or dir:<root>)"
                ))),
            },
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Gcs { .. } => write!(f, "gcs"),
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Dir(root) => write!(f, "dir:{}", root.display()),
        }
    }
}

/// `ObjectAccessor` over `object_store`, one store per bucket built lazily.
pub struct StoreAccessor {
    backend: StoreBackend,
    stores: DashMap<String, Arc<dyn ObjectStore>>,
}

impl StoreAccessor {
    pub fn new(backend: StoreBackend) -> Self {
        Self {
            backend,
            stores: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &StoreBackend {
        &self.backend
    }

    fn store(&self, bucket: &str) -> LocalizeResult<Arc<dyn ObjectStore>> {
        if let Some(store) = self.stores.get(bucket) {
            return Ok(store.value().clone());
        }
        let built = self.backend.build(bucket)?;
        debug!("opened {} store for bucket {}", self.backend, bucket);
        Ok(self
            .stores
            .entry(bucket.to_string())
            .or_insert(built)
            .value()
            .clone())
    }

    fn get_options(reference: &RemoteRef, head: bool) -> GetOptions {
        GetOptions {
            head,
            version: reference.generation().map(|g| g.to_string()),
            ..Default::default()
        }
    }

    fn mtime_attributes(&self, stat: &ObjectStat) -> Attributes {
        let mut attributes = Attributes::new();
        if self.backend.supports_metadata() {
            attributes.insert(
                Attribute::Metadata(MTIME_METADATA_KEY.into()),
                AttributeValue::from(mtime_to_metadata(stat.mtime)),
            );
        }
        attributes
    }

    async fn upload_multipart(
        &self,
        store: &Arc<dyn ObjectStore>,
        source: &Path,
        reference: &RemoteRef,
        attributes: Attributes,
    ) -> LocalizeResult<()> {
        let uri = reference.to_string();
        let file = File::open(source)
            .await
            .map_err(|err| LocalizeError::transport(&uri, err))?;
        let opts = PutMultipartOpts {
            attributes,
            ..Default::default()
        };
        let upload = store
            .put_multipart_opts(&reference.store_path(), opts)
            .await
            .map_err(|err| LocalizeError::from_store(&uri, err))?;

        let mut writer = WriteMultipart::new(upload);
        let mut reader = ReaderStream::with_capacity(file, UPLOAD_CHUNK_SIZE);
        while let Some(chunk) = reader.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = writer.abort().await;
                    return Err(LocalizeError::transport(&uri, err));
                }
            };
            writer
                .wait_for_capacity(MAX_PARTS_IN_FLIGHT)
                .await
                .map_err(|err| LocalizeError::from_store(&uri, err))?;
            writer.write(&chunk);
        }
        writer
            .finish()
            .await
            .map_err(|err| LocalizeError::from_store(&uri, err))?;
        Ok(())
    }
}

/// Prefer the mirrored `mtime` metadata, fall back to last-modified.
fn stat_from(meta: &ObjectMeta, attributes: &Attributes) -> ObjectStat {
    let mirrored = attributes
        .get(&Attribute::Metadata(MTIME_METADATA_KEY.into()))
        .and_then(|value| {
            let value: &str = value.as_ref();
            mtime_from_metadata(value)
        });
    ObjectStat::new(meta.size, mirrored.unwrap_or(meta.last_modified))
}

#[async_trait]
impl ObjectAccessor for StoreAccessor {
    async fn stat(&self, reference: &RemoteRef) -> LocalizeResult<ObjectStat> {
        let store = self.store(reference.bucket())?;
        let result = store
            .get_opts(&reference.store_path(), Self::get_options(reference, true))
            .await
            .map_err(|err| LocalizeError::from_store(reference.to_string(), err))?;
        Ok(stat_from(&result.meta, &result.attributes))
    }

    async fn list(&self, prefix: &RemoteRef) -> LocalizeResult<Vec<ObjectEntry>> {
        let store = self.store(prefix.bucket())?;
        let location = prefix.store_path();
        let location = (!prefix.is_bucket()).then_some(&location);

        let mut entries = Vec::new();
        let mut listing = store.list(location);
        while let Some(meta) = listing.next().await {
            let meta = meta.map_err(|err| LocalizeError::from_store(prefix.to_string(), err))?;
            let reference = RemoteRef::new(prefix.bucket(), meta.location.as_ref())?;
            entries.push(ObjectEntry {
                reference,
                stat: ObjectStat::new(meta.size, meta.last_modified),
            });
        }
        entries.sort_by(|a, b| a.reference.key().cmp(b.reference.key()));
        Ok(entries)
    }

    async fn has_objects_below(&self, prefix: &RemoteRef) -> LocalizeResult<bool> {
        let store = self.store(prefix.bucket())?;
        let location = prefix.store_path();
        let location = (!prefix.is_bucket()).then_some(&location);
        // first page only
        match store.list(location).next().await {
            Some(Ok(_)) => Ok(true),
            Some(Err(err)) => Err(LocalizeError::from_store(prefix.to_string(), err)),
            None => Ok(false),
        }
    }

    async fn download(
        &self,
        reference: &RemoteRef,
        destination: &Path,
    ) -> LocalizeResult<ObjectStat> {
        let store = self.store(reference.bucket())?;
        let uri = reference.to_string();
        let result = store
            .get_opts(&reference.store_path(), Self::get_options(reference, false))
            .await
            .map_err(|err| LocalizeError::from_store(&uri, err))?;
        let stat = stat_from(&result.meta, &result.attributes);

        let stream_uri = uri.clone();
        let stream = result
            .into_stream()
            .map(move |chunk| chunk.map_err(|err| LocalizeError::from_store(&stream_uri, err)));
        let written = write_atomically(destination, stream, stat.mtime).await?;
        info!("downloaded {} -> {} ({} bytes)", uri, destination.display(), written);
        Ok(stat)
    }

    async fn upload(&self, source: &Path, reference: &RemoteRef) -> LocalizeResult<()> {
        let uri = reference.to_string();
        let meta = match local_fs::metadata(source).await? {
            Some(meta) if meta.is_file() => meta,
            Some(_) => {
                return Err(LocalizeError::transport(
                    &uri,
                    io::Error::new(ErrorKind::InvalidInput, "upload source is not a file"),
                ));
            }
            None => {
                return Err(LocalizeError::transport(
                    &uri,
                    io::Error::new(
                        ErrorKind::NotFound,
                        format!("upload source {} does not exist", source.display()),
                    ),
                ));
            }
        };
        let local = local_fs::stat_of(&meta);
        let store = self.store(reference.bucket())?;
        let attributes = self.mtime_attributes(&local);

        if local.size <= SINGLE_PUT_LIMIT {
            let bytes = fs::read(source)
                .await
                .map_err(|err| LocalizeError::transport(&uri, err))?;
            let opts = PutOptions {
                attributes,
                ..Default::default()
            };
            store
                .put_opts(&reference.store_path(), PutPayload::from(bytes), opts)
                .await
                .map_err(|err| LocalizeError::from_store(&uri, err))?;
        } else {
            self.upload_multipart(&store, source, reference, attributes)
                .await?;
        }

        // no metadata there: the emulated file's own mtime is the mirror
        if let Some(path) = self.backend.emulated_file(reference) {
            filetime::set_file_mtime(&path, utc_to_file_time(local.mtime))
                .map_err(|err| LocalizeError::io(&path, err))?;
        }

        info!("uploaded {} -> {} ({} bytes)", source.display(), uri, local.size);
        Ok(())
    }

    async fn delete(&self, reference: &RemoteRef) -> LocalizeResult<()> {
        let store = self.store(reference.bucket())?;
        match store.delete(&reference.store_path()).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(LocalizeError::from_store(reference.to_string(), err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use filetime::FileTime;
    use tempfile::TempDir;

    fn r(uri: &str) -> RemoteRef {
        RemoteRef::parse(uri).unwrap()
    }

    fn write_with_mtime(path: &Path, content: &[u8], secs: i64) {
        std::fs::write(path, content).unwrap();
        filetime::set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[test]
    fn backend_parses_from_str() {
        assert_eq!(
            "gcs".parse::<StoreBackend>().unwrap(),
            StoreBackend::Gcs { credentials: None }
        );
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!(
            "dir:/srv/buckets".parse::<StoreBackend>().unwrap(),
            StoreBackend::Dir(PathBuf::from("/srv/buckets"))
        );
        assert!("s3".parse::<StoreBackend>().is_err());
        assert!("dir:".parse::<StoreBackend>().is_err());
    }

    #[tokio::test]
    async fn missing_object_is_not_found_and_not_existing() {
        let accessor = StoreAccessor::new(StoreBackend::Memory);
        let reference = r("gs://bucket/missing.txt");

        assert!(accessor.stat(&reference).await.unwrap_err().is_not_found());
        assert!(!accessor.exists(&reference).await.unwrap());
    }

    #[tokio::test]
    async fn upload_records_local_mtime_and_stat_reports_it() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("c.txt");
        write_with_mtime(&source, b"hello", 1_609_488_000);

        let accessor = StoreAccessor::new(StoreBackend::Memory);
        let reference = r("gs://bucket/out/c.txt");
        accessor.upload(&source, &reference).await.unwrap();

        let stat = accessor.stat(&reference).await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.mtime, Utc.timestamp_opt(1_609_488_000, 0).unwrap());
    }

    #[tokio::test]
    async fn download_materializes_content_with_remote_mtime() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src.txt");
        write_with_mtime(&source, b"0123456789", 1_700_000_000);

        let accessor = StoreAccessor::new(StoreBackend::Memory);
        let reference = r("gs://bucket/a/b.txt");
        accessor.upload(&source, &reference).await.unwrap();

        let dest = tmp.path().join("cache/bucket/a/b.txt");
        let stat = accessor.download(&reference, &dest).await.unwrap();
        assert_eq!(stat.size, 10);
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");

        let local = local_fs::stat_of(&std::fs::metadata(&dest).unwrap());
        assert_eq!(local, stat);
    }

    #[tokio::test]
    async fn upload_of_missing_source_is_transport_error() {
        let tmp = TempDir::new().unwrap();
        let accessor = StoreAccessor::new(StoreBackend::Memory);
        let err = accessor
            .upload(&tmp.path().join("nope"), &r("gs://bucket/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LocalizeError::Transport { .. }));
    }

    #[tokio::test]
    async fn list_returns_objects_below_prefix_only() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("f");
        std::fs::write(&source, b"x").unwrap();

        let accessor = StoreAccessor::new(StoreBackend::Memory);
        for uri in [
            "gs://bucket/testdir/test1.txt",
            "gs://bucket/testdir/sub/test2.txt",
            "gs://bucket/testdir2/test9.txt",
        ] {
            accessor.upload(&source, &r(uri)).await.unwrap();
        }

        let entries = accessor.list(&r("gs://bucket/testdir/")).await.unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.reference.key()).collect();
        assert_eq!(keys, vec!["testdir/sub/test2.txt", "testdir/test1.txt"]);

        let everything = accessor.list(&r("gs://bucket")).await.unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn prefix_check_sees_nested_objects_only() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("f");
        std::fs::write(&source, b"x").unwrap();

        let accessor = StoreAccessor::new(StoreBackend::Memory);
        accessor
            .upload(&source, &r("gs://bucket/testdir/sub/test2.txt"))
            .await
            .unwrap();

        assert!(accessor.has_objects_below(&r("gs://bucket/testdir/")).await.unwrap());
        assert!(accessor.has_objects_below(&r("gs://bucket")).await.unwrap());
        assert!(!accessor.has_objects_below(&r("gs://bucket/other/")).await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("f");
        std::fs::write(&source, b"x").unwrap();

        let accessor = StoreAccessor::new(StoreBackend::Memory);
        let reference = r("gs://bucket/gone.txt");
        accessor.upload(&source, &reference).await.unwrap();
        accessor.delete(&reference).await.unwrap();
        accessor.delete(&reference).await.unwrap();
        assert!(!accessor.exists(&reference).await.unwrap());
    }

    #[tokio::test]
    async fn dir_backend_round_trips_without_metadata() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("f.txt");
        std::fs::write(&source, b"abc").unwrap();

        let accessor = StoreAccessor::new(StoreBackend::Dir(tmp.path().join("buckets")));
        let reference = r("gs://bucket/x/f.txt");
        accessor.upload(&source, &reference).await.unwrap();

        assert!(tmp.path().join("buckets/bucket/x/f.txt").exists());
        assert_eq!(accessor.stat(&reference).await.unwrap().size, 3);
    }

    #[tokio::test]
    async fn dir_backend_upload_keeps_the_source_mtime() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("out.txt");
        write_with_mtime(&source, b"result", 1_600_000_000);

        let accessor = StoreAccessor::new(StoreBackend::Dir(tmp.path().join("buckets")));
        let reference = r("gs://bucket/out/out.txt");
        accessor.upload(&source, &reference).await.unwrap();

        let remote = accessor.stat(&reference).await.unwrap();
        let local = local_fs::stat_of(&std::fs::metadata(&source).unwrap());
        assert_eq!(remote.mtime, Utc.timestamp_opt(1_600_000_000, 0).unwrap());
        assert!(!local.is_stale_against(&remote, std::time::Duration::ZERO));
    }

    #[tokio::test]
    async fn gcs_backend_accepts_authorized_user_credentials() {
        let tmp = TempDir::new().unwrap();
        let credentials = tmp.path().join("adc.json");
        std::fs::write(
            &credentials,
            r#"{"type":"authorized_user","client_id":"id.apps.googleusercontent.com","client_secret":"secret","refresh_token":"token"}"#,
        )
        .unwrap();

        let backend = StoreBackend::Gcs {
            credentials: Some(credentials),
        };
        assert!(backend.build("bucket").is_ok());
    }
}
