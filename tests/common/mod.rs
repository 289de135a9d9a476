#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream;
use gs_localize::{
    LocalizeError, LocalizeResult, ObjectAccessor, ObjectEntry, ObjectStat, RemoteRef,
    services::{atomic::write_atomically, local_fs},
};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn r(uri: &str) -> RemoteRef {
    RemoteRef::parse(uri).unwrap()
}

/// In-process object store that counts every call.
#[derive(Default)]
pub struct FakeAccessor {
    objects: Mutex<BTreeMap<(String, String), (Bytes, ObjectStat)>>,
    download_delay: Duration,
    stats: AtomicUsize,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
}

impl FakeAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every download sleeps this long before writing, to widen races.
    pub fn with_download_delay(delay: Duration) -> Self {
        Self {
            download_delay: delay,
            ..Self::default()
        }
    }

    /// Seed or replace an object.
    pub fn put(&self, uri: &str, content: &[u8], mtime: DateTime<Utc>) {
        let reference = r(uri);
        let stat = ObjectStat::new(content.len() as u64, mtime);
        self.objects.lock().unwrap().insert(
            key_of(&reference),
            (Bytes::copy_from_slice(content), stat),
        );
    }

    pub fn stats(&self) -> usize {
        self.stats.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    fn lookup(&self, reference: &RemoteRef) -> LocalizeResult<(Bytes, ObjectStat)> {
        self.objects
            .lock()
            .unwrap()
            .get(&key_of(reference))
            .cloned()
            .ok_or_else(|| LocalizeError::NotFound {
                uri: reference.to_string(),
            })
    }
}

fn key_of(reference: &RemoteRef) -> (String, String) {
    (reference.bucket().to_string(), reference.key().to_string())
}

#[async_trait]
impl ObjectAccessor for FakeAccessor {
    async fn stat(&self, reference: &RemoteRef) -> LocalizeResult<ObjectStat> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        self.lookup(reference).map(|(_, stat)| stat)
    }

    async fn list(&self, prefix: &RemoteRef) -> LocalizeResult<Vec<ObjectEntry>> {
        let prefix = prefix.as_prefix();
        let objects = self.objects.lock().unwrap();
        objects
            .iter()
            .filter(|((bucket, key), _)| bucket == prefix.bucket() && key.starts_with(prefix.key()))
            .map(|((bucket, key), (_, stat))| {
                Ok(ObjectEntry {
                    reference: RemoteRef::new(bucket, key)?,
                    stat: *stat,
                })
            })
            .collect()
    }

    async fn download(
        &self,
        reference: &RemoteRef,
        destination: &Path,
    ) -> LocalizeResult<ObjectStat> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let (content, stat) = self.lookup(reference)?;
        if !self.download_delay.is_zero() {
            tokio::time::sleep(self.download_delay).await;
        }
        write_atomically(destination, stream::iter([Ok(content)]), stat.mtime).await?;
        Ok(stat)
    }

    async fn upload(&self, source: &Path, reference: &RemoteRef) -> LocalizeResult<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let content = tokio::fs::read(source)
            .await
            .map_err(|err| LocalizeError::transport(reference.to_string(), err))?;
        let meta = local_fs::metadata(source).await?.ok_or_else(|| {
            LocalizeError::transport(reference.to_string(), "upload source vanished")
        })?;
        let stat = local_fs::stat_of(&meta);
        self.objects
            .lock()
            .unwrap()
            .insert(key_of(reference), (Bytes::from(content), stat));
        Ok(())
    }

    async fn delete(&self, reference: &RemoteRef) -> LocalizeResult<()> {
        self.objects.lock().unwrap().remove(&key_of(reference));
        Ok(())
    }
}
