//! Address of a blob in Google Cloud Storage: `gs://bucket/key[#generation]`.

use crate::errors::{LocalizeError, LocalizeResult};
use std::{
    fmt,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    str::FromStr,
};

/// The only cloud scheme this crate recognizes.
const SCHEME_PREFIX: &str = "gs://";

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 222;
const BUCKET_COMPONENT_MAX_LEN: usize = 63;

/// A parsed `gs://` reference.
///
/// Two references address the same object when bucket and key match; the
/// optional generation marker is carried for display only.
#[derive(Debug, Clone)]
pub struct RemoteRef {
    bucket: String,
    key: String,
    generation: Option<i64>,
}

impl RemoteRef {
    /// Parse a `gs://` string. Fails on any other scheme.
    pub fn parse(uri: &str) -> LocalizeResult<Self> {
        let rest = uri
            .strip_prefix(SCHEME_PREFIX)
            .ok_or_else(|| invalid(uri, "expected a gs:// URI"))?;

        let (rest, generation) = split_generation(rest);
        let (bucket, key) = match rest.split_once('/') {
            Some((bucket, key)) => (bucket, key),
            None => (rest, ""),
        };

        ensure_bucket_name_safe(uri, bucket)?;
        ensure_key_safe(uri, key)?;

        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            generation,
        })
    }

    /// Build from parts already split by a store listing. No generation.
    pub fn new(bucket: &str, key: &str) -> LocalizeResult<Self> {
        let uri = format!("{SCHEME_PREFIX}{bucket}/{key}");
        ensure_bucket_name_safe(&uri, bucket)?;
        ensure_key_safe(&uri, key)?;
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            generation: None,
        })
    }

    /// True when `value` looks like a cloud reference at all.
    pub fn is_remote(value: &str) -> bool {
        value.starts_with(SCHEME_PREFIX)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> Option<i64> {
        self.generation
    }

    /// A reference that names only a bucket.
    pub fn is_bucket(&self) -> bool {
        self.key.is_empty()
    }

    /// A reference ending with `/` names a prefix ("directory").
    pub fn is_prefix(&self) -> bool {
        self.key.ends_with('/')
    }

    /// The same reference normalized to a prefix (trailing `/`).
    pub fn as_prefix(&self) -> Self {
        let mut key = self.key.trim_end_matches('/').to_string();
        if !key.is_empty() {
            key.push('/');
        }
        Self {
            bucket: self.bucket.clone(),
            key,
            generation: None,
        }
    }

    /// Join a relative key below this reference's prefix.
    pub fn child(&self, relative: &str) -> LocalizeResult<Self> {
        let base = self.as_prefix();
        let key = format!("{}{}", base.key, relative.trim_start_matches('/'));
        let uri = format!("{SCHEME_PREFIX}{}/{key}", self.bucket);
        ensure_key_safe(&uri, &key)?;
        Ok(Self {
            bucket: self.bucket.clone(),
            key,
            generation: None,
        })
    }

    /// The part of `self`'s key below `prefix`, if `self` lives under it.
    pub fn relative_to<'a>(&'a self, prefix: &RemoteRef) -> Option<&'a str> {
        if self.bucket != prefix.bucket {
            return None;
        }
        self.key.strip_prefix(prefix.as_prefix().key.as_str())
    }

    /// Lock/lookup key; unique per (bucket, key).
    pub fn cache_key(&self) -> String {
        format!("{}/{}", self.bucket, self.key.trim_end_matches('/'))
    }

    /// `root/bucket/<key segments>`; the key hierarchy becomes directories.
    pub fn local_path(&self, root: &Path) -> PathBuf {
        let mut path = root.join(&self.bucket);
        for segment in self.key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    /// Location inside the bucket as understood by `object_store`.
    pub fn store_path(&self) -> object_store::path::Path {
        object_store::path::Path::from(self.key.trim_end_matches('/'))
    }
}

impl PartialEq for RemoteRef {
    fn eq(&self, other: &Self) -> bool {
        self.bucket == other.bucket && self.key == other.key
    }
}

impl Eq for RemoteRef {}

impl Hash for RemoteRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bucket.hash(state);
        self.key.hash(state);
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{SCHEME_PREFIX}{}", self.bucket)?;
        } else {
            write!(f, "{SCHEME_PREFIX}{}/{}", self.bucket, self.key)?;
        }
        if let Some(generation) = self.generation {
            write!(f, "#{generation}")?;
        }
        Ok(())
    }
}

impl FromStr for RemoteRef {
    type Err = LocalizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn invalid(uri: &str, reason: impl Into<String>) -> LocalizeError {
    LocalizeError::InvalidReference {
        uri: uri.to_string(),
        reason: reason.into(),
    }
}

/// `name#1234` carries a generation; any other `#` belongs to the key.
fn split_generation(rest: &str) -> (&str, Option<i64>) {
    if let Some((head, tail)) = rest.rsplit_once('#') {
        if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(generation) = tail.parse::<i64>() {
                return (head, Some(generation));
            }
        }
    }
    (rest, None)
}

/// GCS bucket naming rules.
///
/// - 3 to 222 characters, dotted components at most 63 each
/// - lowercase letters, digits, `-`, `_`, `.`
/// - alphanumeric first and last character
/// - not formatted like an IPv4 address
fn ensure_bucket_name_safe(uri: &str, name: &str) -> LocalizeResult<()> {
    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid(uri, "bucket name must be between 3 and 222 characters"));
    }

    if name.split('.').any(|part| part.len() > BUCKET_COMPONENT_MAX_LEN) {
        return Err(invalid(uri, "bucket name components are at most 63 characters"));
    }

    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-' | '_'))
    {
        return Err(invalid(
            uri,
            "bucket name allows lowercase letters, digits, dots, hyphens and underscores",
        ));
    }

    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
        return Err(invalid(uri, "bucket name must start and end with a letter or digit"));
    }

    if name.contains("..") {
        return Err(invalid(uri, "bucket name cannot contain consecutive dots"));
    }

    if is_ipv4_like(name) {
        return Err(invalid(uri, "bucket name must not be formatted like an IP address"));
    }

    Ok(())
}

/// Keys map onto directories under the cache root, so anything that could
/// escape it or alias another key is refused.
fn ensure_key_safe(uri: &str, key: &str) -> LocalizeResult<()> {
    if key.len() > MAX_OBJECT_KEY_LEN {
        return Err(invalid(uri, "object key longer than 1024 bytes"));
    }
    if key.starts_with('/') {
        return Err(invalid(uri, "object key cannot start with `/`"));
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(invalid(uri, "object key contains control characters"));
    }

    let trimmed = key.strip_suffix('/').unwrap_or(key);
    if !trimmed.is_empty()
        && trimmed
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(invalid(uri, "object key has empty, `.` or `..` segments"));
    }
    Ok(())
}

fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn parses_bucket_and_nested_key() {
        let r = RemoteRef::parse("gs://bucket/a/b.txt").unwrap();
        assert_eq!(r.bucket(), "bucket");
        assert_eq!(r.key(), "a/b.txt");
        assert_eq!(r.generation(), None);
        assert!(!r.is_prefix());
        assert_eq!(r.to_string(), "gs://bucket/a/b.txt");
    }

    #[test]
    fn bare_bucket_has_empty_key() {
        for uri in ["gs://bucket", "gs://bucket/"] {
            let r = RemoteRef::parse(uri).unwrap();
            assert!(r.is_bucket(), "{uri}");
            assert_eq!(r.to_string(), "gs://bucket");
        }
    }

    #[test]
    fn generation_marker_round_trips_and_is_ignored_by_equality() {
        let with_gen = RemoteRef::parse("gs://bucket/data.csv#1700000000123456").unwrap();
        assert_eq!(with_gen.generation(), Some(1_700_000_000_123_456));
        assert_eq!(with_gen.key(), "data.csv");
        assert_eq!(with_gen.to_string(), "gs://bucket/data.csv#1700000000123456");

        let plain = RemoteRef::parse("gs://bucket/data.csv").unwrap();
        assert_eq!(with_gen, plain);

        let mut set = HashSet::new();
        set.insert(with_gen);
        assert!(set.contains(&plain));
    }

    #[test]
    fn non_numeric_hash_is_part_of_the_key() {
        let r = RemoteRef::parse("gs://bucket/notes#draft").unwrap();
        assert_eq!(r.key(), "notes#draft");
        assert_eq!(r.generation(), None);
    }

    #[test]
    fn rejects_other_schemes_and_bad_names() {
        for uri in [
            "s3://bucket/key",
            "/tmp/local.txt",
            "gs://ab/key",
            "gs://Bucket/key",
            "gs://-bucket/key",
            "gs://192.168.1.1/key",
            "gs://bucket/../escape",
            "gs://bucket/a//b",
            "gs://bucket/a/./b",
            "gs://bucket//abs",
        ] {
            assert!(RemoteRef::parse(uri).is_err(), "{uri} should be rejected");
        }
    }

    #[test]
    fn local_path_mirrors_key_hierarchy() {
        let r = RemoteRef::parse("gs://bucket/a/b.txt").unwrap();
        assert_eq!(
            r.local_path(Path::new("/cache")),
            PathBuf::from("/cache/bucket/a/b.txt")
        );

        let dir = RemoteRef::parse("gs://bucket/out3/").unwrap();
        assert_eq!(dir.local_path(Path::new("/cache")), PathBuf::from("/cache/bucket/out3"));
    }

    #[test]
    fn prefix_child_and_relative() {
        let dir = RemoteRef::parse("gs://bucket/testdir").unwrap();
        let prefix = dir.as_prefix();
        assert_eq!(prefix.key(), "testdir/");
        assert!(prefix.is_prefix());

        let child = dir.child("sub/test1.txt").unwrap();
        assert_eq!(child.to_string(), "gs://bucket/testdir/sub/test1.txt");
        assert_eq!(child.relative_to(&dir), Some("sub/test1.txt"));

        let other = RemoteRef::parse("gs://bucket/testdir2/x").unwrap();
        assert_eq!(other.relative_to(&dir), None);
        assert!(dir.child("../x").is_err());
    }

    #[test]
    fn cache_key_ignores_trailing_slash() {
        let a = RemoteRef::parse("gs://bucket/dir/").unwrap();
        let b = RemoteRef::parse("gs://bucket/dir").unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), "bucket/dir");
    }
}
