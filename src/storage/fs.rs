//! Filesystem-backed object store.
//!
//! Objects live under `root/<hash-dir>/<name>` with a JSON sidecar
//! (`<name>.meta.json`) carrying the origin URL, ETag, and content type,
//! the same metadata the original bucket attached to each object. The
//! store survives restarts; [`FsObjectStore::list`] walks the tree to
//! rebuild the coordinator's table.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::fs;
use tracing::warn;
use url::Url;

use crate::cache::CacheKey;

use super::{PutObject, StorageError, StorageGateway, StoredObject};

const SIDECAR_SUFFIX: &str = ".meta.json";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    origin_url: Url,
    name: String,
    size: u64,
    content_type: Option<String>,
    etag: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    stored_at: OffsetDateTime,
}

#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
    public_base: Url,
}

impl FsObjectStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    /// `public_base` is the URL prefix under which keys are reachable.
    pub fn new(root: PathBuf, public_base: Url) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&root)
            .map_err(|err| StorageError::write(format!("create {}: {err}", root.display())))?;
        Ok(Self { root, public_base })
    }

    /// Absolute path for a key, refusing anything that could escape the
    /// root (keys are `<hex>/<name>`, nothing else).
    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let mut parts = key.split('/');
        let (Some(dir), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(StorageError::InvalidKey);
        };
        if dir.is_empty()
            || name.is_empty()
            || dir == "."
            || dir == ".."
            || name == "."
            || name == ".."
            || name.ends_with(SIDECAR_SUFFIX)
        {
            return Err(StorageError::InvalidKey);
        }
        Ok(self.root.join(dir).join(name))
    }

    /// Read stored bytes and content type for direct serving.
    pub async fn read(&self, key: &str) -> Result<(Bytes, Option<String>), StorageError> {
        let path = self.object_path(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|err| StorageError::read(format!("{}: {err}", path.display())))?;
        let content_type = match read_sidecar(&path).await {
            Ok(sidecar) => sidecar.content_type,
            Err(_) => None,
        };
        Ok((Bytes::from(data), content_type))
    }

    /// Whether a key resolves to a regular file under the root.
    pub async fn contains(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::read(format!("{}: {err}", path.display()))),
        }
    }

    fn location(&self, key: &str) -> Result<Url, StorageError> {
        self.public_base
            .join(key)
            .map_err(|_| StorageError::InvalidKey)
    }
}

#[async_trait]
impl StorageGateway for FsObjectStore {
    async fn has(&self, key: &CacheKey) -> Result<bool, StorageError> {
        self.contains(key.as_str()).await
    }

    async fn put(&self, key: &CacheKey, object: PutObject) -> Result<StoredObject, StorageError> {
        let path = self.object_path(key.as_str())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::write(format!("{}: {err}", parent.display())))?;
        }

        let size = object.bytes.len() as u64;
        let stored_at = OffsetDateTime::now_utc();

        fs::write(&path, &object.bytes)
            .await
            .map_err(|err| StorageError::write(format!("{}: {err}", path.display())))?;

        let sidecar = Sidecar {
            origin_url: object.origin_url.clone(),
            name: object.name.clone(),
            size,
            content_type: object.content_type.clone(),
            etag: object.etag.clone(),
            stored_at,
        };
        let encoded = serde_json::to_vec_pretty(&sidecar)
            .map_err(|err| StorageError::write(format!("encode sidecar: {err}")))?;
        fs::write(sidecar_path(&path), encoded)
            .await
            .map_err(|err| StorageError::write(format!("{}: {err}", path.display())))?;

        Ok(StoredObject {
            key: key.as_str().to_string(),
            origin_url: object.origin_url,
            name: object.name,
            location: self.location(key.as_str())?,
            size,
            content_type: object.content_type,
            etag: object.etag,
            stored_at,
        })
    }

    fn location_of(&self, key: &CacheKey) -> Result<Url, StorageError> {
        self.location(key.as_str())
    }

    async fn list(&self) -> Result<Vec<StoredObject>, StorageError> {
        let mut objects = Vec::new();

        let mut dirs = fs::read_dir(&self.root)
            .await
            .map_err(|err| StorageError::read(format!("{}: {err}", self.root.display())))?;
        while let Some(dir) = next_entry(&mut dirs, &self.root).await? {
            let file_type = dir
                .file_type()
                .await
                .map_err(|err| StorageError::read(format!("{}: {err}", dir.path().display())))?;
            if !file_type.is_dir() {
                continue;
            }
            let Some(dir_name) = dir.file_name().to_str().map(str::to_string) else {
                continue;
            };

            let mut files = fs::read_dir(dir.path())
                .await
                .map_err(|err| StorageError::read(format!("{}: {err}", dir.path().display())))?;
            while let Some(file) = next_entry(&mut files, &dir.path()).await? {
                let Some(file_name) = file.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if file_name.ends_with(SIDECAR_SUFFIX) {
                    continue;
                }

                let key = format!("{dir_name}/{file_name}");
                match read_sidecar(&file.path()).await {
                    Ok(sidecar) => objects.push(StoredObject {
                        location: self.location(&key)?,
                        key,
                        origin_url: sidecar.origin_url,
                        name: sidecar.name,
                        size: sidecar.size,
                        content_type: sidecar.content_type,
                        etag: sidecar.etag,
                        stored_at: sidecar.stored_at,
                    }),
                    Err(err) => {
                        warn!(key, error = %err, "Skipping stored object with unreadable sidecar");
                    }
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(SIDECAR_SUFFIX);
    PathBuf::from(os)
}

async fn read_sidecar(object_path: &Path) -> Result<Sidecar, StorageError> {
    let path = sidecar_path(object_path);
    let data = fs::read(&path)
        .await
        .map_err(|err| StorageError::read(format!("{}: {err}", path.display())))?;
    serde_json::from_slice(&data)
        .map_err(|err| StorageError::read(format!("decode {}: {err}", path.display())))
}

async fn next_entry(
    dir: &mut fs::ReadDir,
    context: &Path,
) -> Result<Option<fs::DirEntry>, StorageError> {
    dir.next_entry()
        .await
        .map_err(|err| StorageError::read(format!("{}: {err}", context.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::normalize;

    fn base() -> Url {
        Url::parse("http://127.0.0.1:3000/o/").expect("base url")
    }

    fn payload(url: &str) -> (CacheKey, PutObject) {
        let resource = normalize(url).expect("normalize");
        let object = PutObject {
            origin_url: resource.url.clone(),
            name: resource.name.clone(),
            bytes: Bytes::from_static(b"tarball bytes"),
            content_type: Some("application/gzip".to_string()),
            etag: Some("abc123".to_string()),
        };
        (resource.key, object)
    }

    #[tokio::test]
    async fn put_then_has_and_read_roundtrip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(tmp.path().to_path_buf(), base()).expect("store");
        let (key, object) = payload("https://fftw.org/fftw-3.3.10.tar.gz");

        assert!(!store.has(&key).await.expect("has"));
        let stored = store.put(&key, object).await.expect("put");
        assert!(store.has(&key).await.expect("has"));

        assert_eq!(stored.size, 13);
        assert_eq!(stored.name, "fftw-3.3.10.tar.gz");
        assert_eq!(stored.location, store.location_of(&key).expect("location"));

        let (bytes, content_type) = store.read(key.as_str()).await.expect("read");
        assert_eq!(&bytes[..], b"tarball bytes");
        assert_eq!(content_type.as_deref(), Some("application/gzip"));
    }

    #[tokio::test]
    async fn list_rebuilds_descriptors_from_sidecars() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(tmp.path().to_path_buf(), base()).expect("store");

        let (key_a, object_a) = payload("https://fftw.org/fftw-3.3.10.tar.gz");
        let (key_b, object_b) = payload("https://netlib.org/lapack/lapack-3.11.tgz");
        store.put(&key_a, object_a).await.expect("put");
        store.put(&key_b, object_b).await.expect("put");

        let listed = store.list().await.expect("list");
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|o| o.key == key_a.as_str()));
        assert!(listed.iter().any(|o| o.name == "lapack-3.11.tgz"));
        for object in &listed {
            assert_eq!(object.etag.as_deref(), Some("abc123"));
        }
    }

    #[tokio::test]
    async fn list_skips_objects_with_corrupt_sidecars() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(tmp.path().to_path_buf(), base()).expect("store");

        let (key, object) = payload("https://fftw.org/fftw-3.3.10.tar.gz");
        store.put(&key, object).await.expect("put");

        let object_path = tmp.path().join(key.as_str());
        std::fs::write(sidecar_path(&object_path), b"not json").expect("corrupt");

        let listed = store.list().await.expect("list");
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(tmp.path().to_path_buf(), base()).expect("store");

        for key in ["../etc/passwd", "a/b/c", "..", "dir/..", "/abs"] {
            assert!(
                matches!(store.read(key).await, Err(StorageError::InvalidKey)),
                "key `{key}` should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn sidecars_are_not_served_as_objects() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(tmp.path().to_path_buf(), base()).expect("store");
        let (key, object) = payload("https://fftw.org/fftw-3.3.10.tar.gz");
        store.put(&key, object).await.expect("put");

        let sidecar_key = format!("{}.meta.json", key.as_str());
        assert!(matches!(
            store.read(&sidecar_key).await,
            Err(StorageError::InvalidKey)
        ));
    }
}
