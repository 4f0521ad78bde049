//! Cache key derivation.
//!
//! A [`CacheKey`] is the durable object-store key and the in-memory
//! coordination key for one logical resource. The same resource URL always
//! normalizes to the same key, and distinct resources never collide: the
//! directory part of the URL is hashed, the filename is kept readable.

use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("unparseable resource url: {0}")]
    Url(#[from] url::ParseError),
    #[error("resource url has no file name")]
    NoName,
}

/// Normalized, deterministic object-store key (`<sha256(dir)>/<name>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rebuild a key from its stored string form. Only used when loading
    /// descriptors the store itself produced, so no re-validation happens.
    pub(crate) fn from_stored(key: String) -> Self {
        Self(key)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A requested resource after normalization: the origin URL to fetch, the
/// key it is cached under, and a human-readable display name.
#[derive(Debug, Clone)]
pub struct Resource {
    pub url: Url,
    pub key: CacheKey,
    pub name: String,
}

/// Normalize the raw path of an inbound request into a [`Resource`].
///
/// Accepted shapes are `https://host/dir/file`, `host/dir/file` (scheme
/// defaults to `https`) and `ftp://host/dir/file`. A trailing SourceForge
/// `/download` suffix is stripped; it is not part of the artifact identity.
pub fn normalize(raw: &str) -> Result<Resource, KeyError> {
    let mut spec = raw.trim_start_matches('/').to_string();

    if spec.contains("sourceforge") && spec.ends_with("/download") {
        spec.truncate(spec.len() - "/download".len());
    }

    if !spec.contains("://") {
        spec = format!("https://{spec}");
    }

    let url = Url::parse(&spec)?;

    let (dir, base) = split_name(&spec).ok_or(KeyError::NoName)?;
    if base.is_empty() || url.host_str().is_none() {
        return Err(KeyError::NoName);
    }

    Ok(Resource {
        key: derive_key(dir, base),
        name: url_name(&spec),
        url,
    })
}

/// Key derivation: hash everything before the last `/` so files with the
/// same name under different paths coexist, then keep the filename itself
/// readable. `+` becomes a space in the stored name, matching how upstream
/// hosts decode it.
fn derive_key(dir: &str, base: &str) -> CacheKey {
    let digest = Sha256::digest(dir.as_bytes());
    let name = base.replace('+', " ");
    CacheKey(format!("{}/{name}", hex::encode(digest)))
}

/// Display name for a resource. Usually the URL basename, except GitHub
/// archive/tarball downloads where the bare tag (`v1.0.tar.gz`) would lose
/// the repository name, so the two are combined (`repo-v1.0.tar.gz`).
pub fn url_name(spec: &str) -> String {
    let spec = spec.trim_end_matches('/');
    if spec.contains("github") {
        if let Some((dir, base)) = split_name(spec)
            && let Some((parent, kind)) = split_name(dir)
            && matches!(kind, "archive" | "tarball")
            && let Some((_, repo)) = split_name(parent)
        {
            return format!("{repo}-{base}");
        }
    }
    split_name(spec).map_or_else(|| spec.to_string(), |(_, base)| base.to_string())
}

fn split_name(spec: &str) -> Option<(&str, &str)> {
    spec.rsplit_once('/')
}
