//! # Layer Archive Storage
//!
//! Downloaded layer blobs land in a per-run directory as
//! `<encoded-digest>.tar.gz`, one file per layer descriptor:
//!
//! ```text
//! <workspace>/layers/
//! ├── 4abcf2066143...tar.gz
//! └── 9c1e0e1fd0c5...tar.gz
//! ```
//!
//! File names come from the algorithm-stripped digest. [`Digest`] is
//! validated on parse, so the name can never escape the directory.
//!
//! ## Digest Verification
//!
//! [`DigestVerifier`] hashes bytes as they are streamed to disk and
//! compares the result with the declared digest once the body is complete.
//! This prevents:
//!
//! - **Cache poisoning**: A registry serving content for the wrong digest
//! - **MITM attacks**: Tampered bodies are detected before extraction
//! - **Truncation**: Short reads produce a different hash
//!
//! Verification covers `sha256` and `sha512`. With verification disabled
//! the bytes are stored unchecked.

use crate::auth::AccessToken;
use crate::constants::LAYER_ARCHIVE_EXTENSION;
use crate::error::Result;
use crate::manifest::Descriptor;
use crate::reference::Digest;
use async_trait::async_trait;
use sha2::{Digest as _, Sha256, Sha512};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// A downloaded, not yet extracted layer blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerArchive {
    /// Digest of the compressed blob.
    pub digest: Digest,
    /// Local file holding the blob.
    pub path: PathBuf,
}

/// Directory of downloaded layer archives for one run.
///
/// The store does not remove its directory on drop; the owning
/// [`RunWorkspace`](crate::rootfs::RunWorkspace) does.
#[derive(Debug)]
pub struct LayerStore {
    base_dir: PathBuf,
}

impl LayerStore {
    /// Creates a store at the given path, creating the directory if needed.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;

        debug!("Layer archives go to {}", base_dir.display());

        Ok(Self { base_dir })
    }

    /// Local path for the archive of `digest`.
    pub fn archive_path(&self, digest: &Digest) -> PathBuf {
        self.base_dir
            .join(format!("{}.{}", digest.encoded(), LAYER_ARCHIVE_EXTENSION))
    }
}

/// Incremental hasher checking a blob against its declared digest.
pub enum DigestVerifier {
    Sha256(Sha256),
    Sha512(Sha512),
    /// Verification disabled; accepts any content.
    Unchecked,
}

impl DigestVerifier {
    /// Selects a hasher for `digest`.
    ///
    /// With `verify` off this always returns [`DigestVerifier::Unchecked`].
    /// With it on, an unsupported algorithm is an error message for the
    /// caller to wrap in its stage error.
    pub fn for_digest(digest: &Digest, verify: bool) -> std::result::Result<Self, String> {
        if !verify {
            return Ok(Self::Unchecked);
        }
        match digest.algorithm() {
            "sha256" => Ok(Self::Sha256(Sha256::new())),
            "sha512" => Ok(Self::Sha512(Sha512::new())),
            other => Err(format!(
                "unsupported digest algorithm '{}': only sha256 and sha512 can be verified",
                other
            )),
        }
    }

    /// Feeds a chunk of the blob.
    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(chunk),
            Self::Sha512(h) => h.update(chunk),
            Self::Unchecked => {}
        }
    }

    /// Compares the accumulated hash with `expected`.
    pub fn finish(self, expected: &Digest) -> std::result::Result<(), String> {
        let computed = match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
            Self::Unchecked => return Ok(()),
        };

        if !computed.eq_ignore_ascii_case(expected.encoded()) {
            return Err(format!(
                "digest mismatch: expected {}, computed {}:{}",
                expected,
                expected.algorithm(),
                computed
            ));
        }
        Ok(())
    }
}

/// Downloads layer blobs by digest.
#[async_trait]
pub trait LayerFetcher: Send + Sync {
    /// Streams the blob for `descriptor` into `store` and returns its
    /// location.
    async fn fetch_layer(
        &self,
        repository: &str,
        token: &AccessToken,
        descriptor: &Descriptor,
        store: &LayerStore,
    ) -> Result<LayerArchive>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest as _;
    use tempfile::TempDir;

    fn sha256_of(data: &[u8]) -> Digest {
        Digest::parse(&format!("sha256:{}", hex::encode(Sha256::digest(data)))).unwrap()
    }

    #[test]
    fn test_archive_path_strips_algorithm() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::with_path(temp.path().join("layers")).unwrap();

        let digest = Digest::parse("sha256:abcd1234").unwrap();
        let path = store.archive_path(&digest);

        assert_eq!(path, temp.path().join("layers").join("abcd1234.tar.gz"));
        assert!(temp.path().join("layers").is_dir());
    }

    #[test]
    fn test_verifier_accepts_matching_content() {
        let data = b"hello world";
        let digest = sha256_of(data);

        let mut verifier = DigestVerifier::for_digest(&digest, true).unwrap();
        verifier.update(&data[..5]);
        verifier.update(&data[5..]);
        assert!(verifier.finish(&digest).is_ok());
    }

    #[test]
    fn test_verifier_rejects_mismatch() {
        let digest = sha256_of(b"hello world");

        let mut verifier = DigestVerifier::for_digest(&digest, true).unwrap();
        verifier.update(b"hello there");
        let err = verifier.finish(&digest).unwrap_err();
        assert!(err.contains("digest mismatch"));
    }

    #[test]
    fn test_verifier_algorithm_support() {
        let digest = Digest::parse("md5:abcd").unwrap();
        assert!(DigestVerifier::for_digest(&digest, true).is_err());
        assert!(matches!(
            DigestVerifier::for_digest(&digest, false),
            Ok(DigestVerifier::Unchecked)
        ));
    }
}
