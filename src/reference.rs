//! Image reference and content digest parsing.
//!
//! An [`ImageReference`] is parsed from a single `name[:tag]` token. Single
//! component names are placed in the official-image namespace, so `alpine`
//! resolves to `library/alpine:latest`.
//!
//! A [`Digest`] is validated on construction so that its encoded part can be
//! used both in a registry URL and as a local file name without further
//! sanitizing.

use crate::constants::{DEFAULT_TAG, IMAGE_REF_VALID_CHARS, MAX_IMAGE_REF_LEN, OFFICIAL_NAMESPACE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Repository and tag of the image to run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    repository: String,
    tag: String,
}

impl ImageReference {
    /// Parses a `name[:tag]` token.
    ///
    /// The tag is split on the last `:` that follows the last `/`, so a
    /// colon inside the repository path is never mistaken for a tag.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if reference.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid(&format!("exceeds {} bytes", MAX_IMAGE_REF_LEN)));
        }
        if reference.contains('@') {
            return Err(invalid("digest references are not supported"));
        }
        if !reference.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
            return Err(invalid("contains invalid characters"));
        }

        let name_start = reference.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match reference[name_start..].rfind(':') {
            Some(i) => {
                let split = name_start + i;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, DEFAULT_TAG),
        };

        if tag.is_empty() {
            return Err(invalid("tag is empty"));
        }
        if name.is_empty() || name.split('/').any(str::is_empty) {
            return Err(invalid("repository name is empty"));
        }
        if name.split('/').any(|part| part == "." || part == "..") {
            return Err(invalid("repository contains relative path components"));
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("{}/{}", OFFICIAL_NAMESPACE, name)
        };

        Ok(Self {
            repository,
            tag: tag.to_string(),
        })
    }

    /// Repository path on the registry, e.g. `library/alpine`.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tag to resolve, e.g. `latest`.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Content-addressed identifier of the form `<algorithm>:<encoded>`.
///
/// Algorithm follows `[a-z0-9]+([+._-][a-z0-9]+)*` and the encoded part
/// `[a-zA-Z0-9=_-]+`, as in the OCI image spec. Neither part can contain a
/// path separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    value: String,
    split: usize,
}

impl Digest {
    /// Parses and validates a digest string.
    pub fn parse(digest: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidDigest {
            digest: digest.to_string(),
            reason: reason.to_string(),
        };

        let (algorithm, encoded) = digest
            .split_once(':')
            .ok_or_else(|| invalid("missing ':' separator"))?;

        if !is_valid_algorithm(algorithm) {
            return Err(invalid("malformed algorithm"));
        }
        if encoded.is_empty()
            || !encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '=' || c == '_' || c == '-')
        {
            return Err(invalid("malformed encoded part"));
        }

        Ok(Self {
            value: digest.to_string(),
            split: algorithm.len(),
        })
    }

    /// Hash algorithm name, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        &self.value[..self.split]
    }

    /// Encoded hash with the algorithm prefix stripped.
    pub fn encoded(&self) -> &str {
        &self.value[self.split + 1..]
    }

    /// Full digest string.
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

fn is_valid_algorithm(algorithm: &str) -> bool {
    !algorithm.is_empty()
        && algorithm
            .split(['+', '.', '_', '-'])
            .all(|part| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            })
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.value
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}
