//! Subject reference parsing.
//!
//! A subject reference names the container image a verification or mutation
//! request is about, in the usual `repo[:tag][@digest]` form. Parsing is a
//! pure function over the input string: it performs no I/O and no
//! normalization beyond splitting, so equal inputs always produce equal
//! outcomes.
//!
//! The accepted grammar follows the OCI distribution reference format:
//! an optional registry host (with optional port), one or more lowercase
//! repository path components, an optional tag, and an optional digest. A
//! reference must carry at least a tag or a digest; a bare repository path
//! is rejected rather than defaulted to `latest`, because downstream
//! resolution is keyed on what the client actually asked for.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a tag, per the distribution specification.
const MAX_TAG_LEN: usize = 128;

/// Errors produced while parsing a subject reference.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    /// The reference has no repository path.
    #[error("missing repository path")]
    MissingRepository,

    /// The repository path is not valid under the distribution grammar.
    #[error("invalid repository path {0:?}")]
    InvalidRepository(String),

    /// The tag portion contains invalid characters or is too long.
    #[error("invalid tag {0:?}")]
    InvalidTag(String),

    /// The digest portion is malformed.
    #[error(transparent)]
    InvalidDigest(#[from] DigestError),

    /// Neither a tag nor a digest is present.
    #[error("reference carries neither tag nor digest")]
    MissingTagOrDigest,
}

/// Errors produced while parsing a digest string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// The digest is not in `algorithm:hex` form.
    #[error("digest must be in algorithm:hex form")]
    MissingSeparator,

    /// The digest algorithm is not one this crate accepts.
    #[error("unsupported digest algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    /// The hex portion has the wrong length for the algorithm.
    #[error("digest hex is {found} characters, expected {expected}")]
    WrongLength {
        /// Number of hex characters found.
        found: usize,
        /// Number of hex characters the algorithm requires.
        expected: usize,
    },

    /// The hex portion contains non-hex characters.
    #[error("digest hex contains non-hexadecimal characters")]
    InvalidHex,
}

/// A validated content digest in `algorithm:hex` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Parses and validates a digest string.
    ///
    /// # Errors
    ///
    /// Returns a [`DigestError`] when the string is not a well-formed
    /// `sha256` or `sha512` digest with lowercase hex.
    pub fn parse(input: &str) -> Result<Self, DigestError> {
        let (algorithm, hex) = input
            .split_once(':')
            .ok_or(DigestError::MissingSeparator)?;

        let expected = match algorithm {
            "sha256" => 64,
            "sha512" => 128,
            other => return Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        };

        if hex.len() != expected {
            return Err(DigestError::WrongLength {
                found: hex.len(),
                expected,
            });
        }
        if !hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(DigestError::InvalidHex);
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_string(),
        })
    }

    /// The digest algorithm, e.g. `sha256`.
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The lowercase hex portion of the digest.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// A parsed subject reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    original: String,
    path: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    /// Parses a subject reference string.
    ///
    /// # Errors
    ///
    /// Returns a [`ReferenceError`] when the string is not a valid image
    /// reference or carries neither tag nor digest.
    pub fn parse(original: &str) -> Result<Self, ReferenceError> {
        if original.is_empty() {
            return Err(ReferenceError::MissingRepository);
        }

        let (name, digest) = match original.split_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest)?)),
            None => (original, None),
        };

        // A colon after the last slash separates the tag; a colon before it
        // belongs to the registry port.
        let last_slash = name.rfind('/');
        let (path, tag) = match name.rfind(':') {
            Some(idx) if last_slash.map_or(true, |slash| idx > slash) => {
                (&name[..idx], Some(&name[idx + 1..]))
            }
            _ => (name, None),
        };

        if path.is_empty() {
            return Err(ReferenceError::MissingRepository);
        }
        validate_repository(path)?;
        if let Some(tag) = tag {
            if !is_valid_tag(tag) {
                return Err(ReferenceError::InvalidTag(tag.to_string()));
            }
        }
        if tag.is_none() && digest.is_none() {
            return Err(ReferenceError::MissingTagOrDigest);
        }

        Ok(Self {
            original: original.to_string(),
            path: path.to_string(),
            tag: tag.map(str::to_string),
            digest,
        })
    }

    /// The raw string as submitted by the client.
    #[must_use]
    pub fn original(&self) -> &str {
        &self.original
    }

    /// The repository path without tag or digest.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The tag, when present.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The digest, when present.
    #[must_use]
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Returns a copy of this reference pinned to the given digest.
    ///
    /// The original string is preserved; only the digest field changes, so
    /// the caller can still correlate the result with what was submitted.
    #[must_use]
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            digest: Some(digest),
            ..self.clone()
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// Validates the repository portion: `[registry/]component(/component)*`.
fn validate_repository(path: &str) -> Result<(), ReferenceError> {
    let invalid = || ReferenceError::InvalidRepository(path.to_string());

    let mut segments = path.split('/');
    let first = segments.next().ok_or_else(invalid)?;
    let rest: Vec<&str> = segments.collect();

    // The leading segment is a registry host when it can only be one: it
    // contains a dot or port, or is the literal `localhost`.
    let first_is_registry =
        !rest.is_empty() && (first.contains('.') || first.contains(':') || first == "localhost");

    if first_is_registry {
        if !is_valid_registry(first) {
            return Err(invalid());
        }
    } else if !is_valid_path_component(first) {
        return Err(invalid());
    }

    for component in rest {
        if !is_valid_path_component(component) {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Validates a registry host with optional `:port`.
fn is_valid_registry(registry: &str) -> bool {
    let (host, port) = match registry.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (registry, None),
    };

    if host.is_empty()
        || !host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
        || host.starts_with('.')
        || host.ends_with('.')
    {
        return false;
    }
    match port {
        Some(port) => !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
        None => true,
    }
}

/// Validates one repository path component: lowercase alphanumeric runs
/// joined by `.`, `_`, `__`, or a run of `-`.
fn is_valid_path_component(component: &str) -> bool {
    fn is_alnum(b: u8) -> bool {
        b.is_ascii_lowercase() || b.is_ascii_digit()
    }

    let bytes = component.as_bytes();
    let mut i = 0;
    loop {
        let run_start = i;
        while i < bytes.len() && is_alnum(bytes[i]) {
            i += 1;
        }
        if i == run_start {
            // Every separator must be followed by an alphanumeric run.
            return false;
        }
        if i == bytes.len() {
            return true;
        }
        match bytes[i] {
            b'.' => i += 1,
            b'_' => {
                i += 1;
                if i < bytes.len() && bytes[i] == b'_' {
                    i += 1;
                }
            }
            b'-' => {
                while i < bytes.len() && bytes[i] == b'-' {
                    i += 1;
                }
            }
            _ => return false,
        }
    }
}

/// Validates a tag: `[A-Za-z0-9_]` followed by up to 127 word, dot, or dash
/// characters.
fn is_valid_tag(tag: &str) -> bool {
    let mut bytes = tag.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    if !(first.is_ascii_alphanumeric() || first == b'_') {
        return false;
    }
    tag.len() <= MAX_TAG_LEN
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}
