use std::fmt;
use std::str::FromStr;

use geoprint_api_types::OutputFormat;
use thiserror::Error;
use uuid::Uuid;

/// Opaque handle of a temporary print artifact: a non-negative 31-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactId(u32);

impl ArtifactId {
    pub const MAX: u32 = (1 << 31) - 1;

    /// Draw a fresh identifier from the random bits of a v4 UUID.
    pub fn random() -> Self {
        let bits = Uuid::new_v4().as_u128() as u32;
        Self(bits & Self::MAX)
    }

    pub fn new(value: u32) -> Option<Self> {
        (value <= Self::MAX).then_some(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid artifact identifier `{0}`")]
pub struct InvalidArtifactId(pub String);

impl FromStr for ArtifactId {
    type Err = InvalidArtifactId;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // Digits only: no sign, no whitespace.
        if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(InvalidArtifactId(value.to_string()));
        }
        value
            .parse::<u32>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| InvalidArtifactId(value.to_string()))
    }
}

/// Identifier and format of a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    pub id: ArtifactId,
    pub format: OutputFormat,
}

impl ArtifactRef {
    pub fn new(id: ArtifactId, format: OutputFormat) -> Self {
        Self { id, format }
    }

    /// Public file name, `<id>.<extension>`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.id, self.format.extension())
    }
}

/// Split a retrieval path segment such as `1234.png` into its parts.
///
/// The extension is returned raw; resolving it against the known formats is
/// left to the store so unknown formats surface as not-found.
pub fn split_file_name(file_name: &str) -> Option<(ArtifactId, &str)> {
    let (id, extension) = file_name.rsplit_once('.')?;
    let id = id.parse().ok()?;
    Some((id, extension))
}
