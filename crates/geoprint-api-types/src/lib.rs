//! Wire types shared between the geoprint service and its clients.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Output formats a print job may request.
///
/// Only [`OutputFormat::Pdf`] is produced by the print engine itself; every
/// other format is derived from the PDF by rasterization.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pdf,
    Png,
    Jpg,
    Tif,
    Gif,
}

impl OutputFormat {
    /// Every supported format, in advertisement order.
    pub const ALL: [OutputFormat; 5] = [
        OutputFormat::Pdf,
        OutputFormat::Png,
        OutputFormat::Jpg,
        OutputFormat::Tif,
        OutputFormat::Gif,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Png => "png",
            OutputFormat::Jpg => "jpg",
            OutputFormat::Tif => "tif",
            OutputFormat::Gif => "gif",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Pdf => "application/pdf",
            OutputFormat::Png => "image/png",
            OutputFormat::Jpg => "image/jpeg",
            OutputFormat::Tif => "image/tiff",
            OutputFormat::Gif => "image/gif",
        }
    }

    /// Resolve a file extension. Matching is exact: `PDF` or `jpeg` are not recognised.
    pub fn from_extension(extension: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.extension() == extension)
    }

    pub fn requires_conversion(self) -> bool {
        !matches!(self, OutputFormat::Pdf)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOutputFormat(pub String);

impl fmt::Display for UnknownOutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown output format `{}`", self.0)
    }
}

impl std::error::Error for UnknownOutputFormat {}

impl FromStr for OutputFormat {
    type Err = UnknownOutputFormat;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_extension(value).ok_or_else(|| UnknownOutputFormat(value.to_string()))
    }
}

/// One entry of the `outputFormats` list in the capabilities document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormatEntry {
    pub name: OutputFormat,
}

/// Response body of a successful create call.
///
/// The URL is not signed; anyone holding it can fetch the artifact until the
/// retention sweep removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalDescriptor {
    #[serde(rename = "getURL")]
    pub get_url: String,
    /// RFC 3339 instant after which the artifact may be swept.
    #[serde(rename = "expiresAt")]
    pub expires_at: String,
}
