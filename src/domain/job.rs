//! Print job document as submitted by map clients.
//!
//! Only the fields the dispatcher inspects are typed. Everything else is kept
//! in `extra` maps so the print engine receives the document unchanged apart
//! from the rewrites applied during layer filtering.

use geoprint_api_types::OutputFormat;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A single print request: layers, pages, resolution and output format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    #[serde(default)]
    pub layers: Vec<LayerDescriptor>,
    #[serde(default)]
    pub pages: Vec<PageDescriptor>,
    pub dpi: u32,
    #[serde(rename = "outputFormat", default)]
    pub output_format: OutputFormat,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PrintJob {
    /// Serialize the document handed to the print engine.
    ///
    /// The engine only ever produces PDF; raster formats are derived afterwards,
    /// so the requested format is replaced before the job leaves the service.
    pub fn engine_document(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut engine_job = self.clone();
        engine_job.output_format = OutputFormat::Pdf;
        serde_json::to_vec(&engine_job)
    }
}

const BASE_URL_KEY: &str = "baseURL";
const STYLES_KEY: &str = "styles";

/// Layer entry of a print job.
///
/// Any layer carrying a non-null `baseURL` is access-checked, whatever the
/// shape of its other fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LayerDescriptor {
    Wms(WmsLayer),
    /// Has a `baseURL` but does not fit the WMS shape. Never printed.
    MalformedWms(Map<String, Value>),
    /// Client-side vector features with inline styles.
    Vector(VectorLayer),
    Other(Map<String, Value>),
}

impl LayerDescriptor {
    fn classify(fields: Map<String, Value>) -> Self {
        if fields.get(BASE_URL_KEY).is_some_and(|value| !value.is_null()) {
            return match serde_json::from_value(Value::Object(fields.clone())) {
                Ok(layer) => Self::Wms(layer),
                Err(_) => Self::MalformedWms(fields),
            };
        }
        if fields.contains_key(STYLES_KEY)
            && let Ok(layer) = serde_json::from_value(Value::Object(fields.clone()))
        {
            return Self::Vector(layer);
        }
        Self::Other(fields)
    }
}

impl<'de> Deserialize<'de> for LayerDescriptor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Map::<String, Value>::deserialize(deserializer).map(Self::classify)
    }
}

/// Topic name encoded as the last non-empty path segment of a base URL.
pub fn topic_of(base_url: &str) -> Option<String> {
    let url = url::Url::parse(base_url).ok()?;
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WmsLayer {
    #[serde(rename = "baseURL")]
    pub base_url: String,
    #[serde(
        rename = "customParams",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub custom_params: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WmsLayer {
    pub fn topic(&self) -> Option<String> {
        topic_of(&self.base_url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorLayer {
    pub styles: VectorStyles,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Vector styles are normally keyed by style name. Some clients send other
/// shapes (for example `[""]`), which are passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VectorStyles {
    Named(BTreeMap<String, VectorStyle>),
    Opaque(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorStyle {
    #[serde(
        rename = "externalGraphic",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub external_graphic: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disclaimer: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Scheme and host of the incoming request, used for absolute URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOrigin {
    pub protocol: String,
    pub host: String,
}

impl RequestOrigin {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.host)
    }
}
