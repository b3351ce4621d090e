//! Access filtering and engine-specific rewrites applied to every print job.

use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{
    application::topics::{Requester, TopicCatalog},
    config::{PrintSettings, WmsRewriteSettings},
    domain::job::{
        LayerDescriptor, PageDescriptor, PrintJob, RequestOrigin, VectorLayer, VectorStyles,
        WmsLayer, topic_of,
    },
};

const DPI_PARAM: &str = "DPI";
const MAP_RESOLUTION_PARAM: &str = "map_resolution";
const BLANK_TEXT: &str = " ";

/// Outcome of filtering: how many layers were dropped and for which topics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterReport {
    pub layers_removed: usize,
    pub removed_topics: Vec<String>,
    pub layers_kept: usize,
}

#[derive(Debug, Clone)]
pub struct JobFilter {
    wms: Option<WmsRewriteSettings>,
    graphics_host: Option<String>,
    loopback_host: String,
}

impl JobFilter {
    pub fn new(print: &PrintSettings) -> Self {
        Self {
            wms: print.wms.clone(),
            graphics_host: print.local_graphics_host.clone(),
            loopback_host: print.loopback_host.clone(),
        }
    }

    /// Drop unauthorized WMS layers and rewrite the rest of the job in place.
    pub fn apply(
        &self,
        job: &mut PrintJob,
        requester: &Requester,
        origin: &RequestOrigin,
        catalog: &TopicCatalog,
    ) -> FilterReport {
        let mut report = FilterReport::default();
        let dpi = job.dpi;

        job.layers.retain_mut(|layer| match layer {
            LayerDescriptor::Wms(wms) => match wms.topic() {
                Some(topic) if requester.is_authorized(&topic) => {
                    self.rewrite_wms(wms, &topic, dpi);
                    true
                }
                topic => {
                    debug!(
                        target = "geoprint::filter",
                        op = "filter::apply",
                        base_url = %wms.base_url,
                        topic = topic.as_deref().unwrap_or(""),
                        "Dropping layer of unauthorized topic"
                    );
                    report.layers_removed += 1;
                    report.removed_topics.push(topic.unwrap_or_default());
                    false
                }
            },
            LayerDescriptor::MalformedWms(fields) => {
                let topic = fields
                    .get("baseURL")
                    .and_then(Value::as_str)
                    .and_then(topic_of)
                    .unwrap_or_default();
                debug!(
                    target = "geoprint::filter",
                    op = "filter::apply",
                    topic = %topic,
                    "Dropping layer with malformed WMS fields"
                );
                report.layers_removed += 1;
                report.removed_topics.push(topic);
                false
            }
            LayerDescriptor::Vector(vector) => {
                self.rewrite_vector(vector);
                true
            }
            LayerDescriptor::Other(_) => true,
        });
        report.layers_kept = job.layers.len();

        let base_url = origin.base_url();
        for page in &mut job.pages {
            prepare_page(page, &base_url, requester, catalog);
        }

        report
    }

    fn rewrite_wms(&self, layer: &mut WmsLayer, topic: &str, dpi: u32) {
        let params = layer.custom_params.get_or_insert_with(Default::default);
        params.remove(DPI_PARAM);
        params.insert(MAP_RESOLUTION_PARAM.to_string(), Value::from(dpi));

        let Some(wms) = self.wms.as_ref() else {
            return;
        };
        let is_local = Url::parse(&layer.base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
            .is_some_and(|host| wms.hosts.contains(&host));
        if !is_local {
            return;
        }

        let uses_layer_filter = wms.layer_filter_prefix.as_deref().is_some_and(|prefix| {
            params.keys().any(|name| name.starts_with(prefix))
        });
        let endpoint = match (&wms.mapserver_cgi_url, uses_layer_filter) {
            (Some(cgi), true) => cgi,
            _ => &wms.mapserver_url,
        };
        layer.base_url = format!("{endpoint}?MAP={}/{topic}.map&", wms.map_dir);
    }

    fn rewrite_vector(&self, layer: &mut VectorLayer) {
        let VectorStyles::Named(styles) = &mut layer.styles else {
            return;
        };
        for graphic in styles
            .values_mut()
            .filter_map(|style| style.external_graphic.as_mut())
        {
            let mut rewritten = false;
            if let Some(host) = self.graphics_host.as_deref()
                && graphic.contains(host)
            {
                *graphic = graphic.replace(host, &self.loopback_host);
                rewritten = true;
            }
            if (rewritten || self.targets_loopback(graphic))
                && let Some(rest) = graphic.strip_prefix("https:")
            {
                *graphic = format!("http:{rest}");
            }
        }
    }

    fn targets_loopback(&self, graphic: &str) -> bool {
        Url::parse(graphic)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .is_some_and(|host| host.eq_ignore_ascii_case(&self.loopback_host))
    }
}

fn prepare_page(
    page: &mut PageDescriptor,
    base_url: &str,
    requester: &Requester,
    catalog: &TopicCatalog,
) {
    if let Some(center) = page.center.as_mut() {
        for coordinate in center.iter_mut() {
            *coordinate = round_coordinate(*coordinate);
        }
    }
    fill_blank(&mut page.user_title);
    fill_blank(&mut page.user_comment);
    page.base_url = Some(base_url.to_string());
    page.disclaimer = Some(
        catalog
            .disclaimer_for(page.topic.as_deref(), requester)
            .to_string(),
    );
}

/// Round to two decimals.
pub fn round_coordinate(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn fill_blank(text: &mut Option<String>) {
    if text.as_deref().is_none_or(|value| value.trim().is_empty()) {
        *text = Some(BLANK_TEXT.to_string());
    }
}
