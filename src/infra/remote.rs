use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::histogram;
use reqwest::{Client, Url};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    application::backend::{BackendError, PrintBackend, looks_like_pdf},
    config::RemoteSettings,
    domain::job::PrintJob,
};

/// Forwards print jobs to a print service reachable over HTTP.
pub struct RemoteServiceBackend {
    client: Client,
    endpoint: Url,
    info_url: Url,
}

impl RemoteServiceBackend {
    pub fn new(settings: &RemoteSettings) -> Result<Self, BackendError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.timeout)
            .build()
            .map_err(|err| BackendError::unavailable(format!("http client: {err}")))?;

        let info_url = match settings.info_url.clone() {
            Some(url) => url,
            None => settings.url.join("info.json").map_err(|err| {
                BackendError::unavailable(format!("cannot derive info URL: {err}"))
            })?,
        };

        Ok(Self {
            client,
            endpoint: settings.url.clone(),
            info_url,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("geoprint/", env!("CARGO_PKG_VERSION"))
    }

    fn render_url(&self, job: &PrintJob) -> Result<Url, BackendError> {
        let document = job
            .engine_document()
            .map_err(|err| BackendError::unavailable(format!("failed to serialize job: {err}")))?;
        let document = String::from_utf8(document)
            .map_err(|err| BackendError::unavailable(format!("job is not UTF-8: {err}")))?;

        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("spec", &document);
        Ok(url)
    }
}

#[async_trait]
impl PrintBackend for RemoteServiceBackend {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn describe_capabilities(&self) -> Result<Value, BackendError> {
        let started_at = Instant::now();
        let response = self
            .client
            .get(self.info_url.clone())
            .send()
            .await
            .map_err(|err| unavailable("remote::describe_capabilities", started_at, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(
                "remote::describe_capabilities",
                started_at,
                format!("status {status} from {}", self.info_url),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| unavailable("remote::describe_capabilities", started_at, err))?;

        serde_json::from_slice(&body).map_err(|err| {
            unavailable(
                "remote::describe_capabilities",
                started_at,
                format!("capabilities are not valid JSON: {err}"),
            )
        })
    }

    async fn render(&self, job: &PrintJob) -> Result<Bytes, BackendError> {
        let started_at = Instant::now();
        let url = self.render_url(job)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| unavailable("remote::render", started_at, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(unavailable(
                "remote::render",
                started_at,
                format!("status {status} from {}: {body}", self.endpoint),
            ));
        }

        let pdf = response
            .bytes()
            .await
            .map_err(|err| unavailable("remote::render", started_at, err))?;

        if !looks_like_pdf(&pdf) {
            return Err(unavailable(
                "remote::render",
                started_at,
                format!("response of {} bytes is not a PDF document", pdf.len()),
            ));
        }

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        histogram!("geoprint_render_ms", "backend" => "remote").record(elapsed_ms as f64);
        info!(
            target = "geoprint::remote",
            op = "remote::render",
            result = "ok",
            elapsed_ms,
            pdf_bytes = pdf.len(),
            "Remote print service rendered job"
        );

        Ok(pdf)
    }
}

fn unavailable(op: &'static str, started_at: Instant, detail: impl ToString) -> BackendError {
    let message = detail.to_string();
    warn!(
        target = "geoprint::remote",
        op,
        result = "error",
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        error_code = "backend_unavailable",
        error = %message,
        "Remote print service call failed"
    );
    BackendError::unavailable(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;
    use serde_json::json;
    use std::time::Duration;

    fn settings(server: &MockServer, info_url: Option<&str>) -> RemoteSettings {
        RemoteSettings {
            url: Url::parse(&server.url("/print/pdf/print.pdf")).expect("endpoint"),
            info_url: info_url.map(|path| Url::parse(&server.url(path)).expect("info url")),
            timeout: Duration::from_secs(5),
        }
    }

    fn job() -> PrintJob {
        serde_json::from_value(json!({
            "dpi": 150,
            "outputFormat": "jpg",
            "layout": "A4 portrait"
        }))
        .expect("job")
    }

    #[tokio::test]
    async fn render_sends_job_in_spec_parameter() {
        let server = MockServer::start();
        let expected = String::from_utf8(job().engine_document().expect("document"))
            .expect("utf-8 document");
        let mock = server.mock(|when, then| {
            when.method("GET")
                .path("/print/pdf/print.pdf")
                .query_param("spec", expected.as_str());
            then.status(200)
                .header("content-type", "application/pdf")
                .body("%PDF-1.4 remote");
        });

        let backend = RemoteServiceBackend::new(&settings(&server, None)).expect("backend");
        let pdf = backend.render(&job()).await.expect("render");

        mock.assert();
        assert_eq!(&pdf[..], b"%PDF-1.4 remote");
    }

    #[tokio::test]
    async fn server_error_is_backend_unavailable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/print/pdf/print.pdf");
            then.status(500).body("engine crashed");
        });

        let backend = RemoteServiceBackend::new(&settings(&server, None)).expect("backend");
        let err = backend.render(&job()).await.expect_err("500 must fail");

        match err {
            BackendError::Unavailable { message } => assert!(message.contains("500")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_pdf_body_is_backend_unavailable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/print/pdf/print.pdf");
            then.status(200).body("<html>login required</html>");
        });

        let backend = RemoteServiceBackend::new(&settings(&server, None)).expect("backend");
        let err = backend.render(&job()).await.expect_err("html must fail");
        assert!(matches!(err, BackendError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn capabilities_default_to_info_json_next_to_endpoint() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("GET").path("/print/pdf/info.json");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"layouts":[{"name":"A4 portrait"}]}"#);
        });

        let backend = RemoteServiceBackend::new(&settings(&server, None)).expect("backend");
        let capabilities = backend.describe_capabilities().await.expect("capabilities");

        mock.assert();
        assert_eq!(capabilities["layouts"][0]["name"], "A4 portrait");
    }

    #[tokio::test]
    async fn capabilities_use_configured_info_url() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("GET").path("/custom/capabilities");
            then.status(200).body(r#"{"dpis":[{"value":"96"}]}"#);
        });

        let backend = RemoteServiceBackend::new(&settings(&server, Some("/custom/capabilities")))
            .expect("backend");
        let capabilities = backend.describe_capabilities().await.expect("capabilities");

        mock.assert();
        assert_eq!(capabilities["dpis"][0]["value"], "96");
    }

    #[tokio::test]
    async fn unreachable_service_is_backend_unavailable() {
        let endpoint = RemoteSettings {
            url: Url::parse("http://127.0.0.1:9/print.pdf").expect("url"),
            info_url: None,
            timeout: Duration::from_secs(2),
        };
        let backend = RemoteServiceBackend::new(&endpoint).expect("backend");
        let err = backend.describe_capabilities().await.expect_err("unreachable");
        assert!(matches!(err, BackendError::Unavailable { .. }));
    }
}
