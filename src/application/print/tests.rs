use std::{
    io::Cursor,
    num::NonZeroU32,
    path::Path,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::SystemTime,
};

use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use serde_json::json;
use tempfile::TempDir;

use super::*;
use crate::{
    application::conversion::Rasterizer,
    config::{ArtifactSettings, PrintSettings, TopicSettings},
};

#[derive(Default)]
struct FakeBackend {
    jobs: Mutex<Vec<PrintJob>>,
    describe_calls: AtomicUsize,
    unavailable: bool,
}

#[async_trait]
impl PrintBackend for FakeBackend {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn describe_capabilities(&self) -> Result<Value, BackendError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "layouts": [{"name": "A4 portrait"}],
            "dpis": [{"name": "96", "value": "96"}]
        }))
    }

    async fn render(&self, job: &PrintJob) -> Result<Bytes, BackendError> {
        self.jobs.lock().expect("jobs lock").push(job.clone());
        if self.unavailable {
            return Err(BackendError::unavailable("status 500 Internal Server Error"));
        }
        Ok(Bytes::from_static(b"%PDF-1.4 rendered"))
    }
}

#[derive(Default)]
struct FakeRasterizer {
    dpis: Mutex<Vec<u32>>,
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    async fn rasterize_png(&self, _pdf: &Path, dpi: u32) -> Result<Vec<u8>, ConversionError> {
        self.dpis.lock().expect("dpis lock").push(dpi);
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(2, 2, Rgb([255u8, 255, 255])))
            .write_to(&mut buffer, ImageFormat::Png)
            .expect("encode png");
        Ok(buffer.into_inner())
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<ArtifactStore>,
    backend: Arc<FakeBackend>,
    rasterizer: Arc<FakeRasterizer>,
    service: PrintService,
}

fn harness(backend: FakeBackend, with_rasterizer: bool, cache_capabilities: bool) -> Harness {
    harness_with_retention(
        backend,
        with_rasterizer,
        cache_capabilities,
        Duration::from_secs(600),
    )
}

fn harness_with_retention(
    backend: FakeBackend,
    with_rasterizer: bool,
    cache_capabilities: bool,
    retention: Duration,
) -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(
        ArtifactStore::new(&ArtifactSettings {
            directory: dir.path().to_path_buf(),
            file_prefix: "mfPrintTempFile".to_string(),
            ttl: Duration::from_secs(600),
            register_attempts: NonZeroU32::new(5).expect("non-zero"),
        })
        .expect("store"),
    );
    let print = PrintSettings {
        default_disclaimer: "Default disclaimer".to_string(),
        local_graphics_host: None,
        loopback_host: "127.0.0.1".to_string(),
        wms: None,
        cache_capabilities,
    };
    let topics = Arc::new(TopicCatalog::new(
        &[
            TopicSettings {
                name: "basis".to_string(),
                disclaimer: None,
                public: true,
            },
            TopicSettings {
                name: "cadastre".to_string(),
                disclaimer: None,
                public: false,
            },
        ],
        &print,
    ));

    let backend = Arc::new(backend);
    let rasterizer = Arc::new(FakeRasterizer::default());
    let conversion = Arc::new(ConversionStage::new(
        with_rasterizer.then(|| rasterizer.clone() as Arc<dyn Rasterizer>),
        store.clone(),
    ));
    let service = PrintService::new(
        backend.clone(),
        store.clone(),
        conversion,
        topics,
        JobFilter::new(&print),
        PrintOptions {
            retention,
            cache_capabilities,
        },
    );

    Harness {
        _dir: dir,
        store,
        backend,
        rasterizer,
        service,
    }
}

fn origin() -> RequestOrigin {
    RequestOrigin::new("http", "maps.example.org")
}

fn job(value: Value) -> PrintJob {
    serde_json::from_value(value).expect("job")
}

fn artifact_count(store: &ArtifactStore) -> usize {
    std::fs::read_dir(store.directory())
        .expect("read dir")
        .count()
}

#[tokio::test]
async fn png_job_is_rasterized_at_requested_dpi() {
    let h = harness(FakeBackend::default(), true, true);
    let requester = h.service.topics().requester(None);

    let outcome = h
        .service
        .create(
            job(json!({
                "dpi": 96,
                "outputFormat": "png",
                "layers": [{"type": "WMS", "baseURL": "http://wms.example.org/basis"}],
                "pages": [{"center": [1.0, 2.0]}]
            })),
            &requester,
            &origin(),
        )
        .await
        .expect("create");

    assert_eq!(outcome.artifact.format, OutputFormat::Png);
    assert_eq!(outcome.layers_removed, 0);
    assert_eq!(
        outcome.descriptor.get_url,
        format!("http://maps.example.org/print/{}.png", outcome.artifact.id)
    );
    assert!(OffsetDateTime::parse(&outcome.descriptor.expires_at, &Rfc3339).is_ok());
    assert_eq!(*h.rasterizer.dpis.lock().expect("dpis lock"), vec![96]);

    // Only the raster copy is left behind.
    assert_eq!(artifact_count(&h.store), 1);
    let (bytes, format) = h
        .service
        .fetch(&outcome.artifact.file_name())
        .await
        .expect("fetch png");
    assert_eq!(format, OutputFormat::Png);
    assert!(bytes.starts_with(b"\x89PNG"));

    let rendered = h.backend.jobs.lock().expect("jobs lock");
    assert_eq!(rendered[0].output_format, OutputFormat::Png);
    assert_eq!(rendered[0].layers.len(), 1);
}

#[tokio::test]
async fn pdf_job_keeps_rendered_bytes() {
    let h = harness(FakeBackend::default(), true, true);
    let requester = h.service.topics().requester(None);

    let outcome = h
        .service
        .create(job(json!({"dpi": 150})), &requester, &origin())
        .await
        .expect("create");

    assert_eq!(outcome.artifact.format, OutputFormat::Pdf);
    assert!(outcome.descriptor.get_url.ends_with(".pdf"));
    let (bytes, _) = h
        .service
        .fetch(&outcome.artifact.file_name())
        .await
        .expect("fetch pdf");
    assert_eq!(&bytes[..], b"%PDF-1.4 rendered");
    assert!(h.rasterizer.dpis.lock().expect("dpis lock").is_empty());
}

#[tokio::test]
async fn unauthorized_layers_are_dropped_and_reported() {
    let h = harness(FakeBackend::default(), true, true);
    let requester = h.service.topics().requester(None);

    let outcome = h
        .service
        .create(
            job(json!({
                "dpi": 96,
                "layers": [
                    {"baseURL": "http://wms.example.org/cadastre"},
                    {"baseURL": "http://wms.example.org/cadastre/"}
                ]
            })),
            &requester,
            &origin(),
        )
        .await
        .expect("create");

    assert_eq!(outcome.layers_removed, 2);
    let rendered = h.backend.jobs.lock().expect("jobs lock");
    assert!(rendered[0].layers.is_empty());
}

#[tokio::test]
async fn unavailable_backend_leaves_no_artifact() {
    let h = harness(
        FakeBackend {
            unavailable: true,
            ..Default::default()
        },
        true,
        true,
    );
    let requester = h.service.topics().requester(None);

    let err = h
        .service
        .create(job(json!({"dpi": 96})), &requester, &origin())
        .await
        .expect_err("backend failure");

    assert!(matches!(err, PrintError::BackendUnavailable(_)));
    assert_eq!(artifact_count(&h.store), 0);
}

#[tokio::test]
async fn raster_jobs_are_rejected_without_rasterizer() {
    let h = harness(FakeBackend::default(), false, true);
    let requester = h.service.topics().requester(None);

    let err = h
        .service
        .create(
            job(json!({"dpi": 96, "outputFormat": "gif"})),
            &requester,
            &origin(),
        )
        .await
        .expect_err("conversion unavailable");

    assert!(matches!(
        err,
        PrintError::ConversionUnavailable(OutputFormat::Gif)
    ));
    assert!(h.backend.jobs.lock().expect("jobs lock").is_empty());
}

#[tokio::test]
async fn zero_dpi_is_a_validation_error() {
    let h = harness(FakeBackend::default(), true, true);
    let requester = h.service.topics().requester(None);

    let err = h
        .service
        .create(job(json!({"dpi": 0})), &requester, &origin())
        .await
        .expect_err("zero dpi");
    assert!(matches!(err, PrintError::Validation(_)));
}

#[tokio::test]
async fn create_sweeps_expired_artifacts_first() {
    let h = harness(FakeBackend::default(), true, true);
    let requester = h.service.topics().requester(None);
    let stale = h
        .store
        .register(b"%PDF-1.4 stale", OutputFormat::Pdf)
        .await
        .expect("stale artifact");
    std::fs::File::options()
        .write(true)
        .open(h.store.path(stale))
        .expect("open stale")
        .set_modified(SystemTime::now() - Duration::from_secs(601))
        .expect("age stale");

    h.service
        .create(job(json!({"dpi": 96})), &requester, &origin())
        .await
        .expect("create");

    assert!(matches!(
        h.service.fetch(&stale.file_name()).await,
        Err(PrintError::NotFound)
    ));
}

#[tokio::test]
async fn describe_merges_formats_and_create_url() {
    let h = harness(FakeBackend::default(), true, true);

    let document = h.service.describe(&origin()).await.expect("describe");

    assert_eq!(document["layouts"][0]["name"], "A4 portrait");
    assert_eq!(
        document["outputFormats"],
        json!([
            {"name": "pdf"},
            {"name": "png"},
            {"name": "jpg"},
            {"name": "tif"},
            {"name": "gif"}
        ])
    );
    assert_eq!(
        document["createURL"],
        "http://maps.example.org/print/create.json"
    );
}

#[tokio::test]
async fn describe_reports_pdf_only_without_rasterizer() {
    let h = harness(FakeBackend::default(), false, true);

    let document = h.service.describe(&origin()).await.expect("describe");
    assert_eq!(document["outputFormats"], json!([{"name": "pdf"}]));
}

#[tokio::test]
async fn capabilities_are_memoized_when_enabled() {
    let cached = harness(FakeBackend::default(), true, true);
    cached.service.describe(&origin()).await.expect("first");
    cached.service.describe(&origin()).await.expect("second");
    assert_eq!(cached.backend.describe_calls.load(Ordering::SeqCst), 1);

    let uncached = harness(FakeBackend::default(), true, false);
    uncached.service.describe(&origin()).await.expect("first");
    uncached.service.describe(&origin()).await.expect("second");
    assert_eq!(uncached.backend.describe_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fetch_rejects_unknown_names() {
    let h = harness(FakeBackend::default(), true, true);
    let artifact = h
        .store
        .register(b"%PDF-1.4", OutputFormat::Pdf)
        .await
        .expect("register");

    assert!(h.service.fetch(&artifact.file_name()).await.is_ok());
    for name in [
        format!("{}.exe", artifact.id),
        format!("{}.png", artifact.id),
        "not-a-number.pdf".to_string(),
        artifact.id.to_string(),
    ] {
        assert!(
            matches!(h.service.fetch(&name).await, Err(PrintError::NotFound)),
            "{name} must be not found"
        );
    }
}

#[tokio::test]
async fn overflowing_retention_fails_instead_of_panicking() {
    let h = harness_with_retention(FakeBackend::default(), false, true, Duration::MAX);
    let requester = h.service.topics().requester(None);

    let err = h
        .service
        .create(
            job(json!({"dpi": 96, "outputFormat": "pdf"})),
            &requester,
            &origin(),
        )
        .await
        .expect_err("expiry cannot be represented");

    assert!(matches!(err, PrintError::Unexpected(_)));
    assert_eq!(h.backend.jobs.lock().expect("jobs lock").len(), 1);
}
