//! Derives raster artifacts from rendered PDF documents.

use std::{io::Cursor, path::Path, sync::Arc, time::Instant};

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use metrics::histogram;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    application::backend::looks_like_pdf,
    domain::{OutputFormat, artifact::ArtifactRef},
    infra::artifacts::{ArtifactError, ArtifactStore},
};

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("raster conversion is not available on this node")]
    Unavailable,
    #[error("conversion input is not a PDF document: {0}")]
    InvalidInput(String),
    #[error("rasterizer failed: {message}")]
    Rasterizer { message: String },
    #[error("failed to encode {format}: {message}")]
    Encode {
        format: OutputFormat,
        message: String,
    },
    #[error("artifact storage failed: {0}")]
    Storage(#[from] ArtifactError),
}

impl ConversionError {
    pub fn rasterizer(message: impl Into<String>) -> Self {
        Self::Rasterizer {
            message: message.into(),
        }
    }
}

/// Renders the first page of a PDF file to PNG bytes.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn rasterize_png(&self, pdf: &Path, dpi: u32) -> Result<Vec<u8>, ConversionError>;
}

pub struct ConversionStage {
    rasterizer: Option<Arc<dyn Rasterizer>>,
    store: Arc<ArtifactStore>,
}

impl ConversionStage {
    pub fn new(rasterizer: Option<Arc<dyn Rasterizer>>, store: Arc<ArtifactStore>) -> Self {
        Self { rasterizer, store }
    }

    pub fn is_available(&self) -> bool {
        self.rasterizer.is_some()
    }

    /// Formats this node can deliver: everything with a rasterizer, pdf otherwise.
    pub fn supported_formats(&self) -> &'static [OutputFormat] {
        if self.is_available() {
            &OutputFormat::ALL
        } else {
            &[OutputFormat::Pdf]
        }
    }

    pub fn supports(&self, format: OutputFormat) -> bool {
        !format.requires_conversion() || self.is_available()
    }

    /// Convert a stored PDF artifact into `target`.
    ///
    /// A pdf target returns `source` unchanged. Otherwise the raster copy is
    /// registered under a new identifier and the PDF is deleted; on failure
    /// the PDF stays in place.
    pub async fn convert(
        &self,
        source: ArtifactRef,
        target: OutputFormat,
        dpi: u32,
    ) -> Result<ArtifactRef, ConversionError> {
        if !target.requires_conversion() {
            return Ok(source);
        }
        let Some(rasterizer) = self.rasterizer.as_ref() else {
            return Err(ConversionError::Unavailable);
        };

        let started_at = Instant::now();
        if source.format != OutputFormat::Pdf {
            return Err(ConversionError::InvalidInput(format!(
                "source artifact {} is not a pdf",
                source.file_name()
            )));
        }

        let pdf = self.store.read_artifact(source).await?;
        if !looks_like_pdf(&pdf) {
            return Err(ConversionError::InvalidInput(format!(
                "artifact {} lacks the PDF header",
                source.file_name()
            )));
        }

        let png = rasterizer
            .rasterize_png(&self.store.path(source), dpi)
            .await?;
        let encoded = tokio::task::spawn_blocking(move || encode(png, target))
            .await
            .map_err(|err| ConversionError::Encode {
                format: target,
                message: format!("encoder task failed: {err}"),
            })??;

        let converted = self.store.register(&encoded, target).await?;
        if let Err(err) = self.store.delete(source).await {
            warn!(
                target = "geoprint::conversion",
                op = "conversion::convert",
                artifact = %source.file_name(),
                error = %err,
                "Failed to delete source PDF after conversion"
            );
        }

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        histogram!("geoprint_convert_ms", "format" => target.extension())
            .record(elapsed_ms as f64);
        info!(
            target = "geoprint::conversion",
            op = "conversion::convert",
            result = "ok",
            elapsed_ms,
            dpi,
            source = %source.file_name(),
            artifact = %converted.file_name(),
            bytes = encoded.len(),
            "PDF rasterized"
        );

        Ok(converted)
    }
}

fn encode(png: Vec<u8>, target: OutputFormat) -> Result<Vec<u8>, ConversionError> {
    let encode_error = |message: String| ConversionError::Encode {
        format: target,
        message,
    };

    let image = image::load_from_memory_with_format(&png, ImageFormat::Png)
        .map_err(|err| ConversionError::rasterizer(format!("unreadable PNG output: {err}")))?;

    let (image, format) = match target {
        OutputFormat::Png => return Ok(png),
        // JPEG has no alpha channel.
        OutputFormat::Jpg => (DynamicImage::ImageRgb8(image.to_rgb8()), ImageFormat::Jpeg),
        OutputFormat::Tif => (image, ImageFormat::Tiff),
        OutputFormat::Gif => (DynamicImage::ImageRgba8(image.to_rgba8()), ImageFormat::Gif),
        OutputFormat::Pdf => return Err(encode_error("pdf is not a raster format".to_string())),
    };

    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, format)
        .map_err(|err| encode_error(err.to_string()))?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArtifactSettings;
    use image::{ImageBuffer, Rgba};
    use std::{num::NonZeroU32, sync::Mutex, time::Duration};
    use tempfile::TempDir;

    struct FakeRasterizer {
        calls: Mutex<Vec<u32>>,
        fail: bool,
    }

    impl FakeRasterizer {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl Rasterizer for FakeRasterizer {
        async fn rasterize_png(&self, pdf: &Path, dpi: u32) -> Result<Vec<u8>, ConversionError> {
            assert!(pdf.exists(), "rasterizer must see the stored pdf");
            self.calls.lock().expect("calls lock").push(dpi);
            if self.fail {
                return Err(ConversionError::rasterizer("Syntax Error: broken xref"));
            }
            let page = ImageBuffer::from_pixel(4, 3, Rgba([200u8, 30, 30, 128]));
            let mut buffer = Cursor::new(Vec::new());
            DynamicImage::ImageRgba8(page)
                .write_to(&mut buffer, ImageFormat::Png)
                .expect("encode png");
            Ok(buffer.into_inner())
        }
    }

    fn store(dir: &TempDir) -> Arc<ArtifactStore> {
        Arc::new(
            ArtifactStore::new(&ArtifactSettings {
                directory: dir.path().to_path_buf(),
                file_prefix: "mfPrintTempFile".to_string(),
                ttl: Duration::from_secs(600),
                register_attempts: NonZeroU32::new(5).expect("non-zero"),
            })
            .expect("store"),
        )
    }

    async fn stored_pdf(store: &ArtifactStore) -> ArtifactRef {
        store
            .register(b"%PDF-1.4 test document", OutputFormat::Pdf)
            .await
            .expect("register pdf")
    }

    #[tokio::test]
    async fn pdf_target_is_identity() {
        let dir = TempDir::new().expect("temp dir");
        let store = store(&dir);
        let stage = ConversionStage::new(None, store.clone());
        let pdf = stored_pdf(&store).await;

        let result = stage
            .convert(pdf, OutputFormat::Pdf, 150)
            .await
            .expect("identity");

        assert_eq!(result, pdf);
        assert_eq!(
            &store.read_artifact(pdf).await.expect("pdf kept")[..],
            b"%PDF-1.4 test document"
        );
    }

    #[tokio::test]
    async fn png_conversion_replaces_pdf_with_new_artifact() {
        let dir = TempDir::new().expect("temp dir");
        let store = store(&dir);
        let rasterizer = FakeRasterizer::new(false);
        let stage = ConversionStage::new(Some(rasterizer.clone()), store.clone());
        let pdf = stored_pdf(&store).await;

        let png = stage
            .convert(pdf, OutputFormat::Png, 96)
            .await
            .expect("convert");

        assert_eq!(png.format, OutputFormat::Png);
        assert_ne!(png.id, pdf.id);
        assert!(store.read(png.id, "png").await.is_ok());
        assert!(matches!(
            store.read(pdf.id, "pdf").await,
            Err(ArtifactError::NotFound)
        ));
        assert_eq!(*rasterizer.calls.lock().expect("calls lock"), vec![96]);
    }

    #[tokio::test]
    async fn jpeg_tiff_and_gif_outputs_carry_their_signatures() {
        let dir = TempDir::new().expect("temp dir");
        let store = store(&dir);
        let stage = ConversionStage::new(Some(FakeRasterizer::new(false)), store.clone());

        let cases: [(OutputFormat, &[u8]); 3] = [
            (OutputFormat::Jpg, &[0xFF, 0xD8, 0xFF]),
            (OutputFormat::Tif, b"II*\0"),
            (OutputFormat::Gif, b"GIF8"),
        ];
        for (format, signature) in cases {
            let pdf = stored_pdf(&store).await;
            let artifact = stage.convert(pdf, format, 72).await.expect("convert");
            let bytes = store.read_artifact(artifact).await.expect("read raster");
            assert!(
                bytes.starts_with(signature),
                "{format} output has wrong signature"
            );
        }
    }

    #[tokio::test]
    async fn non_pdf_input_is_rejected_and_kept() {
        let dir = TempDir::new().expect("temp dir");
        let store = store(&dir);
        let rasterizer = FakeRasterizer::new(false);
        let stage = ConversionStage::new(Some(rasterizer.clone()), store.clone());
        let bogus = store
            .register(b"<html>not a pdf</html>", OutputFormat::Pdf)
            .await
            .expect("register");

        let err = stage
            .convert(bogus, OutputFormat::Png, 96)
            .await
            .expect_err("invalid input");

        assert!(matches!(err, ConversionError::InvalidInput(_)));
        assert!(store.read_artifact(bogus).await.is_ok());
        assert!(rasterizer.calls.lock().expect("calls lock").is_empty());
    }

    #[tokio::test]
    async fn rasterizer_failure_leaves_pdf_in_place() {
        let dir = TempDir::new().expect("temp dir");
        let store = store(&dir);
        let stage = ConversionStage::new(Some(FakeRasterizer::new(true)), store.clone());
        let pdf = stored_pdf(&store).await;

        let err = stage
            .convert(pdf, OutputFormat::Gif, 96)
            .await
            .expect_err("rasterizer failure");

        assert!(matches!(err, ConversionError::Rasterizer { .. }));
        assert!(store.read_artifact(pdf).await.is_ok());
    }

    #[tokio::test]
    async fn missing_rasterizer_limits_formats() {
        let dir = TempDir::new().expect("temp dir");
        let store = store(&dir);
        let stage = ConversionStage::new(None, store.clone());
        let pdf = stored_pdf(&store).await;

        assert_eq!(stage.supported_formats(), &[OutputFormat::Pdf]);
        assert!(stage.supports(OutputFormat::Pdf));
        assert!(!stage.supports(OutputFormat::Png));
        assert!(matches!(
            stage.convert(pdf, OutputFormat::Png, 96).await,
            Err(ConversionError::Unavailable)
        ));
    }
}
