//! Turns an inbound image (bytes or URL, optional crop) into a content hash
//! and a location the embedding provider can fetch.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use glimpse_server::{CropBox, ImageQuery, ImageSource};
use image::{ImageFormat, codecs::jpeg::JpegEncoder};
use thiserror::Error;
use tokio::time::timeout;

use crate::constants::{
    CROP_JPEG_QUALITY, DEFAULT_CALL_TIMEOUT_MS, DEFAULT_SIGN_TTL_SECS, MIN_CROP_EDGE_PX,
    QUERY_OBJECT_PREFIX,
};
use crate::services::storage::{ObjectStorage, StorageError};

const MAX_FETCH_BYTES: usize = 20 * 1024 * 1024;

pub type ContentHash = String;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetching {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("fetching {url} returned {status}")]
    Status { url: String, status: u16 },
    #[error("image at {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error("fetching {url} timed out after {timeout_ms} ms")]
    TimedOut { url: String, timeout_ms: u64 },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Downloads remote images that need server-side cropping.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    http: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        debug_assert!(url.starts_with("http"));
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if let Some(length) = response.content_length()
            && length > MAX_FETCH_BYTES as u64
        {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                limit: MAX_FETCH_BYTES,
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        if bytes.len() > MAX_FETCH_BYTES {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                limit: MAX_FETCH_BYTES,
            });
        }
        Ok(bytes)
    }
}

/// Outcome of ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedImage {
    pub hash: ContentHash,
    /// URL handed to the embedding provider.
    pub location: String,
    /// Whether the bytes were written to object storage.
    pub stored: bool,
}

#[derive(bon::Builder)]
pub struct ImageIngestor {
    storage: Arc<dyn ObjectStorage>,
    fetcher: Arc<dyn ImageFetcher>,
    #[builder(default = Duration::from_secs(DEFAULT_SIGN_TTL_SECS))]
    sign_ttl: Duration,
    /// Bound on each fetch, upload and sign call.
    #[builder(default = Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS))]
    call_timeout: Duration,
}

impl ImageIngestor {
    pub async fn ingest(&self, query: &ImageQuery) -> Result<IngestedImage, IngestError> {
        match (&query.source, query.crop) {
            (ImageSource::Url(url), None) => Ok(IngestedImage {
                hash: content_hash(url.as_bytes()),
                location: url.clone(),
                stored: false,
            }),
            (ImageSource::Url(url), Some(crop)) => {
                let raw = self.fetch(url).await?;
                tracing::debug!(%url, size = raw.len(), "fetched remote image for cropping");
                let cropped = crop_off_thread(raw, crop).await;
                self.store(cropped).await
            }
            (ImageSource::Bytes(raw), Some(crop)) => {
                let cropped = crop_off_thread(raw.clone(), crop).await;
                self.store(cropped).await
            }
            (ImageSource::Bytes(raw), None) => self.store(raw.clone()).await,
        }
    }

    fn timeout_ms(&self) -> u64 {
        self.call_timeout.as_millis().min(u128::from(u64::MAX)) as u64
    }

    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        timeout(self.call_timeout, self.fetcher.fetch(url))
            .await
            .map_err(|_| FetchError::TimedOut {
                url: url.to_string(),
                timeout_ms: self.timeout_ms(),
            })?
    }

    async fn store(&self, bytes: Bytes) -> Result<IngestedImage, IngestError> {
        debug_assert!(!bytes.is_empty());
        let hash = content_hash(&bytes);
        let (extension, content_type) = sniff_format(&bytes);
        let path = format!("{QUERY_OBJECT_PREFIX}/{hash}.{extension}");
        let storage_timeout = |operation: &'static str| StorageError::TimedOut {
            operation,
            path: path.clone(),
            timeout_ms: self.timeout_ms(),
        };
        timeout(
            self.call_timeout,
            self.storage.upload(&path, bytes, content_type),
        )
        .await
        .map_err(|_| storage_timeout("upload"))??;
        let location = timeout(self.call_timeout, self.storage.sign(&path, self.sign_ttl))
            .await
            .map_err(|_| storage_timeout("sign"))??;
        Ok(IngestedImage {
            hash,
            location,
            stored: true,
        })
    }
}

pub fn content_hash(bytes: &[u8]) -> ContentHash {
    blake3::hash(bytes).to_hex().to_string()
}

fn sniff_format(bytes: &[u8]) -> (&'static str, &'static str) {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => ("png", "image/png"),
        Ok(ImageFormat::WebP) => ("webp", "image/webp"),
        Ok(ImageFormat::Gif) => ("gif", "image/gif"),
        _ => ("jpg", "image/jpeg"),
    }
}

async fn crop_off_thread(raw: Bytes, crop: CropBox) -> Bytes {
    let fallback = raw.clone();
    match tokio::task::spawn_blocking(move || crop_image(&raw, &crop)).await {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::warn!(%error, "crop task failed; using original image");
            fallback
        }
    }
}

/// Crop `raw` to the fractional box and re-encode as JPEG.
///
/// Returns the input unchanged when it cannot be decoded or when the clamped
/// region is at most `MIN_CROP_EDGE_PX` wide or tall.
pub fn crop_image(raw: &Bytes, crop: &CropBox) -> Bytes {
    match try_crop(raw, crop) {
        Ok(Some(encoded)) => Bytes::from(encoded),
        Ok(None) => raw.clone(),
        Err(error) => {
            tracing::debug!(%error, "image not croppable; using original bytes");
            raw.clone()
        }
    }
}

fn try_crop(raw: &[u8], crop: &CropBox) -> Result<Option<Vec<u8>>, image::ImageError> {
    let decoded = image::load_from_memory(raw)?;
    let (width, height) = (decoded.width(), decoded.height());
    let left = to_pixel(crop.x, width);
    let top = to_pixel(crop.y, height);
    let right = to_pixel(crop.x + crop.w, width);
    let bottom = to_pixel(crop.y + crop.h, height);

    if right.saturating_sub(left) <= MIN_CROP_EDGE_PX
        || bottom.saturating_sub(top) <= MIN_CROP_EDGE_PX
    {
        return Ok(None);
    }

    let region = decoded
        .crop_imm(left, top, right - left, bottom - top)
        .to_rgb8();
    let mut encoded = Vec::new();
    region.write_with_encoder(JpegEncoder::new_with_quality(
        &mut encoded,
        CROP_JPEG_QUALITY,
    ))?;
    Ok(Some(encoded))
}

fn to_pixel(fraction: f64, extent: u32) -> u32 {
    let scaled = (fraction * f64::from(extent)).trunc();
    if scaled.is_nan() {
        return 0;
    }
    scaled.clamp(0.0, f64::from(extent)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStorage {
        uploads: Mutex<Vec<(String, usize, String)>>,
    }

    #[async_trait]
    impl ObjectStorage for RecordingStorage {
        async fn upload(
            &self,
            path: &str,
            bytes: Bytes,
            content_type: &str,
        ) -> Result<(), StorageError> {
            self.uploads.lock().expect("uploads mutex").push((
                path.to_string(),
                bytes.len(),
                content_type.to_string(),
            ));
            Ok(())
        }

        async fn sign(&self, path: &str, _ttl: Duration) -> Result<String, StorageError> {
            Ok(format!("https://storage.test/{path}?token=t"))
        }
    }

    struct StaticFetcher(Bytes);

    #[async_trait]
    impl ImageFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> Result<Bytes, FetchError> {
            Ok(self.0.clone())
        }
    }

    fn png(width: u32, height: u32) -> Bytes {
        let image = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 40]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .expect("png encodes");
        Bytes::from(buf)
    }

    fn ingestor(storage: Arc<RecordingStorage>, fetched: Bytes) -> ImageIngestor {
        ImageIngestor::builder()
            .storage(storage)
            .fetcher(Arc::new(StaticFetcher(fetched)))
            .build()
    }

    #[test]
    fn crop_produces_jpeg_of_requested_region() {
        let raw = png(100, 50);
        let out = crop_image(
            &raw,
            &CropBox {
                x: 0.25,
                y: 0.2,
                w: 0.5,
                h: 0.6,
            },
        );
        assert_eq!(image::guess_format(&out).expect("format"), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&out).expect("decodes");
        assert_eq!((decoded.width(), decoded.height()), (50, 30));
    }

    #[test]
    fn crop_is_clamped_to_image_bounds() {
        let raw = png(40, 40);
        let out = crop_image(
            &raw,
            &CropBox {
                x: 0.5,
                y: -0.5,
                w: 2.0,
                h: 2.0,
            },
        );
        let decoded = image::load_from_memory(&out).expect("decodes");
        assert_eq!((decoded.width(), decoded.height()), (20, 40));
    }

    #[test]
    fn degenerate_crop_returns_original() {
        let raw = png(100, 100);
        let out = crop_image(
            &raw,
            &CropBox {
                x: 0.1,
                y: 0.1,
                w: 0.02,
                h: 0.5,
            },
        );
        assert_eq!(out, raw);
    }

    #[test]
    fn undecodable_input_returns_original() {
        let raw = Bytes::from_static(b"definitely not an image");
        let out = crop_image(
            &raw,
            &CropBox {
                x: 0.0,
                y: 0.0,
                w: 1.0,
                h: 1.0,
            },
        );
        assert_eq!(out, raw);
    }

    #[tokio::test]
    async fn url_without_crop_is_hashed_without_storage() {
        let storage = Arc::new(RecordingStorage::default());
        let ingestor = ingestor(storage.clone(), Bytes::new());
        let query = ImageQuery {
            source: ImageSource::Url("https://cdn.test/shoe.jpg".to_string()),
            crop: None,
        };

        let ingested = ingestor.ingest(&query).await.expect("ingest succeeds");

        assert_eq!(ingested.hash, content_hash(b"https://cdn.test/shoe.jpg"));
        assert_eq!(ingested.location, "https://cdn.test/shoe.jpg");
        assert!(!ingested.stored);
        assert!(storage.uploads.lock().expect("mutex").is_empty());
    }

    #[tokio::test]
    async fn file_is_hashed_after_crop_and_uploaded() {
        let storage = Arc::new(RecordingStorage::default());
        let ingestor = ingestor(storage.clone(), Bytes::new());
        let raw = png(64, 64);
        let crop = CropBox {
            x: 0.0,
            y: 0.0,
            w: 0.5,
            h: 0.5,
        };
        let query = ImageQuery {
            source: ImageSource::Bytes(raw.clone()),
            crop: Some(crop),
        };

        let ingested = ingestor.ingest(&query).await.expect("ingest succeeds");

        let expected = content_hash(&crop_image(&raw, &crop));
        assert_eq!(ingested.hash, expected);
        assert_ne!(ingested.hash, content_hash(&raw));
        let uploads = storage.uploads.lock().expect("mutex");
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, format!("queries/{expected}.jpg"));
        assert_eq!(uploads[0].2, "image/jpeg");
        assert!(ingested.location.contains(&expected));
    }

    #[tokio::test]
    async fn uncropped_png_keeps_its_format() {
        let storage = Arc::new(RecordingStorage::default());
        let ingestor = ingestor(storage.clone(), Bytes::new());
        let raw = png(8, 8);
        let query = ImageQuery {
            source: ImageSource::Bytes(raw.clone()),
            crop: None,
        };

        let ingested = ingestor.ingest(&query).await.expect("ingest succeeds");

        assert_eq!(ingested.hash, content_hash(&raw));
        let uploads = storage.uploads.lock().expect("mutex");
        assert_eq!(uploads[0].0, format!("queries/{}.png", ingested.hash));
        assert_eq!(uploads[0].2, "image/png");
    }

    #[tokio::test]
    async fn url_with_crop_is_fetched_and_stored() {
        let storage = Arc::new(RecordingStorage::default());
        let fetched = png(80, 80);
        let ingestor = ingestor(storage.clone(), fetched.clone());
        let crop = CropBox {
            x: 0.25,
            y: 0.25,
            w: 0.5,
            h: 0.5,
        };
        let query = ImageQuery {
            source: ImageSource::Url("https://cdn.test/look.png".to_string()),
            crop: Some(crop),
        };

        let ingested = ingestor.ingest(&query).await.expect("ingest succeeds");

        assert!(ingested.stored);
        assert_eq!(ingested.hash, content_hash(&crop_image(&fetched, &crop)));
        assert_eq!(storage.uploads.lock().expect("mutex").len(), 1);
    }

    struct StalledFetcher;

    #[async_trait]
    impl ImageFetcher for StalledFetcher {
        async fn fetch(&self, _url: &str) -> Result<Bytes, FetchError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Bytes::new())
        }
    }

    #[tokio::test]
    async fn stalled_fetch_times_out_as_fetch_error() {
        let storage = Arc::new(RecordingStorage::default());
        let ingestor = ImageIngestor::builder()
            .storage(storage.clone())
            .fetcher(Arc::new(StalledFetcher))
            .call_timeout(Duration::from_millis(20))
            .build();
        let query = ImageQuery {
            source: ImageSource::Url("https://cdn.test/slow.png".to_string()),
            crop: Some(CropBox {
                x: 0.0,
                y: 0.0,
                w: 0.5,
                h: 0.5,
            }),
        };

        let err = ingestor.ingest(&query).await.expect_err("fetch stalls");

        assert!(
            matches!(err, IngestError::Fetch(FetchError::TimedOut { ref url, timeout_ms: 20 }) if url == "https://cdn.test/slow.png"),
            "unexpected error: {err:?}"
        );
        assert!(storage.uploads.lock().expect("mutex").is_empty());
    }
}
