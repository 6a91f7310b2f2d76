//! Image Intake Module
//!
//! Validates submitted photos and stages them as owned, disposable handles.
//! A handle owns its buffer exclusively; releasing it (explicitly or on drop)
//! frees the buffer and updates the live-handle accounting.

use crate::config::DEFAULT_MAX_IMAGE_BYTES;
use crate::error::ScanError;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type Result<T> = std::result::Result<T, ScanError>;

/// MIME types a file picker may declare for a decodable photo
pub const ACCEPTED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/webp",
    "image/bmp",
    "image/gif",
    "image/tiff",
];

/// Strip parameters and case from a declared MIME type
pub fn normalize_mime(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn is_accepted_mime(mime_type: &str) -> bool {
    let normalized = normalize_mime(mime_type);
    ACCEPTED_MIME_TYPES.contains(&normalized.as_str())
}

#[derive(Debug, Default)]
struct IntakeMetrics {
    live: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

/// Staged image, exclusively owned by the scan that acquired it
pub struct UploadedImage {
    id: String,
    mime_type: String,
    buffer: Option<Vec<u8>>,
    metrics: Arc<IntakeMetrics>,
}

impl UploadedImage {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Image bytes, or `None` once the handle has been released
    pub fn bytes(&self) -> Option<&[u8]> {
        self.buffer.as_deref()
    }

    pub fn len(&self) -> usize {
        self.buffer.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_released(&self) -> bool {
        self.buffer.is_none()
    }

    fn release_buffer(&mut self) -> bool {
        if self.buffer.take().is_some() {
            self.metrics.live.fetch_sub(1, Ordering::SeqCst);
            self.metrics.released.fetch_add(1, Ordering::Relaxed);
            crate::metrics::IMAGES_LIVE.dec();
            debug!(image_id = %self.id, "Released staged image");
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for UploadedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadedImage")
            .field("id", &self.id)
            .field("mime_type", &self.mime_type)
            .field("len", &self.len())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for UploadedImage {
    fn drop(&mut self) {
        self.release_buffer();
    }
}

/// Intake usage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeStats {
    pub live: usize,
    pub acquired: usize,
    pub released: usize,
}

/// Validates and stages submitted images
#[derive(Clone)]
pub struct ImageIntake {
    max_image_bytes: usize,
    metrics: Arc<IntakeMetrics>,
}

impl ImageIntake {
    pub fn new(max_image_bytes: usize) -> Self {
        Self {
            max_image_bytes,
            metrics: Arc::new(IntakeMetrics::default()),
        }
    }

    /// Validate the declared type and payload, then take ownership of the bytes
    pub fn acquire(&self, bytes: Vec<u8>, mime_type: &str) -> Result<UploadedImage> {
        let normalized = normalize_mime(mime_type);
        if !ACCEPTED_MIME_TYPES.contains(&normalized.as_str()) {
            return Err(ScanError::InvalidInput(format!(
                "unsupported file type '{}', expected one of: {}",
                mime_type,
                ACCEPTED_MIME_TYPES.join(", ")
            )));
        }

        if bytes.is_empty() {
            return Err(ScanError::InvalidInput("image is empty".to_string()));
        }

        if bytes.len() > self.max_image_bytes {
            return Err(ScanError::InvalidInput(format!(
                "image size {} bytes exceeds limit of {} bytes",
                bytes.len(),
                self.max_image_bytes
            )));
        }

        let image = UploadedImage {
            id: uuid::Uuid::new_v4().to_string(),
            mime_type: normalized,
            buffer: Some(bytes),
            metrics: Arc::clone(&self.metrics),
        };

        self.metrics.live.fetch_add(1, Ordering::SeqCst);
        self.metrics.acquired.fetch_add(1, Ordering::Relaxed);
        crate::metrics::IMAGES_LIVE.inc();
        debug!(image_id = %image.id, mime = %image.mime_type, size = image.len(), "Staged image");

        Ok(image)
    }

    /// Free the handle's buffer. Safe to call on an already released handle.
    pub fn release(&self, image: &mut UploadedImage) {
        image.release_buffer();
    }

    pub fn max_image_bytes(&self) -> usize {
        self.max_image_bytes
    }

    pub fn live_handles(&self) -> usize {
        self.metrics.live.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> IntakeStats {
        IntakeStats {
            live: self.metrics.live.load(Ordering::SeqCst),
            acquired: self.metrics.acquired.load(Ordering::Relaxed),
            released: self.metrics.released.load(Ordering::Relaxed),
        }
    }
}

impl Default for ImageIntake {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IMAGE_BYTES)
    }
}
