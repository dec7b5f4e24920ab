//! Turns uploaded files and images into `Attachment`s.
//!
//! Text-like formats are reduced to linear text and truncated to a character budget,
//! keeping the leading portion (CVs and JDs front-load what matters). Images are only
//! validated and, when too large, downscaled; the model reads them itself.
//!
//! Extraction failures are recoverable: the caller gets a degraded attachment with no
//! text and a warning instead of an error.

pub mod extractor;
pub mod image;

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;

pub use extractor::{BuiltinExtractor, DocumentExtractor};

/// Appended after truncated document text.
pub const TRUNCATION_MARKER: &str = "\n[... document truncated ...]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Document,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    PlainText,
    Markdown,
    Docx,
    Pdf,
    Png,
    Jpeg,
    Gif,
    Webp,
}

impl SourceFormat {
    /// Resolves a declared format: an extension (`pdf`, `.pdf`), a file name
    /// (`cv.pdf`) or a MIME type (`application/pdf`).
    pub fn from_declared(declared: &str) -> Option<Self> {
        let declared = declared.trim().to_lowercase();
        let token = match declared.split_once('/') {
            Some((_, subtype)) => subtype.to_string(),
            None => declared
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .to_string(),
        };

        match token.as_str() {
            "txt" | "text" | "plain" => Some(SourceFormat::PlainText),
            "md" | "markdown" | "x-markdown" => Some(SourceFormat::Markdown),
            "docx" | "vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(SourceFormat::Docx)
            }
            "pdf" => Some(SourceFormat::Pdf),
            "png" => Some(SourceFormat::Png),
            "jpg" | "jpeg" => Some(SourceFormat::Jpeg),
            "gif" => Some(SourceFormat::Gif),
            "webp" => Some(SourceFormat::Webp),
            _ => None,
        }
    }

    pub fn kind(&self) -> AttachmentKind {
        match self {
            SourceFormat::PlainText
            | SourceFormat::Markdown
            | SourceFormat::Docx
            | SourceFormat::Pdf => AttachmentKind::Document,
            SourceFormat::Png | SourceFormat::Jpeg | SourceFormat::Gif | SourceFormat::Webp => {
                AttachmentKind::Image
            }
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            SourceFormat::PlainText => "text/plain",
            SourceFormat::Markdown => "text/markdown",
            SourceFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            SourceFormat::Pdf => "application/pdf",
            SourceFormat::Png => "image/png",
            SourceFormat::Jpeg => "image/jpeg",
            SourceFormat::Gif => "image/gif",
            SourceFormat::Webp => "image/webp",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceFormat::PlainText => "txt",
            SourceFormat::Markdown => "md",
            SourceFormat::Docx => "docx",
            SourceFormat::Pdf => "pdf",
            SourceFormat::Png => "png",
            SourceFormat::Jpeg => "jpeg",
            SourceFormat::Gif => "gif",
            SourceFormat::Webp => "webp",
        }
    }
}

/// A normalized upload, ready to be placed into a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    pub name: String,
    pub kind: AttachmentKind,
    pub source_format: SourceFormat,
    pub extracted_text: Option<String>,
    /// Image payload passed to the model as a visual part. Never serialized.
    #[serde(skip)]
    pub image: Option<Bytes>,
    pub size_bytes: usize,
    pub truncated: bool,
    /// Set when the attachment was produced despite a recoverable failure.
    pub warning: Option<String>,
}

impl Attachment {
    #[cfg(test)]
    pub fn is_degraded(&self) -> bool {
        self.warning.is_some()
    }

    /// Documents without text and images without a payload carry nothing for the model.
    pub fn is_unreadable(&self) -> bool {
        match self.kind {
            AttachmentKind::Document => self.extracted_text.is_none(),
            AttachmentKind::Image => self.image.is_none(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum NormalizationError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("attachment is {size} bytes; the limit is {limit} bytes")]
    SizeExceeded { size: usize, limit: usize },

    #[error("could not extract text from {format}: {reason}")]
    ExtractionFailed { format: String, reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct NormalizerLimits {
    pub max_bytes: usize,
    pub max_chars: usize,
    pub image_downscale_bytes: usize,
    pub image_max_dimension: u32,
}

impl From<&Config> for NormalizerLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_bytes: config.max_attachment_bytes,
            max_chars: config.max_document_chars,
            image_downscale_bytes: config.image_downscale_bytes,
            image_max_dimension: config.image_max_dimension,
        }
    }
}

#[derive(Clone)]
pub struct DocumentNormalizer {
    extractor: Arc<dyn DocumentExtractor>,
    limits: NormalizerLimits,
}

impl DocumentNormalizer {
    pub fn new(extractor: Arc<dyn DocumentExtractor>, limits: NormalizerLimits) -> Self {
        Self { extractor, limits }
    }

    /// Normalizes one upload. `ExtractionFailed` never escapes: it becomes a degraded
    /// attachment carrying a warning.
    pub fn normalize(
        &self,
        name: &str,
        bytes: &[u8],
        declared_kind: AttachmentKind,
        declared_format: &str,
    ) -> Result<Attachment, NormalizationError> {
        let format = SourceFormat::from_declared(declared_format)
            .ok_or_else(|| NormalizationError::UnsupportedFormat(declared_format.to_string()))?;

        if format.kind() != declared_kind {
            return Err(NormalizationError::UnsupportedFormat(format!(
                "{} is not a supported {:?} format",
                format.label(),
                declared_kind
            )));
        }

        if bytes.len() > self.limits.max_bytes {
            return Err(NormalizationError::SizeExceeded {
                size: bytes.len(),
                limit: self.limits.max_bytes,
            });
        }

        let attachment = match format.kind() {
            AttachmentKind::Document => self.normalize_document(name, bytes, format),
            AttachmentKind::Image => self.normalize_image(name, bytes, format),
        };

        match &attachment.warning {
            Some(warning) => warn!("Attachment '{name}' degraded: {warning}"),
            None => info!(
                "Normalized attachment '{name}' ({}, {} bytes, truncated={})",
                format.label(),
                attachment.size_bytes,
                attachment.truncated
            ),
        }
        Ok(attachment)
    }

    fn normalize_document(&self, name: &str, bytes: &[u8], format: SourceFormat) -> Attachment {
        let mut attachment = Attachment {
            name: name.to_string(),
            kind: AttachmentKind::Document,
            source_format: format,
            extracted_text: None,
            image: None,
            size_bytes: bytes.len(),
            truncated: false,
            warning: None,
        };

        match self.extractor.extract(bytes, format) {
            Ok(raw) => {
                let text = linearize(&raw);
                if text.is_empty() {
                    attachment.warning = Some(format!("{name} contains no readable text"));
                } else {
                    let (text, truncated) = truncate_chars(&text, self.limits.max_chars);
                    attachment.extracted_text = Some(text);
                    attachment.truncated = truncated;
                }
            }
            Err(e) => attachment.warning = Some(e.to_string()),
        }
        attachment
    }

    fn normalize_image(&self, name: &str, bytes: &[u8], format: SourceFormat) -> Attachment {
        let mut attachment = Attachment {
            name: name.to_string(),
            kind: AttachmentKind::Image,
            source_format: format,
            extracted_text: None,
            image: None,
            size_bytes: bytes.len(),
            truncated: false,
            warning: None,
        };

        match image::prepare_image(bytes, format, &self.limits) {
            Ok(prepared) => {
                attachment.source_format = prepared.format;
                attachment.size_bytes = prepared.data.len();
                attachment.image = Some(prepared.data);
            }
            Err(e) => attachment.warning = Some(e.to_string()),
        }
        attachment
    }
}

/// Reduces extracted text to plain lines: whitespace runs collapse, blank lines go.
pub fn linearize(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keeps the first `max_chars` characters, appending `TRUNCATION_MARKER` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => (format!("{}{TRUNCATION_MARKER}", &text[..byte_index]), true),
        None => (text.to_string(), false),
    }
}
