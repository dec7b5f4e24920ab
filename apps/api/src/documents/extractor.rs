//! Raw text extraction per document format.
//!
//! Extractors are synchronous and CPU-bound; async callers run them inside
//! `tokio::task::spawn_blocking`.

use std::io::{Cursor, Read};

use zip::ZipArchive;

use super::{NormalizationError, SourceFormat};

const DOCX_BODY: &str = "word/document.xml";

/// Pulls raw text out of a document. Image formats are never passed here.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], format: SourceFormat) -> Result<String, NormalizationError>;
}

/// Extractor for the formats the assistant accepts out of the box.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinExtractor;

impl DocumentExtractor for BuiltinExtractor {
    fn extract(&self, bytes: &[u8], format: SourceFormat) -> Result<String, NormalizationError> {
        match format {
            SourceFormat::PlainText | SourceFormat::Markdown => {
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
            SourceFormat::Docx => extract_docx(bytes),
            SourceFormat::Pdf => extract_pdf(bytes),
            other => Err(failed(other, "not a document format")),
        }
    }
}

fn failed(format: SourceFormat, reason: impl Into<String>) -> NormalizationError {
    NormalizationError::ExtractionFailed {
        format: format.label().to_string(),
        reason: reason.into(),
    }
}

fn extract_docx(bytes: &[u8]) -> Result<String, NormalizationError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| failed(SourceFormat::Docx, format!("not a valid docx archive: {e}")))?;
    let mut entry = archive
        .by_name(DOCX_BODY)
        .map_err(|e| failed(SourceFormat::Docx, format!("missing {DOCX_BODY}: {e}")))?;

    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|e| failed(SourceFormat::Docx, format!("unreadable {DOCX_BODY}: {e}")))?;

    Ok(xml_to_text(&xml))
}

/// pdf-extract panics on some malformed inputs; a panic is reported as a failed extraction.
fn extract_pdf(bytes: &[u8]) -> Result<String, NormalizationError> {
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(failed(SourceFormat::Pdf, e.to_string())),
        Err(_) => Err(failed(SourceFormat::Pdf, "the PDF structure is corrupted")),
    }
}

/// Strips WordprocessingML tags, turning paragraph ends and breaks into newlines.
fn xml_to_text(xml: &str) -> String {
    let with_breaks = xml
        .replace("</w:p>", "\n")
        .replace("<w:tab/>", "\t")
        .replace("<w:br/>", "\n");

    let mut text = String::with_capacity(with_breaks.len());
    let mut in_tag = false;
    for ch in with_breaks.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }

    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::{CompressionMethod, ZipWriter};

    fn docx_with_body(body: &str) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file("[Content_Types].xml", opts).unwrap();
        zip.write_all(b"<Types></Types>").unwrap();
        zip.start_file(DOCX_BODY, opts).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_plain_text_is_decoded_lossily() {
        let text = BuiltinExtractor
            .extract(b"Skills: Python\xff", SourceFormat::PlainText)
            .unwrap();
        assert!(text.starts_with("Skills: Python"));
    }

    #[test]
    fn test_docx_paragraphs_become_lines() {
        let bytes = docx_with_body(
            r#"<w:document><w:body><w:p><w:r><w:t>Nguyen Van A</w:t></w:r></w:p><w:p><w:r><w:t>Python &amp; Django</w:t></w:r></w:p></w:body></w:document>"#,
        );
        let text = BuiltinExtractor.extract(&bytes, SourceFormat::Docx).unwrap();
        assert_eq!(text, "Nguyen Van A\nPython & Django\n");
    }

    #[test]
    fn test_docx_without_body_fails() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("other.xml", FileOptions::default()).unwrap();
        zip.write_all(b"<x/>").unwrap();
        let bytes = zip.finish().unwrap().into_inner();

        let err = BuiltinExtractor
            .extract(&bytes, SourceFormat::Docx)
            .unwrap_err();
        assert!(matches!(err, NormalizationError::ExtractionFailed { ref format, .. } if format == "docx"));
    }

    #[test]
    fn test_garbage_docx_fails() {
        assert!(BuiltinExtractor
            .extract(b"not a zip", SourceFormat::Docx)
            .is_err());
    }

    #[test]
    fn test_garbage_pdf_fails_without_panicking() {
        let err = BuiltinExtractor
            .extract(b"%PDF-1.4 garbage", SourceFormat::Pdf)
            .unwrap_err();
        assert!(matches!(err, NormalizationError::ExtractionFailed { ref format, .. } if format == "pdf"));
    }
}
