//! Text extraction for uploaded assets.
//!
//! Plain text and markdown are always supported. PDF and DOCX extraction
//! depends on externally registered extractor hooks; when no hook is
//! registered for the content type the ingestor fails with
//! `UnsupportedFormat` and writes nothing.

use std::sync::Arc;

use crate::core::errors::CoreError;
use crate::store::DocumentType;

pub type ExtractorFn = Arc<dyn Fn(&[u8]) -> Result<String, CoreError> + Send + Sync>;

#[derive(Default, Clone)]
pub struct Extractors {
    pdf: Option<ExtractorFn>,
    docx: Option<ExtractorFn>,
}

impl Extractors {
    pub fn with_pdf(mut self, extractor: ExtractorFn) -> Self {
        self.pdf = Some(extractor);
        self
    }

    pub fn with_docx(mut self, extractor: ExtractorFn) -> Self {
        self.docx = Some(extractor);
        self
    }

    pub fn extract(
        &self,
        document_type: DocumentType,
        bytes: &[u8],
    ) -> Result<String, CoreError> {
        match document_type {
            DocumentType::Txt | DocumentType::Md => decode_utf8(bytes),
            DocumentType::Pdf => match &self.pdf {
                Some(extract) => extract(bytes),
                None => Err(CoreError::UnsupportedFormat(
                    "no PDF extractor registered".to_string(),
                )),
            },
            DocumentType::Docx => match &self.docx {
                Some(extract) => extract(bytes),
                None => Err(CoreError::UnsupportedFormat(
                    "no DOCX extractor registered".to_string(),
                )),
            },
        }
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String, CoreError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| CoreError::UnsupportedFormat(format!("file is not valid UTF-8: {e}")))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text).to_string())
}

/// Map an upload's content type (or, failing that, its filename extension)
/// to a supported document type.
pub fn detect_document_type(
    filename: &str,
    content_type: &str,
) -> Result<DocumentType, CoreError> {
    match content_type {
        "application/pdf" => return Ok(DocumentType::Pdf),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            return Ok(DocumentType::Docx)
        }
        "text/plain" => return Ok(DocumentType::Txt),
        "text/markdown" => return Ok(DocumentType::Md),
        _ => {}
    }

    let extension = filename.rsplit('.').next().unwrap_or("").to_lowercase();
    DocumentType::parse(&extension).ok_or_else(|| {
        CoreError::UnsupportedFormat(format!(
            "unsupported content type {content_type:?} for {filename:?}"
        ))
    })
}

/// Collapse whitespace runs while preserving paragraph boundaries.
pub fn normalize_text(raw: &str) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
        } else {
            current.extend(line.split_whitespace());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }

    paragraphs.join("\n\n")
}
