//! Upload pre-flight validation: MIME allow-list, per-type size ceilings, and
//! content sniffing so a declared type cannot smuggle mismatched bytes past
//! the collaborator boundary.

use sha2::{Digest, Sha256};
use std::io::Cursor;

/// Size ceiling for PDF uploads.
pub const MAX_PDF_BYTES: usize = 10 * 1024 * 1024;
/// Size ceiling for image uploads.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// ISO-BMFF major brands accepted for HEIC/HEIF containers.
const HEIF_BRANDS: [&[u8; 4]; 6] = [b"heic", b"heix", b"heif", b"heis", b"mif1", b"msf1"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FileError {
    #[error("Unsupported file type: {0}. Supported types: JPEG, PNG, HEIC, HEIF, PDF")]
    UnsupportedType(String),
    #[error("File too large: {size} bytes exceeds the {limit} byte limit for {label} uploads")]
    TooLarge {
        size: usize,
        limit: usize,
        label: &'static str,
    },
    #[error("Empty file upload")]
    Empty,
    #[error("File content does not match declared type {0}")]
    ContentMismatch(String),
    #[error("Unreadable PDF document: {0}")]
    CorruptPdf(String),
}

/// Accepted document kinds, derived from the declared MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Jpeg,
    Png,
    Heic,
    Heif,
}

impl DocumentKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/pdf" => Some(Self::Pdf),
            "image/jpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/heic" => Some(Self::Heic),
            "image/heif" => Some(Self::Heif),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Heic => "image/heic",
            Self::Heif => "image/heif",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Heic => "heic",
            Self::Heif => "heif",
        }
    }

    pub fn max_bytes(&self) -> usize {
        match self {
            Self::Pdf => MAX_PDF_BYTES,
            _ => MAX_IMAGE_BYTES,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Pdf => "PDF",
            _ => "image",
        }
    }
}

/// Validate an upload against its declared MIME type. Checks run in order:
/// allow-list, emptiness, per-type size ceiling, then content sniffing.
pub fn validate(bytes: &[u8], mime: &str) -> Result<DocumentKind, FileError> {
    let kind =
        DocumentKind::from_mime(mime).ok_or_else(|| FileError::UnsupportedType(mime.to_string()))?;

    if bytes.is_empty() {
        return Err(FileError::Empty);
    }

    let limit = kind.max_bytes();
    if bytes.len() > limit {
        return Err(FileError::TooLarge {
            size: bytes.len(),
            limit,
            label: kind.label(),
        });
    }

    match kind {
        DocumentKind::Pdf => {
            if !bytes.starts_with(b"%PDF-") {
                return Err(FileError::ContentMismatch(mime.to_string()));
            }
            lopdf::Document::load_from(Cursor::new(bytes))
                .map_err(|e| FileError::CorruptPdf(e.to_string()))?;
        }
        DocumentKind::Jpeg => {
            if !matches!(image::guess_format(bytes), Ok(image::ImageFormat::Jpeg)) {
                return Err(FileError::ContentMismatch(mime.to_string()));
            }
        }
        DocumentKind::Png => {
            if !matches!(image::guess_format(bytes), Ok(image::ImageFormat::Png)) {
                return Err(FileError::ContentMismatch(mime.to_string()));
            }
        }
        DocumentKind::Heic | DocumentKind::Heif => {
            if !is_heif_container(bytes) {
                return Err(FileError::ContentMismatch(mime.to_string()));
            }
        }
    }

    Ok(kind)
}

/// Detect the document kind from content alone. Used when the stored bytes
/// are re-read later and no declared MIME type is at hand.
pub fn sniff(bytes: &[u8]) -> Option<DocumentKind> {
    if bytes.starts_with(b"%PDF-") {
        return Some(DocumentKind::Pdf);
    }
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => return Some(DocumentKind::Jpeg),
        Ok(image::ImageFormat::Png) => return Some(DocumentKind::Png),
        _ => {}
    }
    if is_heif_container(bytes) {
        return Some(DocumentKind::Heic);
    }
    None
}

/// Object-storage key for an upload: user scope, report scope, then a content
/// hash so the object name is stable for identical bytes.
pub fn storage_path(user_id: &str, report_id: &str, bytes: &[u8], kind: DocumentKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = format!("{:x}", hasher.finalize());
    format!(
        "{}/{}/{}.{}",
        user_id,
        report_id,
        &digest[..16],
        kind.extension()
    )
}

fn is_heif_container(bytes: &[u8]) -> bool {
    if bytes.len() < 12 || &bytes[4..8] != b"ftyp" {
        return false;
    }
    let brand: &[u8] = &bytes[8..12];
    HEIF_BRANDS.iter().any(|b| brand == *b)
}
