//! Format collaborators: raw file bytes in, plain UTF-8 text out.
//!
//! The import pipeline picks an [`Extractor`] by file extension through
//! [`Extractors`]. Only plain-text variants ship with the crate; other
//! formats can be plugged in by registering another extractor.

use crate::error::ExtractError;
use std::path::Path;

/// Turns the bytes of one file into text. Must not panic on bad input.
pub trait Extractor: Send + Sync {
    /// Format tag stored on the file record (e.g. `"text"`).
    fn format(&self) -> &'static str;

    /// Lower-case extensions (without the dot) this extractor handles.
    fn extensions(&self) -> &'static [&'static str];

    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError>;
}

/// Plain text and lightweight markup read verbatim.
pub struct PlainTextExtractor;

const PLAIN_TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "md", "markdown", "mdown", "rst", "org", "adoc", "log", "csv", "tsv",
];

impl Extractor for PlainTextExtractor {
    fn format(&self) -> &'static str {
        "text"
    }

    fn extensions(&self) -> &'static [&'static str] {
        PLAIN_TEXT_EXTENSIONS
    }

    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        if bytes.contains(&0) {
            return Err(ExtractError::Corrupt("binary content (NUL byte)".into()));
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ExtractError::Corrupt(format!("invalid UTF-8: {}", e)))?;
        Ok(text.to_string())
    }
}

/// Extension-keyed registry of extractors.
pub struct Extractors {
    extractors: Vec<Box<dyn Extractor>>,
}

impl Default for Extractors {
    fn default() -> Self {
        Self {
            extractors: vec![Box::new(PlainTextExtractor)],
        }
    }
}

impl Extractors {
    pub fn empty() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// Register an extractor. Later registrations win for shared extensions.
    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.extractors.insert(0, extractor);
    }

    pub fn for_path(&self, path: &Path) -> Option<&dyn Extractor> {
        let ext = extension_of(path)?;
        self.extractors
            .iter()
            .find(|e| e.extensions().contains(&ext.as_str()))
            .map(|e| e.as_ref())
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.for_path(path).is_some()
    }

    /// Pick an extractor by extension and run it.
    pub fn extract(&self, path: &Path, bytes: &[u8]) -> Result<(String, &'static str), ExtractError> {
        let extractor = self.for_path(path).ok_or_else(|| {
            ExtractError::Unsupported(extension_of(path).unwrap_or_else(|| "(none)".to_string()))
        })?;
        let text = extractor.extract(bytes)?;
        Ok((text, extractor.format()))
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let (text, format) = Extractors::default()
            .extract(Path::new("notes.TXT"), "héllo wörld".as_bytes())
            .unwrap();
        assert_eq!(text, "héllo wörld");
        assert_eq!(format, "text");
    }

    #[test]
    fn bom_is_stripped() {
        let text = PlainTextExtractor.extract(b"\xEF\xBB\xBFhello").unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn nul_bytes_are_unreadable() {
        let err = PlainTextExtractor.extract(b"abc\0def").unwrap_err();
        assert!(matches!(err, ExtractError::Corrupt(_)));
    }

    #[test]
    fn invalid_utf8_is_unreadable() {
        let err = PlainTextExtractor.extract(&[0x66, 0xff, 0xfe, 0x67]).unwrap_err();
        assert!(matches!(err, ExtractError::Corrupt(_)));
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let err = Extractors::default()
            .extract(Path::new("slides.pptx"), b"PK")
            .unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(ref e) if e == "pptx"));
        assert!(!Extractors::default().supports(Path::new("Makefile")));
    }

    struct Shouting;

    impl Extractor for Shouting {
        fn format(&self) -> &'static str {
            "shout"
        }
        fn extensions(&self) -> &'static [&'static str] {
            &["txt"]
        }
        fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
            Ok(String::from_utf8_lossy(bytes).to_uppercase())
        }
    }

    #[test]
    fn registered_extractor_takes_precedence() {
        let mut registry = Extractors::default();
        registry.register(Box::new(Shouting));
        let (text, format) = registry.extract(Path::new("a.txt"), b"quiet").unwrap();
        assert_eq!(text, "QUIET");
        assert_eq!(format, "shout");
    }
}
