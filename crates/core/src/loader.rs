use crate::chunking::normalize_whitespace;
use crate::error::{RagError, Result};
use crate::models::Document;
use lopdf::Document as PdfDocument;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor: Send + Sync {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>> {
        let document = PdfDocument::load(path)
            .map_err(|error| RagError::Load(format!("{}: {error}", path.display())))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| RagError::Load(format!("{} page {page_no}: {error}", path.display())))?;

            pages.push(PageText {
                number: page_no,
                text,
            });
        }

        Ok(pages)
    }
}

#[derive(Debug, Clone)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub documents: Vec<Document>,
    pub skipped_files: Vec<SkippedPdf>,
}

/// Lists the PDF files directly inside `folder`, sorted by file name.
pub fn discover_pdf_files(folder: &Path) -> Result<Vec<PathBuf>> {
    if !folder.is_dir() {
        return Err(RagError::Load(format!(
            "source directory not found: {}",
            folder.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(folder).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|error| RagError::Load(error.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.into_path());
        }
    }

    files.sort_unstable();
    Ok(files)
}

pub fn load_documents(folder: &Path) -> Result<Vec<Document>> {
    let report = load_documents_with(folder, &LopdfExtractor, false)?;
    Ok(report.documents)
}

pub fn load_documents_with(
    folder: &Path,
    extractor: &dyn PdfExtractor,
    skip_unreadable: bool,
) -> Result<LoadReport> {
    let files = discover_pdf_files(folder)?;
    debug!(folder = %folder.display(), file_count = files.len(), "discovered pdf files");

    let mut report = LoadReport::default();
    for path in files {
        match load_file(&path, extractor) {
            Ok(documents) => report.documents.extend(documents),
            Err(error) if skip_unreadable => {
                warn!(path = %path.display(), reason = %error, "skipped pdf");
                report.skipped_files.push(SkippedPdf {
                    path,
                    reason: error.to_string(),
                });
            }
            Err(error) => return Err(error),
        }
    }

    Ok(report)
}

fn load_file(path: &Path, extractor: &dyn PdfExtractor) -> Result<Vec<Document>> {
    let mut pages = extractor.extract_pages(path)?;
    pages.sort_by_key(|page| page.number);

    let document_id = generate_document_id(path);
    let source_path = path.to_string_lossy().to_string();

    Ok(pages
        .into_iter()
        .filter_map(|page| {
            let text = normalize_whitespace(&page.text);
            if text.is_empty() {
                return None;
            }
            Some(Document {
                document_id: document_id.clone(),
                source_path: source_path.clone(),
                page: page.number,
                text,
            })
        })
        .collect())
}

fn generate_document_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extractor serving fixed page text keyed by file name.
#[cfg(test)]
pub(crate) mod fixture {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct StaticExtractor {
        pub files: HashMap<String, Vec<PageText>>,
    }

    impl StaticExtractor {
        pub fn with_file(mut self, name: &str, pages: &[&str]) -> Self {
            let pages = pages
                .iter()
                .enumerate()
                .map(|(index, text)| PageText {
                    number: index as u32 + 1,
                    text: text.to_string(),
                })
                .collect();
            self.files.insert(name.to_string(), pages);
            self
        }
    }

    impl PdfExtractor for StaticExtractor {
        fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>> {
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default();
            self.files
                .get(name)
                .cloned()
                .ok_or_else(|| RagError::Load(format!("unreadable pdf: {name}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixture::StaticExtractor;
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn missing_directory_is_a_load_error() {
        let result = load_documents(Path::new("/definitely/not/here"));
        assert!(matches!(result, Err(RagError::Load(_))));
    }

    #[test]
    fn empty_directory_loads_nothing() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("notes.txt"), b"not a pdf")?;
        let documents = load_documents(dir.path())?;
        assert!(documents.is_empty());
        Ok(())
    }

    #[test]
    fn discovery_is_sorted_and_not_recursive() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(dir.path().join("b.pdf"), b"%PDF-1.4")?;
        fs::write(dir.path().join("a.PDF"), b"%PDF-1.4")?;
        fs::write(nested.join("c.pdf"), b"%PDF-1.4")?;

        let names: Vec<_> = discover_pdf_files(dir.path())?
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()).map(str::to_string))
            .collect();
        assert_eq!(names, vec!["a.PDF", "b.pdf"]);
        Ok(())
    }

    #[test]
    fn pages_become_documents_in_order() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("guide.pdf"), b"%PDF-1.4")?;
        let extractor =
            StaticExtractor::default().with_file("guide.pdf", &["First  page", "   ", "Third\npage"]);

        let report = load_documents_with(dir.path(), &extractor, false)?;
        let pages: Vec<_> = report
            .documents
            .iter()
            .map(|document| (document.page, document.text.as_str()))
            .collect();
        assert_eq!(pages, vec![(1, "First page"), (3, "Third page")]);
        assert_eq!(report.documents[0].document_id, report.documents[1].document_id);
        Ok(())
    }

    #[test]
    fn unreadable_pdf_fails_unless_skipped() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("broken.pdf"), b"%PDF-1.4\n%broken")?;
        fs::write(dir.path().join("good.pdf"), b"%PDF-1.4")?;
        let extractor = StaticExtractor::default().with_file("good.pdf", &["Readable"]);

        assert!(load_documents_with(dir.path(), &extractor, false).is_err());

        let report = load_documents_with(dir.path(), &extractor, true)?;
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.skipped_files.len(), 1);
        assert_eq!(
            report.skipped_files[0].path.file_name().and_then(|name| name.to_str()),
            Some("broken.pdf")
        );
        Ok(())
    }

    #[test]
    fn lopdf_rejects_garbage() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("broken.pdf"), b"%PDF-1.4\n%broken")?;
        assert!(matches!(load_documents(dir.path()), Err(RagError::Load(_))));
        Ok(())
    }
}
