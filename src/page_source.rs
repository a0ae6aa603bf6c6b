//! Extracting pages from a source PDF.
//!
//! We split the document once with Poppler's `pdfseparate` into single-page
//! PDFs, then serve individual pages as byte blobs on demand. Recognition
//! requests carry each page as its own inline part, so single-page files are
//! exactly the granularity we need.

use std::{collections::BTreeMap, sync::LazyLock};

use anyhow::anyhow;
use regex::Regex;
use tokio::process::Command;

use crate::prelude::*;

/// A default error regex for checking command output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler reconstructs documents with damaged xref tables and reports it as
/// an "error" on stderr, but still produces correct output.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// One page of the source document, ready to pack into a batch request.
#[derive(Clone, Debug)]
pub struct PageUnit {
    /// The 1-based physical page number in the source document.
    pub physical_page: u64,

    /// The page content: a single-page PDF.
    pub content: Vec<u8>,
}

/// A source PDF, split into per-page files.
pub struct PdfPageSource {
    /// The source path, for error messages.
    path: PathBuf,

    /// Holds the split single-page PDFs. Released by [`Drop`].
    tmpdir: tempfile::TempDir,

    /// Number of pages in the document.
    page_count: u64,
}

impl PdfPageSource {
    /// Open a source PDF, counting and splitting its pages.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self> {
        let mime_type = get_mime_type(path)?;
        if mime_type != "application/pdf" {
            return Err(anyhow!(
                "unsupported MIME type {} for {:?} (only PDF input is supported)",
                mime_type,
                path.display()
            ));
        }

        let page_count = get_pdf_page_count(path).await?;

        // Split the document into single-page PDFs. `pdfseparate` writes
        // `page-1.pdf` .. `page-N.pdf` with 1-based numbering, which matches
        // our physical page numbering exactly.
        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        let out_path = tmpdir.path().join("page-%d.pdf");
        let output = Command::new("pdfseparate")
            .arg(path)
            .arg(out_path)
            .output()
            .await
            .with_context(|| {
                format!("failed to run pdfseparate on {:?}", path.display())
            })?;
        check_for_command_failure("pdfseparate", &output, Some(&is_error_line))?;

        Ok(Self {
            path: path.to_owned(),
            tmpdir,
            page_count,
        })
    }

    /// Number of pages in the document.
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Read one physical page as a byte blob.
    pub async fn page(&self, physical_page: u64) -> Result<PageUnit> {
        if physical_page < 1 || physical_page > self.page_count {
            return Err(anyhow!(
                "page {} out of range 1..={} for {:?}",
                physical_page,
                self.page_count,
                self.path.display()
            ));
        }
        let page_path = self.tmpdir.path().join(format!("page-{physical_page}.pdf"));
        let content = tokio::fs::read(&page_path).await.with_context(|| {
            format!("failed to read page file {:?}", page_path.display())
        })?;
        Ok(PageUnit {
            physical_page,
            content,
        })
    }

    /// Read a set of physical pages, in the order given.
    pub async fn pages(&self, physical_pages: &[u64]) -> Result<Vec<PageUnit>> {
        let mut units = Vec::with_capacity(physical_pages.len());
        for &page in physical_pages {
            units.push(self.page(page).await?);
        }
        Ok(units)
    }
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<u64> {
    // Run pdfinfo to get the number of pages.
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    // Parse the output of pdfinfo into properties.
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key.to_string(), value.to_string());
    }

    // Get the number of pages from the properties.
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str.parse::<u64>().with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}

/// Get the MIME type of a file.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}

/// Report any command failures, and include any error output.
///
/// Standard error may be optionally checked against a line filter to catch
/// tools that report errors without a failing exit code.
fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    error_line_filter: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        output = %stderr,
        "standard error from command",
    );

    if output.status.success() {
        if let Some(filter) = error_line_filter
            && stderr.lines().any(filter)
        {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            ));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}
