//! The `merge` subcommand: turn a paged artifact into a flowing document.
//!
//! The pipeline leaves page markers in its output so that page boundaries
//! stay auditable. This separate pass consumes them: boundaries flagged
//! `(Continuation)` on either side are joined mid-paragraph, plain
//! boundaries become paragraph breaks, and stray markers at the edges of
//! the document are dropped.

use std::sync::LazyLock;

use anyhow::{anyhow, bail};
use clap::Args;
use regex::{Captures, Regex};

use crate::{
    markers::{BEGIN_PATTERN, END_PATTERN},
    prelude::*,
    ui::Ui,
};

/// A page boundary: an end marker followed by a begin marker, with any
/// whitespace around and between them.
static BOUNDARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\s*({END_PATTERN})\s*({BEGIN_PATTERN})\s*"))
        .expect("failed to compile regex")
});

/// A stray begin marker, e.g. at the start of the document.
static STRAY_BEGIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{BEGIN_PATTERN}\s*")).expect("failed to compile regex")
});

/// A stray end marker, e.g. at the end of the document.
static STRAY_END_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\s*{END_PATTERN}")).expect("failed to compile regex")
});

/// Three or more newlines in a row.
static EXCESS_NEWLINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("failed to compile regex"));

/// Options for the `merge` subcommand.
#[derive(Args, Clone, Debug)]
pub struct MergeOpts {
    /// A paged Markdown file, or a directory of them.
    pub input_path: PathBuf,
}

/// Remove page-break markers from marked-up document content.
///
/// Boundaries where either marker carries `(Continuation)` are joined with
/// no separator at all: the paragraph ran across the page break, and the
/// line break belongs to the page, not the text.
pub fn merge_page_breaks(content: &str) -> String {
    // The marker patterns contribute inner capture groups of their own; the
    // outer groups around each whole marker are group 1 (end) and group 4
    // (begin).
    let content = BOUNDARY_RE.replace_all(content, |caps: &Captures<'_>| {
        let end_marker = &caps[1];
        let begin_marker = &caps[4];
        if end_marker.contains("(Continuation)") || begin_marker.contains("(Continuation)")
        {
            "".to_string()
        } else {
            "\n\n".to_string()
        }
    });
    let content = STRAY_BEGIN_RE.replace_all(&content, "");
    let content = STRAY_END_RE.replace_all(&content, "");
    EXCESS_NEWLINES_RE.replace_all(&content, "\n\n").into_owned()
}

/// Where the merged output for a paged artifact goes: `X_paged.md` becomes
/// `X.md`, anything else gets a `_merged` suffix.
fn merged_output_path(input: &Path) -> Result<PathBuf> {
    let name = input
        .file_name()
        .ok_or_else(|| anyhow!("no file name in {:?}", input.display()))?
        .to_string_lossy();
    let merged_name = match name.strip_suffix("_paged.md") {
        Some(stem) => format!("{stem}.md"),
        None => {
            let stem = name.strip_suffix(".md").unwrap_or(&name);
            format!("{stem}_merged.md")
        }
    };
    Ok(input.with_file_name(merged_name))
}

/// The `merge` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_merge(ui: &Ui, opts: &MergeOpts) -> Result<()> {
    let input_path = &opts.input_path;
    if input_path.is_dir() {
        let mut merged_any = false;
        for path in paged_files_in(input_path).await? {
            merge_file(ui, &path).await?;
            merged_any = true;
        }
        if !merged_any {
            warn!("no paged Markdown files found in {:?}", input_path.display());
        }
        Ok(())
    } else {
        merge_file(ui, input_path).await
    }
}

/// Merge one file and write the result next to it.
async fn merge_file(ui: &Ui, path: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {:?}", path.display()))?;
    if content.contains("[ERROR: OCR Failed for page") {
        bail!(
            "{:?} still contains failed pages; rerun the ocr command before merging",
            path.display()
        );
    }
    let merged = merge_page_breaks(&content);
    let output_path = merged_output_path(path)?;
    tokio::fs::write(&output_path, merged)
        .await
        .with_context(|| format!("failed to write {:?}", output_path.display()))?;
    ui.display_message("📝", &format!("Wrote {}", output_path.display()));
    Ok(())
}

/// The `*_paged.md` files in a directory, in name order. Error artifacts
/// are skipped: their failed pages need a rerun, not a merge.
async fn paged_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read directory {:?}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned())
        else {
            continue;
        };
        if name.ends_with("_paged.md") && !name.ends_with("_ERROR_paged.md") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
