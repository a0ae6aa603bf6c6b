//! Assembling per-page results into the final artifact.
//!
//! A run ends in exactly one of two files next to the source document:
//! `X_paged.md` when every requested page resolved, or `X_ERROR_paged.md`
//! when some didn't. The error artifact doubles as the resume point for the
//! next run: its intact pages are parsed back in, and only the pages still
//! carrying a failure sentinel are re-sent.

use anyhow::anyhow;

use crate::{
    markers,
    pipeline::validate::PageResult,
    prelude::*,
};

/// The two mutually exclusive artifact paths for one source document.
#[derive(Clone, Debug)]
pub struct ArtifactPaths {
    /// Written when every requested page resolved.
    pub success: PathBuf,

    /// Written when one or more pages remain unresolved.
    pub error: PathBuf,
}

impl ArtifactPaths {
    /// Compute the artifact paths for a source document.
    pub fn for_source(source: &Path) -> Result<Self> {
        let stem = source
            .file_stem()
            .ok_or_else(|| anyhow!("no file name in {:?}", source.display()))?
            .to_string_lossy();
        let dir = source.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self {
            success: dir.join(format!("{stem}_paged.md")),
            error: dir.join(format!("{stem}_ERROR_paged.md")),
        })
    }
}

/// Parse a prior partial-failure artifact, recovering its resolved pages.
///
/// Pages whose body still carries the failure sentinel stay unresolved.
/// Returns an empty result when there's no error artifact to resume from.
#[instrument(level = "debug", skip_all, fields(artifact = %paths.error.display()))]
pub async fn resume_scan(paths: &ArtifactPaths) -> Result<PageResult> {
    let content = match tokio::fs::read_to_string(&paths.error).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(PageResult::new());
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read prior artifact {:?}", paths.error.display())
            });
        }
    };

    let mut resolved = PageResult::new();
    let mut unresolved = 0;
    for segment in markers::split_pages(&content) {
        if markers::contains_error_sentinel(&segment.body) {
            unresolved += 1;
        } else {
            resolved.insert(segment.page_number, segment);
        }
    }
    info!(
        resolved_pages = resolved.len(),
        unresolved_pages = unresolved,
        "resuming from prior partial artifact"
    );
    Ok(resolved)
}

/// Merge resolved pages into final document content, in ascending physical
/// page order.
///
/// Unresolved pages are rendered as a begin marker followed by an inline
/// failure sentinel, so the output always accounts for every requested
/// page. Returns the content and the pages that stayed unresolved.
pub fn merge_pages(
    requested_pages: &[u64],
    resolved: &PageResult,
) -> (String, Vec<u64>) {
    let mut sections = Vec::with_capacity(requested_pages.len());
    let mut failed_pages = Vec::new();
    for &page in requested_pages {
        match resolved.get(&page) {
            Some(segment) => sections.push(segment.render()),
            None => {
                failed_pages.push(page);
                sections.push(format!(
                    "{}\n{}",
                    markers::begin_marker(page, false),
                    markers::error_sentinel(page),
                ));
            }
        }
    }
    let mut content = sections.join("\n\n");
    content.push('\n');
    (content, failed_pages)
}

/// Persist merged content to the right artifact path, removing the other.
///
/// Exactly one of the two artifacts exists after this returns, so the
/// presence of the error path is itself a durable "rerun needed" signal.
/// Returns the path written.
pub async fn persist(
    paths: &ArtifactPaths,
    content: &str,
    has_failures: bool,
) -> Result<PathBuf> {
    let (write_path, remove_path) = if has_failures {
        (&paths.error, &paths.success)
    } else {
        (&paths.success, &paths.error)
    };
    tokio::fs::write(write_path, content)
        .await
        .with_context(|| format!("failed to write artifact {:?}", write_path.display()))?;
    match tokio::fs::remove_file(remove_path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to remove stale artifact {:?}", remove_path.display())
            });
        }
    }
    Ok(write_path.clone())
}
