//! The batch OCR pipeline.
//!
//! One run per source document, strictly sequential:
//!
//! ```text
//! resume scan → chunk → [submit → poll → validate]* → merge → persist
//! ```
//!
//! A run always terminates in one of two persisted states: a complete
//! artifact, or a partial artifact with explicit per-page failure sentinels.
//! There is no silent-gap outcome.

pub mod assembler;
pub mod chunker;
pub mod coordinator;
#[cfg(test)]
pub mod testing;
pub mod validate;

use std::time::Duration;

use anyhow::bail;

use crate::{
    gemini::{BatchClient, POLL_INTERVAL},
    instruction::DocStyle,
    page_source::{PageUnit, PdfPageSource},
    pipeline::{
        assembler::ArtifactPaths,
        validate::PageResult,
    },
    prelude::*,
    progress::RunProgress,
    ui::{ProgressConfig, Ui},
};

/// Settings for one pipeline run.
#[derive(Clone, Debug)]
pub struct RunOpts {
    /// The recognition model to use.
    pub model: String,

    /// Pages per unit.
    pub batch_size: usize,

    /// First page to process (1-based, inclusive).
    pub start_page: u64,

    /// Last page to process (1-based, inclusive). Defaults to the last
    /// page of the document.
    pub end_page: Option<u64>,

    /// The document style context for the OCR instruction.
    pub style: DocStyle,

    /// How often to poll running jobs.
    pub poll_interval: Duration,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            model: "gemini-3-flash-preview".to_string(),
            batch_size: 4,
            start_page: 1,
            end_page: None,
            style: DocStyle::default(),
            poll_interval: POLL_INTERVAL,
        }
    }
}

/// How a run ended. Both variants have persisted an artifact.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every requested page resolved; the success artifact was written.
    Complete {
        /// The artifact path.
        artifact: PathBuf,
    },

    /// Some pages never resolved; the error artifact was written with
    /// inline sentinels for them.
    Partial {
        /// The artifact path.
        artifact: PathBuf,

        /// The pages carrying failure sentinels.
        failed_pages: Vec<u64>,
    },
}

/// Run the full pipeline over one source document.
#[instrument(level = "debug", skip_all, fields(source = %source_path.display()))]
pub async fn process_document(
    ui: &Ui,
    client: &dyn BatchClient,
    source_path: &Path,
    opts: &RunOpts,
) -> Result<RunOutcome> {
    let paths = ArtifactPaths::for_source(source_path)?;
    let source = PdfPageSource::open(source_path).await?;
    let target_pages =
        select_target_pages(source.page_count(), opts.start_page, opts.end_page)?;

    // Recover whatever a prior partial run already resolved, and only send
    // the rest through the service.
    let mut resolved = assembler::resume_scan(&paths).await?;
    let work = target_pages
        .iter()
        .copied()
        .filter(|page| !resolved.contains_key(page))
        .collect::<Vec<_>>();
    info!(
        total_pages = target_pages.len(),
        resumed_pages = target_pages.len() - work.len(),
        pages_to_process = work.len(),
        "selected work"
    );

    let pages = source.pages(&work).await?;
    run_pipeline(ui, client, pages, &target_pages, &mut resolved, &paths, opts).await
}

/// The requested page numbers, ascending: the start/end range clamped to
/// the document.
fn select_target_pages(
    page_count: u64,
    start_page: u64,
    end_page: Option<u64>,
) -> Result<Vec<u64>> {
    let start = start_page.max(1);
    let end = end_page.unwrap_or(page_count).min(page_count);
    if start > end {
        bail!(
            "invalid page range: {} to {} (document has {} pages)",
            start_page,
            end_page.map(|p| p.to_string()).unwrap_or_else(|| "end".to_string()),
            page_count
        );
    }
    Ok((start..=end).collect())
}

/// Chunk, run retry rounds, merge, and persist.
///
/// Split from [`process_document`] so tests can drive it with synthetic
/// pages instead of a real PDF.
async fn run_pipeline(
    ui: &Ui,
    client: &dyn BatchClient,
    pages: Vec<PageUnit>,
    target_pages: &[u64],
    resolved: &mut PageResult,
    paths: &ArtifactPaths,
    opts: &RunOpts,
) -> Result<RunOutcome> {
    let mut retry_count = 0;
    if pages.is_empty() {
        info!("nothing left to process");
    } else {
        let units = chunker::chunk_pages(pages, opts.batch_size, opts.style)?;
        let mut progress = RunProgress::new(units.len());
        let progress_bar = ui.new_progress_bar(
            &ProgressConfig {
                emoji: "📄",
                msg: "OCRing batches",
                done_msg: "OCRed batches",
            },
            units.len() as u64,
        );
        let outcome = coordinator::run_rounds(
            client,
            &opts.model,
            units,
            opts.poll_interval,
            &mut progress,
            &progress_bar,
            resolved,
        )
        .await?;
        retry_count = outcome.retry_count;
    }

    let (content, failed_pages) = assembler::merge_pages(target_pages, resolved);
    let has_failures = !failed_pages.is_empty();
    let artifact = assembler::persist(paths, &content, has_failures).await?;
    if has_failures {
        ui.display_message(
            "⚠️",
            &format!(
                "{} of {} pages failed after {} retries; wrote {}",
                failed_pages.len(),
                target_pages.len(),
                retry_count,
                artifact.display()
            ),
        );
        Ok(RunOutcome::Partial {
            artifact,
            failed_pages,
        })
    } else {
        ui.display_message("✅", &format!("Wrote {}", artifact.display()));
        Ok(RunOutcome::Complete { artifact })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{RequestBehavior, ScriptEntry, ScriptedClient};

    fn synthetic_pages(pages: &[u64]) -> Vec<PageUnit> {
        pages
            .iter()
            .map(|&physical_page| PageUnit {
                physical_page,
                content: vec![b'p'; 64],
            })
            .collect()
    }

    fn test_opts() -> RunOpts {
        RunOpts {
            batch_size: 5,
            poll_interval: Duration::ZERO,
            ..RunOpts::default()
        }
    }

    async fn run_with(
        client: &ScriptedClient,
        dir: &Path,
        pages: &[u64],
        target: &[u64],
    ) -> Result<RunOutcome> {
        let ui = Ui::init_for_tests();
        let paths = ArtifactPaths::for_source(&dir.join("doc.pdf"))?;
        let mut resolved = assembler::resume_scan(&paths).await?;
        let work = pages
            .iter()
            .copied()
            .filter(|page| !resolved.contains_key(page))
            .collect::<Vec<_>>();
        run_pipeline(
            &ui,
            client,
            synthetic_pages(&work),
            target,
            &mut resolved,
            &paths,
            &test_opts(),
        )
        .await
    }

    #[test]
    fn target_pages_clamp_to_the_document() {
        assert_eq!(select_target_pages(10, 1, None).unwrap().len(), 10);
        assert_eq!(select_target_pages(10, 8, Some(20)).unwrap(), vec![8, 9, 10]);
        assert_eq!(select_target_pages(10, 0, Some(2)).unwrap(), vec![1, 2]);
        assert!(select_target_pages(10, 11, None).is_err());
        assert!(select_target_pages(10, 5, Some(4)).is_err());
    }

    #[tokio::test]
    async fn clean_run_writes_the_success_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(vec![ScriptEntry::Responds(vec![
            RequestBehavior::GoodText { pages: 5 },
            RequestBehavior::GoodText { pages: 5 },
        ])]);
        let target = (1..=10).collect::<Vec<u64>>();
        let outcome = run_with(&client, dir.path(), &target, &target).await.unwrap();

        let RunOutcome::Complete { artifact } = outcome else {
            panic!("expected a complete run");
        };
        assert_eq!(artifact, dir.path().join("doc_paged.md"));
        let content = std::fs::read_to_string(&artifact).unwrap();
        assert!(content.contains("### -- Begin Page 1 --"));
        assert!(content.contains("### -- Begin Page 10 --"));
        assert!(!content.contains("[ERROR: OCR Failed"));
        assert!(!dir.path().join("doc_ERROR_paged.md").exists());
    }

    #[tokio::test]
    async fn exhausted_retries_write_the_error_artifact() {
        let dir = tempfile::tempdir().unwrap();
        // Unit 2 (pages 6-10) fails all rounds.
        let client = ScriptedClient::new(vec![
            ScriptEntry::Responds(vec![
                RequestBehavior::GoodText { pages: 5 },
                RequestBehavior::TruncatedText { pages: 5 },
            ]),
            ScriptEntry::Responds(vec![RequestBehavior::TruncatedText { pages: 5 }]),
            ScriptEntry::Responds(vec![RequestBehavior::TruncatedText { pages: 5 }]),
        ]);
        let target = (1..=10).collect::<Vec<u64>>();
        let outcome = run_with(&client, dir.path(), &target, &target).await.unwrap();

        let RunOutcome::Partial {
            artifact,
            failed_pages,
        } = outcome
        else {
            panic!("expected a partial run");
        };
        assert_eq!(artifact, dir.path().join("doc_ERROR_paged.md"));
        assert_eq!(failed_pages, vec![6, 7, 8, 9, 10]);
        let content = std::fs::read_to_string(&artifact).unwrap();
        assert!(content.contains("### -- Begin Page 5 --"));
        assert!(
            content.contains("### -- Begin Page 6 --\n[ERROR: OCR Failed for page 6]")
        );
        assert!(
            content.contains("### -- Begin Page 10 --\n[ERROR: OCR Failed for page 10]")
        );
        assert!(!dir.path().join("doc_paged.md").exists());
    }

    #[tokio::test]
    async fn rerun_resumes_and_resends_only_failed_pages() {
        let dir = tempfile::tempdir().unwrap();
        let target = (1..=10).collect::<Vec<u64>>();

        // First run: pages 6-10 fail every round.
        let client = ScriptedClient::new(vec![
            ScriptEntry::Responds(vec![
                RequestBehavior::GoodText { pages: 5 },
                RequestBehavior::TruncatedText { pages: 5 },
            ]),
            ScriptEntry::Responds(vec![RequestBehavior::TruncatedText { pages: 5 }]),
            ScriptEntry::Responds(vec![RequestBehavior::TruncatedText { pages: 5 }]),
        ]);
        run_with(&client, dir.path(), &target, &target).await.unwrap();

        // Second run: the service behaves, and only one unit (the five
        // previously-failed pages) is submitted.
        let client =
            ScriptedClient::new(vec![ScriptEntry::Responds(vec![
                RequestBehavior::GoodText { pages: 5 },
            ])]);
        let outcome = run_with(&client, dir.path(), &target, &target).await.unwrap();
        assert_eq!(client.submission_sizes(), vec![1]);

        let RunOutcome::Complete { artifact } = outcome else {
            panic!("expected the rerun to complete");
        };
        let content = std::fs::read_to_string(&artifact).unwrap();
        // Pages 1-5 came from the resume scan, 6-10 from the rerun.
        for page in 1..=10 {
            assert!(content.contains(&format!("### -- Begin Page {page} --")));
        }
        assert!(!content.contains("[ERROR: OCR Failed"));
        assert!(!dir.path().join("doc_ERROR_paged.md").exists());
    }

    #[tokio::test]
    async fn run_with_nothing_left_to_do_still_persists() {
        let dir = tempfile::tempdir().unwrap();
        let target = vec![1, 2];

        // Seed an error artifact where both pages are intact but a third,
        // out-of-range page failed.
        let seeded = "### -- Begin Page 1 --\na\n### -- End --\n\n\
                      ### -- Begin Page 2 --\nb\n### -- End --\n\n\
                      ### -- Begin Page 3 --\n[ERROR: OCR Failed for page 3]\n";
        std::fs::write(dir.path().join("doc_ERROR_paged.md"), seeded).unwrap();

        // The scripted service would panic if any submission happened.
        let client = ScriptedClient::new(vec![]);
        let outcome = run_with(&client, dir.path(), &target, &target).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Complete { .. }));
        assert!(client.submission_sizes().is_empty());
    }
}
