//! The `ocr` subcommand.

use anyhow::bail;
use clap::Args;

use crate::{
    gemini::{GeminiBatchClient, POLL_INTERVAL},
    instruction::{DocStyle, ocr_instruction},
    pipeline::{self, RunOpts, RunOutcome},
    prelude::*,
    ui::Ui,
};

/// Options for the `ocr` subcommand.
#[derive(Args, Clone, Debug)]
pub struct OcrOpts {
    /// A PDF file to process, or a directory of PDF files.
    pub input_path: Option<PathBuf>,

    /// Pages per recognition request.
    #[clap(long, default_value = "4")]
    pub batch_size: usize,

    /// First page to process (1-based).
    #[clap(long, default_value = "1")]
    pub start_page: u64,

    /// Last page to process (1-based). Defaults to the last page.
    #[clap(long)]
    pub end_page: Option<u64>,

    /// The document style context for the OCR instruction.
    #[clap(long, value_enum, default_value_t = DocStyle::default())]
    pub style: DocStyle,

    /// The recognition model to use.
    #[clap(long, default_value = "gemini-3-flash-preview")]
    pub model: String,

    /// Print the OCR instruction that would be sent, then exit.
    #[clap(long)]
    pub show_prompt: bool,
}

impl OcrOpts {
    fn run_opts(&self) -> RunOpts {
        RunOpts {
            model: self.model.clone(),
            batch_size: self.batch_size,
            start_page: self.start_page,
            end_page: self.end_page,
            style: self.style,
            poll_interval: POLL_INTERVAL,
        }
    }
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: &Ui, opts: &OcrOpts) -> Result<()> {
    if opts.batch_size == 0 {
        bail!("--batch-size must be at least 1");
    }

    if opts.show_prompt {
        println!("{}", ocr_instruction(opts.batch_size, opts.style));
        return Ok(());
    }

    let Some(input_path) = &opts.input_path else {
        bail!("an input path is required (unless --show-prompt is used)");
    };

    let client = GeminiBatchClient::new()?;
    let run_opts = opts.run_opts();

    if input_path.is_dir() {
        // Process every PDF in the directory in name order, continuing past
        // per-document failures so one corrupt file doesn't sink the rest.
        let pdf_files = pdf_files_in(input_path).await?;
        if pdf_files.is_empty() {
            warn!("no PDF files found in {:?}", input_path.display());
            return Ok(());
        }
        info!(
            count = pdf_files.len(),
            "processing PDF files from {:?}",
            input_path.display()
        );
        let mut failures = 0;
        for pdf_file in &pdf_files {
            ui.display_message("📄", &format!("Processing {}", pdf_file.display()));
            if let Err(err) =
                pipeline::process_document(ui, &client, pdf_file, &run_opts).await
            {
                failures += 1;
                error!("failed to process {:?}: {:?}", pdf_file.display(), err);
            }
        }
        if failures > 0 {
            bail!("{failures}/{} documents failed to process", pdf_files.len());
        }
        Ok(())
    } else {
        let outcome =
            pipeline::process_document(ui, &client, input_path, &run_opts).await?;
        if let RunOutcome::Partial { failed_pages, .. } = &outcome {
            debug!(?failed_pages, "run finished with unresolved pages");
        }
        Ok(())
    }
}

/// The `*.pdf` files in a directory, in name order.
async fn pdf_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read directory {:?}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("pdf")) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
