//! Grouping pending pages into batch units.
//!
//! Pages are grouped into fixed-size runs of consecutive pages. Each run
//! becomes one immutable batch unit: a prebuilt recognition request plus the
//! metadata needed to map the service's relative page numbering back to
//! absolute physical pages.

use anyhow::bail;
use base64::{Engine as _, prelude::BASE64_STANDARD};

use crate::{
    gemini::{Content, GenerateRequest, GenerationConfig, MAX_BATCH_SIZE, Part},
    instruction::{DocStyle, ocr_instruction},
    page_source::PageUnit,
    prelude::*,
};

/// Maps a unit's relative page positions (1-based) back to absolute
/// physical page numbers.
#[derive(Clone, Debug)]
pub struct BatchMetadata {
    /// The physical page numbers in this unit, in request order.
    pub pages: Vec<u64>,
}

impl BatchMetadata {
    /// How many pages does this unit cover?
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }
}

/// One size-bounded unit of recognition work. Never mutated after creation;
/// retry rounds resubmit the same request verbatim.
#[derive(Debug)]
pub struct BatchUnit {
    /// The prebuilt recognition request.
    pub request: GenerateRequest,

    /// The relative-to-absolute page mapping for this unit.
    pub metadata: BatchMetadata,

    /// Estimated serialized size: base64-encoded page bytes plus the
    /// instruction text.
    pub serialized_size: usize,
}

/// Group pages into batch units of at most `batch_size` consecutive pages.
///
/// Grouping is by page count, not by size; the serialized-size estimate is
/// carried on each unit and enforced when units are packed into jobs. The
/// one size check made here is the unrecoverable case: a single page whose
/// encoded size alone exceeds the payload ceiling can never be submitted,
/// no matter how it's grouped.
pub fn chunk_pages(
    pages: Vec<PageUnit>,
    batch_size: usize,
    style: DocStyle,
) -> Result<Vec<BatchUnit>> {
    if batch_size == 0 {
        bail!("batch size must be at least 1");
    }

    let mut units = Vec::new();
    for run in pages.chunks(batch_size) {
        let instruction = ocr_instruction(run.len(), style);
        let mut parts = Vec::with_capacity(run.len() + 1);
        let mut serialized_size = instruction.len();
        for page in run {
            let encoded = BASE64_STANDARD.encode(&page.content);
            if encoded.len() > MAX_BATCH_SIZE {
                bail!(
                    "page {} encodes to {} bytes, over the {}-byte request ceiling; \
                     it cannot be submitted at any batch size",
                    page.physical_page,
                    encoded.len(),
                    MAX_BATCH_SIZE,
                );
            }
            serialized_size += encoded.len();
            parts.push(Part::inline_data("application/pdf", encoded));
        }
        parts.push(Part::text(instruction));

        units.push(BatchUnit {
            request: GenerateRequest {
                contents: vec![Content {
                    role: "user".to_string(),
                    parts,
                }],
                config: GenerationConfig::default(),
            },
            metadata: BatchMetadata {
                pages: run.iter().map(|page| page.physical_page).collect(),
            },
            serialized_size,
        });
    }
    debug!(
        unit_count = units.len(),
        batch_size, "chunked pages into batch units"
    );
    Ok(units)
}
