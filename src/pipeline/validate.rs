//! Structural validation of per-unit OCR output.
//!
//! We never check recognition accuracy, only that the service emitted the
//! right number of page boundaries. A unit is accepted or rejected whole:
//! even if most of its pages look fine, a marker-count mismatch means we
//! can't trust the page segmentation, so nothing from the unit is kept.

use std::{collections::BTreeMap, fmt};

use crate::{
    gemini::InlinedResponse,
    markers::{self, PageSegment},
    pipeline::chunker::BatchMetadata,
    prelude::*,
};

/// The result of one validated run: absolute physical page number to its
/// marked-up text segment.
pub type PageResult = BTreeMap<u64, PageSegment>;

/// Why a unit was rejected. Rejected units go back into the pending set.
#[derive(Debug)]
pub enum UnitFailure {
    /// The service reported a per-request error instead of a response.
    ServiceError(String),

    /// The response carried no text at all.
    EmptyResponse,

    /// The marker counts didn't match the unit's page count.
    MarkerMismatch {
        expected: usize,
        begin: usize,
        end: usize,
    },

    /// Markers were countable but numbered inconsistently, so pages can't
    /// be mapped back to physical page numbers.
    BadNumbering(String),

    /// The job's response list was shorter than the submitted request list.
    MissingOutcome,
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitFailure::ServiceError(message) => {
                write!(f, "service error: {message}")
            }
            UnitFailure::EmptyResponse => write!(f, "empty response"),
            UnitFailure::MarkerMismatch {
                expected,
                begin,
                end,
            } => write!(
                f,
                "marker count mismatch: expected {expected} pages, found {begin} begin and {end} end markers"
            ),
            UnitFailure::BadNumbering(message) => {
                write!(f, "bad page numbering: {message}")
            }
            UnitFailure::MissingOutcome => {
                write!(f, "no outcome returned for this request")
            }
        }
    }
}

/// Check that a unit's text contains exactly one begin and one end marker
/// per expected page.
pub fn validate_markers(text: &str, expected: usize) -> Result<(), UnitFailure> {
    let begin = markers::count_begin_markers(text);
    let end = markers::count_end_markers(text);
    if begin == expected && end == expected {
        Ok(())
    } else {
        Err(UnitFailure::MarkerMismatch {
            expected,
            begin,
            end,
        })
    }
}

/// Validate one unit's outcome and, on acceptance, produce its pages keyed
/// by absolute physical page number.
///
/// Acceptance rewrites the relative page indices the service emitted
/// (1..=N within the unit) to absolute physical page numbers using the
/// unit's metadata, then splits the text at its begin markers.
pub fn accept_unit(
    outcome: &InlinedResponse,
    metadata: &BatchMetadata,
) -> Result<PageResult, UnitFailure> {
    if let Some(error) = &outcome.error {
        return Err(UnitFailure::ServiceError(error.to_string()));
    }
    let text = outcome
        .response
        .as_ref()
        .and_then(|response| response.text())
        .ok_or(UnitFailure::EmptyResponse)?;

    let expected = metadata.num_pages();
    validate_markers(&text, expected)?;

    let renumbered = markers::renumber_begin_markers(&text, &metadata.pages)
        .map_err(|err| UnitFailure::BadNumbering(format!("{err:#}")))?;

    let segments = markers::split_pages(&renumbered);
    let mut pages = PageResult::new();
    for segment in segments {
        pages.insert(segment.page_number, segment);
    }
    // Duplicate relative indices collapse to the same absolute page, which
    // would silently lose a page. Reject instead.
    if pages.len() != expected {
        return Err(UnitFailure::BadNumbering(format!(
            "{} distinct pages after renumbering, expected {}",
            pages.len(),
            expected
        )));
    }
    Ok(pages)
}
