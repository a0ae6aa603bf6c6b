//! Page marker grammar.
//!
//! The OCR service is instructed to bracket every page of its output with
//! structural markers:
//!
//! ```text
//! ### -- Begin Page <n> [(Continuation)] --
//! ...page body...
//! ### -- End [(Printed Page <n>)] [(Continuation)] --
//! ```
//!
//! The same grammar is consumed in three places: validating fresh OCR
//! results, re-parsing a previously written partial artifact on resume, and
//! merging page breaks out of a finished document. All three go through the
//! lexer in this module rather than keeping their own regexes.

use std::sync::LazyLock;

use anyhow::anyhow;
use regex::Regex;

use crate::prelude::*;

/// Pattern for a page-begin marker, with a capture for the page number and
/// one for the continuation flag.
pub const BEGIN_PATTERN: &str = r"### -- Begin Page (\d+)( \(Continuation\))? --";

/// Pattern for a page-end marker. The printed page number is whatever the
/// service could read off the physical page, so it may be absent entirely.
pub const END_PATTERN: &str =
    r"### -- End( \(Printed Page \d+\))?( \(Continuation\))? --";

static BEGIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(BEGIN_PATTERN).expect("failed to compile regex"));

static END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(END_PATTERN).expect("failed to compile regex"));

/// Render a page-begin marker.
pub fn begin_marker(page_number: u64, is_continuation: bool) -> String {
    if is_continuation {
        format!("### -- Begin Page {page_number} (Continuation) --")
    } else {
        format!("### -- Begin Page {page_number} --")
    }
}

/// Render the inline sentinel marking a page we could not OCR.
pub fn error_sentinel(page_number: u64) -> String {
    format!("[ERROR: OCR Failed for page {page_number}]")
}

/// Does this page body contain an unresolved OCR failure sentinel?
pub fn contains_error_sentinel(body: &str) -> bool {
    body.contains("[ERROR: OCR Failed for page")
}

/// Count well-formed page-begin markers. Malformed markers don't count, which
/// is what we want: they'll show up as a count mismatch and fail validation.
pub fn count_begin_markers(text: &str) -> usize {
    BEGIN_RE.find_iter(text).count()
}

/// Count well-formed page-end markers.
pub fn count_end_markers(text: &str) -> usize {
    END_RE.find_iter(text).count()
}

/// Rewrite each begin marker's relative page index (1-based within a batch)
/// to the absolute physical page number it maps to.
///
/// Fails if any marker carries an index outside `1..=pages.len()`, which
/// means the service numbered its output inconsistently with what we asked
/// for. Callers treat that the same as a marker-count mismatch.
pub fn renumber_begin_markers(text: &str, pages: &[u64]) -> Result<String> {
    let mut output = String::with_capacity(text.len());
    let mut last_end = 0;
    for caps in BEGIN_RE.captures_iter(text) {
        let whole = caps.get(0).expect("capture 0 always exists");
        let relative = caps[1]
            .parse::<usize>()
            .with_context(|| format!("bad page index in marker {:?}", &caps[0]))?;
        if relative < 1 || relative > pages.len() {
            return Err(anyhow!(
                "marker page index {} out of range 1..={}",
                relative,
                pages.len()
            ));
        }
        let is_continuation = caps.get(2).is_some();
        output.push_str(&text[last_end..whole.start()]);
        output.push_str(&begin_marker(pages[relative - 1], is_continuation));
        last_end = whole.end();
    }
    output.push_str(&text[last_end..]);
    Ok(output)
}

/// One page's worth of marked-up text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageSegment {
    /// The page number from the begin marker.
    pub page_number: u64,

    /// Did the begin marker carry a `(Continuation)` flag?
    pub is_continuation: bool,

    /// Everything between this begin marker and the next one, including the
    /// end marker, with surrounding blank lines trimmed.
    pub body: String,
}

impl PageSegment {
    /// Render this segment back to marked-up text.
    pub fn render(&self) -> String {
        format!(
            "{}\n{}",
            begin_marker(self.page_number, self.is_continuation),
            self.body
        )
    }
}

/// Split marked-up text into per-page segments at its begin markers.
///
/// Text before the first begin marker is ignored; with well-formed input
/// there is none. Page numbers are taken at face value, so this works for
/// both relative (fresh OCR output) and absolute (persisted artifact)
/// numbering.
pub fn split_pages(text: &str) -> Vec<PageSegment> {
    let matches = BEGIN_RE.captures_iter(text).collect::<Vec<_>>();
    let mut segments = Vec::with_capacity(matches.len());
    for (idx, caps) in matches.iter().enumerate() {
        let whole = caps.get(0).expect("capture 0 always exists");
        let body_end = matches
            .get(idx + 1)
            .map(|next| next.get(0).expect("capture 0 always exists").start())
            .unwrap_or(text.len());
        // A page number too large for u64 isn't one of ours; skip the
        // segment and let the page count as unresolved.
        let Ok(page_number) = caps[1].parse::<u64>() else {
            warn!("ignoring marker with unusable page number: {:?}", &caps[0]);
            continue;
        };
        segments.push(PageSegment {
            page_number,
            is_continuation: caps.get(2).is_some(),
            body: text[whole.end()..body_end].trim().to_string(),
        });
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_round_trip_through_the_lexer() {
        let text = format!(
            "{}\nFirst page body.\n### -- End (Printed Page 12) --\n\n{}\nSecond page body.\n### -- End (Continuation) --\n",
            begin_marker(5, false),
            begin_marker(6, true),
        );
        assert_eq!(count_begin_markers(&text), 2);
        assert_eq!(count_end_markers(&text), 2);

        let segments = split_pages(&text);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].page_number, 5);
        assert!(!segments[0].is_continuation);
        assert!(segments[0].body.starts_with("First page body."));
        assert!(segments[0].body.ends_with("### -- End (Printed Page 12) --"));
        assert_eq!(segments[1].page_number, 6);
        assert!(segments[1].is_continuation);
    }

    #[test]
    fn end_marker_forms_all_count() {
        let text = "### -- End --\n### -- End (Printed Page 3) --\n### -- End (Printed Page 3) (Continuation) --\n### -- End (Continuation) --\n";
        assert_eq!(count_end_markers(text), 4);
        assert_eq!(count_begin_markers(text), 0);
    }

    #[test]
    fn renumbering_maps_relative_to_absolute() {
        let text = "### -- Begin Page 1 --\na\n### -- End --\n### -- Begin Page 2 (Continuation) --\nb\n### -- End --\n### -- Begin Page 3 --\nc\n### -- End --";
        let renumbered = renumber_begin_markers(text, &[5, 6, 7]).unwrap();
        assert!(renumbered.contains("### -- Begin Page 5 --"));
        assert!(renumbered.contains("### -- Begin Page 6 (Continuation) --"));
        assert!(renumbered.contains("### -- Begin Page 7 --"));
        assert!(!renumbered.contains("Begin Page 1"));
    }

    #[test]
    fn renumbering_rejects_out_of_range_indices() {
        let text = "### -- Begin Page 4 --\nbody\n### -- End --";
        assert!(renumber_begin_markers(text, &[5, 6, 7]).is_err());
        let text = "### -- Begin Page 0 --\nbody\n### -- End --";
        assert!(renumber_begin_markers(text, &[5]).is_err());
    }

    #[test]
    fn segments_render_back_to_canonical_markers() {
        let segment = PageSegment {
            page_number: 9,
            is_continuation: false,
            body: "Body text.\n### -- End --".to_string(),
        };
        assert_eq!(
            segment.render(),
            "### -- Begin Page 9 --\nBody text.\n### -- End --"
        );
    }

    #[test]
    fn error_sentinel_is_detected_in_segment_bodies() {
        let segments = split_pages(
            "### -- Begin Page 3 --\n[ERROR: OCR Failed for page 3]\n### -- Begin Page 4 --\nFine.\n### -- End --",
        );
        assert!(contains_error_sentinel(&segments[0].body));
        assert!(!contains_error_sentinel(&segments[1].body));
    }
}
