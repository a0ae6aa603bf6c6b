//! The OCR instruction sent with every batch request.
//!
//! Each request carries the pages of one batch plus this fixed textual
//! instruction. The instruction pins down the page marker grammar that the
//! validator later checks, and a document style context that tells the model
//! how to lay out the transcription.

use clap::ValueEnum;

/// Style context for Japanese court documents: numbered-heading hierarchy,
/// spaced-out titles, strict line-merge rules.
const COURT_DOC_STYLE: &str = r#"# CONTEXT: Japanese Court Document
- **Format**: Horizontal text. Ignore line numbers, punch holes, stamps, and page numbers (including surrounding symbols like "- 1 -") in margins.
- **Spaced Text**: Remove wide spacing in titles (e.g., "陳　述　書" -> "**陳述書**").
- **Line Breaks**: CRITICAL. Merge lines within paragraphs. Only break lines at clear paragraph ends or headings.

# STRUCTURE & HEADINGS
1. **Decision: Heading or Paragraph?** (Apply this FIRST)
   - **Paragraph**: If the text following the number/marker is a long sentence (often ends with "。") or spans multiple lines, it is a **Paragraph**. Do NOT use `#`.
   - **Paragraph**: If you see consecutive items of the same level (e.g., "1 ...", "2 ..." or "ア ...", "イ ..."), they are **Paragraphs**. Do NOT use `#`.
   - **Heading**: Only if the text is short (a title), usually has no punctuation at the end, and is followed by body text on the next line.

2. **Heading Hierarchy** (Apply ONLY if it is a Heading)
   - "第1", "第2" ... -> H1 (`#`)
   - "1", "2" ... -> H2 (`##`)
   - "(1)", "(2)" ... -> H3 (`###`)
   - "ア", "イ" ... -> H4 (`####`)
   - "(ア)", "(イ)" ... -> H5 (`#####`)

3. **Formatting Rules**
   - **No Numbering = No Heading**: Text like "事実及び理由" or "主文" must be **Bold** (`**text**`).
   - **Numbering Style**: Use standard paragraphs starting with the number (e.g., "1 被告は..."). Do NOT use Markdown lists (`1. ...`).
"#;

/// Style context for general documents: evidence, books, reports.
const GENERAL_DOC_STYLE: &str = r#"# CONTEXT: General Document (Evidence, Books, Reports, etc.)
- **Format**: Maintain the original structure as much as possible.
- **Line Breaks**: Merge lines within the same paragraph. Keep line breaks for headings, lists, and clear paragraph transitions.
- **Tables**: If tables are present, represent them using Markdown table format.
- **Lists**: Use standard Markdown list markers (`-`, `*`, or `1.`).
- **Exclusions**: Ignore headers, footers, and page numbers if they are repetitive and not part of the main content.
- **Page Numbers**: Page numbers may be Arabic (1, 2), Kanji (一, 二), or Roman (I, II) numerals. Omit them if they are in margins, but use them for the Page Markers (converting to Arabic numerals).
- **Emphasis**: Use bold (`**text**`) or italics (`*text*`) where appropriate based on the visual style of the document.
"#;

/// Which document style context to include in the instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum DocStyle {
    /// Japanese court documents (judgments, briefs, written statements).
    Court,

    /// General documents: evidence, books, reports.
    #[default]
    General,
}

impl DocStyle {
    /// The style context text for this document style.
    fn context(self) -> &'static str {
        match self {
            DocStyle::Court => COURT_DOC_STYLE,
            DocStyle::General => GENERAL_DOC_STYLE,
        }
    }
}

/// Build the OCR instruction for a batch of `num_pages` pages.
///
/// The model sees only the pages in its batch, so the markers it emits use
/// relative indices `1..=num_pages`. They're rewritten to absolute physical
/// page numbers after validation.
pub fn ocr_instruction(num_pages: usize, style: DocStyle) -> String {
    format!(
        r#"# ROLE
High-precision OCR engine converting scanned PDF pages to clean Markdown.

{style}
# INPUT
{num_pages} pages of a document, in order.

# OUTPUT RULES
1. **Markdown Only**: No conversational text.
2. **Page Markers**:
   - **Start**: At the start of each page's content, output `### -- Begin Page N --`.
     - N: Batch page index (1-{num_pages}).
     - Append ` (Continuation)` before the closing `--` if the page starts mid-paragraph, continuing from the previous page.
   - **End**: At the end of each page's content, output `### -- End --`.
     - If a printed page number is visible on the page, output `### -- End (Printed Page X) --` instead.
     - Append ` (Continuation)` before the closing `--` if the paragraph continues onto the next page.
   - Emit exactly one Begin and one End marker per page, for all {num_pages} pages.
3. **Transcription Rules**:
   - **No Indentation**: Standard Markdown paragraphs.
   - **Numbers**: Convert ALL full-width numbers to half-width (e.g., "１" -> "1").
   - **Corrections**: Fix obvious OCR errors (0 vs O). Keep original typos with `［ママ］`.
   - **Exclusions**: Omit printed page numbers from the body text.
"#,
        style = style.context(),
        num_pages = num_pages,
    )
}
