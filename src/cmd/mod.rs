//! Command-line entry points.

pub mod merge;
pub mod ocr;
