//! CLI test cases.
//!
//! Anything that talks to the real recognition service is `#[ignore]`d and
//! needs `GEMINI_API_KEY` plus poppler-utils installed. The rest runs
//! offline.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("paged-ocr").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_ocr_show_prompt() {
    cmd()
        .arg("ocr")
        .arg("--show-prompt")
        .args(["--batch-size", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("### -- Begin Page N --"))
        .stdout(predicate::str::contains("3 pages of a document"));
}

#[test]
fn test_ocr_show_prompt_court_style() {
    cmd()
        .arg("ocr")
        .arg("--show-prompt")
        .args(["--style", "court"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Japanese Court Document"));
}

#[test]
fn test_ocr_requires_an_input_path() {
    cmd().arg("ocr").assert().failure();
}

#[test]
fn test_merge_paged_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let paged = dir.path().join("doc_paged.md");
    std::fs::write(
        &paged,
        "### -- Begin Page 1 --\nFirst paragraph runs over the\n\
         ### -- End (Continuation) --\n\
         ### -- Begin Page 2 (Continuation) --\npage break.\n\
         ### -- End --\n",
    )
    .unwrap();

    cmd().arg("merge").arg(&paged).assert().success();

    let merged = std::fs::read_to_string(dir.path().join("doc.md")).unwrap();
    assert_eq!(merged, "First paragraph runs over thepage break.\n");
}

#[test]
fn test_merge_directory_skips_error_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("good_paged.md"),
        "### -- Begin Page 1 --\nFine.\n### -- End --\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("bad_ERROR_paged.md"),
        "### -- Begin Page 1 --\n[ERROR: OCR Failed for page 1]\n",
    )
    .unwrap();

    cmd().arg("merge").arg(dir.path()).assert().success();

    assert!(dir.path().join("good.md").exists());
    assert!(!dir.path().join("bad.md").exists());
}

#[test]
fn test_merge_refuses_artifacts_with_failed_pages() {
    let dir = tempfile::tempdir().unwrap();
    let paged = dir.path().join("doc_paged.md");
    std::fs::write(
        &paged,
        "### -- Begin Page 1 --\n[ERROR: OCR Failed for page 1]\n",
    )
    .unwrap();

    cmd()
        .arg("merge")
        .arg(&paged)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed pages"));
}

#[test]
#[ignore = "Needs GEMINI_API_KEY and poppler-utils"]
fn test_ocr_two_page_fixture() {
    let dir = tempfile::tempdir().unwrap();
    let pdf = dir.path().join("two_pages.pdf");
    std::fs::copy("tests/fixtures/two_pages.pdf", &pdf).unwrap();

    cmd()
        .arg("ocr")
        .arg(&pdf)
        .args(["--batch-size", "2"])
        .assert()
        .success();

    // Exactly one of the two artifacts must exist.
    let success = dir.path().join("two_pages_paged.md");
    let error = dir.path().join("two_pages_ERROR_paged.md");
    assert!(success.exists() ^ error.exists());
}
