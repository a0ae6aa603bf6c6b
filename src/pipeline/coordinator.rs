//! Round-based retry coordination.
//!
//! Each round submits every still-pending unit, waits for the jobs to reach
//! a terminal state, validates each unit's outcome, and keeps only the
//! failures for the next round. Batch failures are usually systemic (service
//! outage, malformed instruction) rather than unit-specific, so we retry
//! whole rounds instead of tracking per-unit backoff.

use std::time::Duration;

use indicatif::ProgressBar;
use uuid::Uuid;

use crate::{
    gemini::{self, BatchClient, JobState, MAX_BATCH_SIZE},
    pipeline::{
        chunker::BatchUnit,
        validate::{self, PageResult, UnitFailure},
    },
    prelude::*,
    progress::RunProgress,
};

/// How many retry rounds to run after the initial round before declaring
/// the remaining units permanently failed.
pub const MAX_RETRIES: u32 = 3;

/// What's left after the rounds have run.
#[derive(Debug)]
pub struct RoundsOutcome {
    /// Physical pages that could not be resolved in any round.
    pub failed_pages: Vec<u64>,

    /// How many times the retry counter was incremented.
    pub retry_count: u32,
}

/// Run submit/poll/validate rounds over `units` until everything validates
/// or the retry budget runs out.
///
/// Validated pages are merged into `resolved` as their units complete;
/// entries already present are never removed. Submission rejections
/// propagate as hard errors: they mean the payload itself is wrong, and
/// resubmitting the same bytes can't fix that.
#[instrument(level = "debug", skip_all, fields(unit_count = units.len(), model = %model))]
pub async fn run_rounds(
    client: &dyn BatchClient,
    model: &str,
    units: Vec<BatchUnit>,
    poll_interval: Duration,
    progress: &mut RunProgress,
    progress_bar: &ProgressBar,
    resolved: &mut PageResult,
) -> Result<RoundsOutcome> {
    let mut pending = units;
    let mut retry_count = 0;

    while !pending.is_empty() {
        let round_size = pending.len();
        info!(
            round = retry_count,
            pending_units = round_size,
            "submitting batch round"
        );

        // Pack this round's units into as few jobs as the payload ceiling
        // allows, then submit them all before waiting on any.
        let mut active_jobs = Vec::new();
        let mut remaining = pending;
        pending = Vec::new();
        while !remaining.is_empty() {
            let job_units = take_units_for_job(&mut remaining);
            let display_name = format!("ocr-batch-r{}-{}", retry_count, Uuid::new_v4());
            let requests = job_units
                .iter()
                .map(|unit| unit.request.clone())
                .collect::<Vec<_>>();
            let job = gemini::submit(client, model, &display_name, requests).await?;
            debug!(job = %job.name, units = job_units.len(), "batch job created");
            active_jobs.push((job, job_units));
        }

        // Wait for each job and validate its units. Jobs in one round finish
        // in whatever order the service likes; that's fine, because results
        // are keyed by physical page, not by completion order.
        for (job, job_units) in active_jobs {
            let finished =
                gemini::await_completion(client, &job, progress, poll_interval).await?;
            match finished.state {
                JobState::Succeeded => {
                    let outcomes = finished
                        .dest
                        .map(|dest| dest.inlined_responses)
                        .unwrap_or_default();
                    for (idx, unit) in job_units.into_iter().enumerate() {
                        let accepted = match outcomes.get(idx) {
                            Some(outcome) => validate::accept_unit(outcome, &unit.metadata),
                            None => Err(UnitFailure::MissingOutcome),
                        };
                        match accepted {
                            Ok(pages) => {
                                for (page, segment) in pages {
                                    resolved.entry(page).or_insert(segment);
                                }
                                progress.complete_unit();
                                progress_bar.inc(1);
                            }
                            Err(failure) => {
                                warn!(
                                    pages = ?unit.metadata.pages,
                                    %failure,
                                    "unit failed validation, queueing for retry"
                                );
                                pending.push(unit);
                            }
                        }
                    }
                }
                state => {
                    // A job-level failure is coarse-grained: we don't know
                    // which sub-request sank it, so every unit in the job
                    // goes back in the pending set.
                    warn!(
                        job = %finished.name,
                        %state,
                        error = %finished
                            .error
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "none".to_string()),
                        "batch job did not succeed, queueing all its units for retry"
                    );
                    pending.extend(job_units);
                }
            }
        }

        if pending.is_empty() {
            break;
        }
        retry_count += 1;
        if retry_count >= MAX_RETRIES {
            warn!(
                pending_units = pending.len(),
                "retry budget exhausted, declaring remaining units failed"
            );
            break;
        }
        info!(
            retry_count,
            pending_units = pending.len(),
            "retrying failed units"
        );
    }

    let failed_pages = pending
        .iter()
        .flat_map(|unit| unit.metadata.pages.iter().copied())
        .collect::<Vec<_>>();
    Ok(RoundsOutcome {
        failed_pages,
        retry_count,
    })
}

/// Pop a prefix of `remaining` that fits under the per-job payload ceiling.
///
/// Always takes at least one unit, so a single over-ceiling unit surfaces
/// as a submission-time error rather than an infinite loop.
fn take_units_for_job(remaining: &mut Vec<BatchUnit>) -> Vec<BatchUnit> {
    let mut size = 0;
    let mut count = 0;
    for unit in remaining.iter() {
        if count > 0 && size + unit.serialized_size > MAX_BATCH_SIZE {
            break;
        }
        size += unit.serialized_size;
        count += 1;
    }
    let rest = remaining.split_off(count);
    std::mem::replace(remaining, rest)
}
