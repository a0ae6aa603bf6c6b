//! A scripted batch service for pipeline tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    gemini::{
        BatchClient, BatchDest, BatchJob, Candidate, Content, CreateBatchRequest,
        GenerateResponse, InlinedResponse, JobState, Part, StatusDetail,
    },
    prelude::*,
};

/// How the scripted service answers one submission.
#[derive(Debug)]
pub enum ScriptEntry {
    /// The job fails as a whole.
    JobFails,

    /// The job succeeds; each request gets the matching per-request
    /// behavior.
    Responds(Vec<RequestBehavior>),
}

/// How the scripted service answers one request within a succeeded job.
#[derive(Debug, Clone)]
pub enum RequestBehavior {
    /// Emit well-formed markers for `pages` pages.
    GoodText { pages: usize },

    /// Emit text with the final end marker missing.
    TruncatedText { pages: usize },

    /// Return a per-request error object instead of a response.
    RequestError,
}

/// A scripted service: each submission is answered with the next entry in
/// the script. Jobs are terminal by their first poll, so tests never sleep.
#[derive(Debug)]
pub struct ScriptedClient {
    script: Mutex<Vec<ScriptEntry>>,
    submissions: Mutex<Vec<usize>>,
    jobs: Mutex<Vec<BatchJob>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<ScriptEntry>) -> Self {
        Self {
            script: Mutex::new(script),
            submissions: Mutex::new(Vec::new()),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Request counts of each submission made, in order.
    pub fn submission_sizes(&self) -> Vec<usize> {
        self.submissions.lock().unwrap().clone()
    }
}

/// Well-formed marked-up text for `pages` relative pages.
pub fn good_text(pages: usize) -> String {
    (1..=pages)
        .map(|n| format!("### -- Begin Page {n} --\nPage {n} text.\n### -- End --\n"))
        .collect()
}

/// Marked-up text with the final end marker chopped off.
pub fn truncated_text(pages: usize) -> String {
    let mut text = good_text(pages);
    let end = text.rfind("### -- End --").unwrap();
    text.truncate(end);
    text
}

fn text_response(text: String) -> InlinedResponse {
    InlinedResponse {
        response: Some(GenerateResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: "model".to_string(),
                    parts: vec![Part::text(text)],
                }),
            }],
        }),
        error: None,
    }
}

#[async_trait]
impl BatchClient for ScriptedClient {
    async fn create_batch(
        &self,
        _model: &str,
        request: &CreateBatchRequest,
    ) -> Result<BatchJob> {
        self.submissions.lock().unwrap().push(request.src.len());
        let entry = {
            let mut script = self.script.lock().unwrap();
            assert!(!script.is_empty(), "service called more times than scripted");
            script.remove(0)
        };
        let job_number = self.submissions.lock().unwrap().len();
        let (state, dest, error) = match entry {
            ScriptEntry::JobFails => (
                JobState::Failed,
                None,
                Some(StatusDetail {
                    code: 13,
                    message: "scripted failure".to_string(),
                }),
            ),
            ScriptEntry::Responds(behaviors) => {
                assert_eq!(
                    behaviors.len(),
                    request.src.len(),
                    "script entry doesn't match submission size"
                );
                let responses = behaviors
                    .into_iter()
                    .map(|behavior| match behavior {
                        RequestBehavior::GoodText { pages } => {
                            text_response(good_text(pages))
                        }
                        RequestBehavior::TruncatedText { pages } => {
                            text_response(truncated_text(pages))
                        }
                        RequestBehavior::RequestError => InlinedResponse {
                            response: None,
                            error: Some(StatusDetail {
                                code: 8,
                                message: "scripted request error".to_string(),
                            }),
                        },
                    })
                    .collect();
                (
                    JobState::Succeeded,
                    Some(BatchDest {
                        inlined_responses: responses,
                    }),
                    None,
                )
            }
        };
        let job = BatchJob {
            name: format!("batches/test-{job_number}"),
            state,
            dest,
            error,
        };
        self.jobs.lock().unwrap().push(job.clone());
        Ok(job)
    }

    async fn get_batch(&self, name: &str) -> Result<BatchJob> {
        let jobs = self.jobs.lock().unwrap();
        jobs.iter()
            .find(|job| job.name == name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such job: {name}"))
    }
}
