//! Batch job client for the Gemini API.
//!
//! The recognition work itself happens inside the service's asynchronous
//! batch jobs. Our job is to hand over well-formed requests, poll until the
//! job reaches a terminal state, and hand the per-request outcomes back to
//! the coordinator. [`BatchClient`] is the seam: the real HTTP client lives
//! behind it, and tests script the service's behavior with an in-memory
//! implementation.

use std::{env, fmt, time::Duration};

use anyhow::bail;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{prelude::*, progress::RunProgress, retry::IsKnownTransient};

/// Ceiling on the serialized payload of one batch submission. The service
/// rejects anything at 20 MiB; we stop short of it.
pub const MAX_BATCH_SIZE: usize = 19 * 1024 * 1024;

/// How often to poll a running batch job.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// One part of a request or response content: inline bytes or text.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Inline binary data (base64-encoded on the wire).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,

    /// Plain text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Part {
    /// An inline-data part.
    pub fn inline_data(mime_type: &str, base64_data: String) -> Self {
        Self {
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data: base64_data,
            }),
            text: None,
        }
    }

    /// A text part.
    pub fn text(text: String) -> Self {
        Self {
            inline_data: None,
            text: Some(text),
        }
    }
}

/// Inline binary data.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    /// The MIME type of the data.
    pub mime_type: String,

    /// Base64-encoded bytes.
    pub data: String,
}

/// A role-tagged sequence of parts.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Content {
    /// "user" for requests, "model" for responses.
    #[serde(default)]
    pub role: String,

    /// The parts of this content.
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// Generation settings sent with every request.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Sampling temperature. We keep this low: OCR wants transcription,
    /// not creativity.
    pub temperature: f32,

    /// The response MIME type. Always `text/plain` here.
    pub response_mime_type: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            response_mime_type: "text/plain".to_string(),
        }
    }
}

/// One recognition request within a batch job.
#[derive(Clone, Debug, Serialize)]
pub struct GenerateRequest {
    /// The request contents: page data parts followed by the instruction.
    pub contents: Vec<Content>,

    /// Generation settings.
    pub config: GenerationConfig,
}

/// The body of a batch job creation call.
#[derive(Debug, Serialize)]
pub struct CreateBatchRequest {
    /// The requests to run, one per unit.
    pub src: Vec<GenerateRequest>,

    /// Job-level settings.
    pub config: BatchJobConfig,
}

/// Job-level settings for a batch submission.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJobConfig {
    /// A human-readable name for the job.
    pub display_name: String,
}

/// The lifecycle state of a batch job.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum JobState {
    #[serde(rename = "JOB_STATE_CREATED")]
    Created,
    #[serde(rename = "JOB_STATE_QUEUED")]
    Queued,
    #[serde(rename = "JOB_STATE_RUNNING")]
    Running,
    #[serde(rename = "JOB_STATE_SUCCEEDED")]
    Succeeded,
    #[serde(rename = "JOB_STATE_FAILED")]
    Failed,
    #[serde(rename = "JOB_STATE_CANCELLED")]
    Cancelled,
    #[serde(rename = "JOB_STATE_EXPIRED")]
    Expired,
    /// Any state we don't recognize. Treated as non-terminal.
    #[serde(other)]
    Unknown,
}

impl JobState {
    /// Is this a terminal state? Terminal jobs are never polled again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled | JobState::Expired
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A batch job record, as created and as polled.
#[derive(Clone, Debug, Deserialize)]
pub struct BatchJob {
    /// The server-assigned job name, e.g. `batches/abc123`.
    pub name: String,

    /// The current lifecycle state.
    pub state: JobState,

    /// Results, present once the job has succeeded.
    #[serde(default)]
    pub dest: Option<BatchDest>,

    /// Job-level error, present when the job has failed.
    #[serde(default)]
    pub error: Option<StatusDetail>,
}

/// Where a finished job's results live.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDest {
    /// Per-request outcomes, order-aligned with the submitted requests.
    #[serde(default)]
    pub inlined_responses: Vec<InlinedResponse>,
}

/// The outcome of one request within a succeeded job: a response, or an
/// error object, never both.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InlinedResponse {
    /// The model's response, if recognition ran.
    #[serde(default)]
    pub response: Option<GenerateResponse>,

    /// The error, if this particular request failed.
    #[serde(default)]
    pub error: Option<StatusDetail>,
}

/// A model response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GenerateResponse {
    /// Response candidates. We only ever look at the first.
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl GenerateResponse {
    /// The text of the first candidate, or `None` if the response carried
    /// no text at all.
    pub fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text = content
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .concat();
        if text.is_empty() { None } else { Some(text) }
    }
}

/// One response candidate.
#[derive(Clone, Debug, Deserialize)]
pub struct Candidate {
    /// The candidate's content.
    #[serde(default)]
    pub content: Option<Content>,
}

/// A structured error from the service.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatusDetail {
    /// The numeric error code.
    #[serde(default)]
    pub code: i32,

    /// The error message.
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for StatusDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Interface to the batch job service.
#[async_trait]
pub trait BatchClient: fmt::Debug + Send + Sync {
    /// Create a new batch job. Fails if the service rejects the submission.
    async fn create_batch(
        &self,
        model: &str,
        request: &CreateBatchRequest,
    ) -> Result<BatchJob>;

    /// Fetch the current state of a batch job.
    async fn get_batch(&self, name: &str) -> Result<BatchJob>;
}

/// Submit one batch job, checking the payload ceiling first.
///
/// The ceiling check happens before any network traffic: an oversized
/// payload means the chunker mis-grouped units, and retrying can't fix a
/// caller bug.
pub async fn submit(
    client: &dyn BatchClient,
    model: &str,
    display_name: &str,
    requests: Vec<GenerateRequest>,
) -> Result<BatchJob> {
    let request = CreateBatchRequest {
        src: requests,
        config: BatchJobConfig {
            display_name: display_name.to_string(),
        },
    };
    let payload_size = serde_json::to_vec(&request)
        .context("failed to serialize batch request")?
        .len();
    if payload_size > MAX_BATCH_SIZE {
        bail!(
            "batch payload is {payload_size} bytes, over the {MAX_BATCH_SIZE}-byte ceiling; this is a chunking bug"
        );
    }
    debug!(%model, %display_name, payload_size, "creating batch job");
    client.create_batch(model, &request).await
}

/// Poll a batch job until it reaches a terminal state.
///
/// Polls on a fixed interval. Known-transient polling errors are logged and
/// polled through; anything else aborts the run. `progress` is used purely
/// for elapsed/ETA reporting.
#[instrument(level = "debug", skip_all, fields(job = %job.name))]
pub async fn await_completion(
    client: &dyn BatchClient,
    job: &BatchJob,
    progress: &RunProgress,
    poll_interval: Duration,
) -> Result<BatchJob> {
    loop {
        match client.get_batch(&job.name).await {
            Ok(updated) if updated.state.is_terminal() => {
                info!(
                    state = %updated.state,
                    elapsed_secs = progress.elapsed().as_secs(),
                    "batch job finished"
                );
                return Ok(updated);
            }
            Ok(updated) => {
                let eta = progress
                    .estimated_remaining()
                    .map(|eta| format!("{}s", eta.as_secs()))
                    .unwrap_or_else(|| "unknown".to_string());
                info!(
                    state = %updated.state,
                    elapsed_secs = progress.elapsed().as_secs(),
                    estimated_remaining = %eta,
                    "waiting for batch job"
                );
            }
            Err(err) if err.is_known_transient() => {
                warn!("transient error polling batch job: {err:?}");
            }
            Err(err) => {
                return Err(err.context("failed to poll batch job"));
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// The real HTTP client.
pub struct GeminiBatchClient {
    /// The underlying HTTP client.
    http: reqwest::Client,

    /// API base URL, without a trailing slash.
    api_base: String,

    /// The API key.
    api_key: String,
}

impl GeminiBatchClient {
    /// Create a client from `GEMINI_API_KEY` and (optionally)
    /// `GEMINI_API_BASE`.
    pub fn new() -> Result<Self> {
        let api_key = env::var("GEMINI_API_KEY")
            .context("GEMINI_API_KEY environment variable is not set")?;
        let mut api_base = env::var("GEMINI_API_BASE")
            .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".to_string());
        while api_base.ends_with('/') {
            api_base.pop();
        }
        Ok(Self {
            http: reqwest::Client::new(),
            api_base,
            api_key,
        })
    }

    /// Parse a response, converting non-success statuses into
    /// [`ServiceStatusError`]s that keep the body for diagnostics.
    async fn parse_response(response: reqwest::Response) -> Result<BatchJob> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceStatusError { status, body }.into());
        }
        response
            .json::<BatchJob>()
            .await
            .context("failed to parse batch job response")
    }
}

impl fmt::Debug for GeminiBatchClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keep the API key out of logs.
        f.debug_struct("GeminiBatchClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BatchClient for GeminiBatchClient {
    #[instrument(level = "trace", skip_all, fields(model = %model))]
    async fn create_batch(
        &self,
        model: &str,
        request: &CreateBatchRequest,
    ) -> Result<BatchJob> {
        let url = format!(
            "{}/models/{}:batchGenerateContent",
            self.api_base, model
        );
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .context("failed to create batch job")?;
        Self::parse_response(response).await
    }

    #[instrument(level = "trace", skip_all, fields(name = %name))]
    async fn get_batch(&self, name: &str) -> Result<BatchJob> {
        let url = format!("{}/{}", self.api_base, name);
        let response = self
            .http
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;
        Self::parse_response(response).await
    }
}

/// An HTTP error status from the service, with the response body.
#[derive(Debug)]
pub struct ServiceStatusError {
    /// The HTTP status code.
    pub status: StatusCode,

    /// The response body, often a JSON error description.
    pub body: String,
}

impl fmt::Display for ServiceStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service returned {}: {}", self.status, self.body)
    }
}

impl std::error::Error for ServiceStatusError {}

impl IsKnownTransient for ServiceStatusError {
    fn is_known_transient(&self) -> bool {
        self.status.is_known_transient()
    }
}

/// Scan an [`anyhow::Error`]'s cause chain for anything we know to be
/// transient.
impl IsKnownTransient for anyhow::Error {
    fn is_known_transient(&self) -> bool {
        self.chain().any(|cause| {
            cause
                .downcast_ref::<reqwest::Error>()
                .map(IsKnownTransient::is_known_transient)
                .or_else(|| {
                    cause
                        .downcast_ref::<ServiceStatusError>()
                        .map(IsKnownTransient::is_known_transient)
                })
                .unwrap_or(false)
        })
    }
}
