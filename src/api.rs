
use std::time::Duration;

use serde::Serialize;

use crate::{ClientError, ClientErrorDescription};
use crate::types::{
    JobListResponse, JobStatusResponse, SubmitJobResponse, SynthesisRequest,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:4123";

const LONG_TEXT_PATH: &str = "/audio/speech/long";

#[derive(Serialize)]
struct SseBody<'a> {
    #[serde(flatten)]
    request: &'a SynthesisRequest,
    stream_format: &'static str,
}

/// Request/response shaping for the synthesis backend. Holds one pooled
/// connection set. No retry policy of its own; transport failures are
/// surfaced to the caller.
#[derive(Debug, Clone)]
pub struct TtsClient {
    client: reqwest::Client,
    base_url: String,
    session_id: Option<String>,
}

impl TtsClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self { client, base_url, session_id: None })
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn tagged(&self, mut request: SynthesisRequest) -> SynthesisRequest {
        if request.session_id.is_none() {
            request.session_id = self.session_id.clone();
        }
        request
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ClientError::new(ClientErrorDescription::Api {
            status: status.as_u16(),
            message,
        }))
    }

    /// One-shot synthesis: full audio file in a single binary body.
    pub async fn speech(&self, request: &SynthesisRequest) -> Result<Vec<u8>, ClientError> {
        request.validate()?;
        let request = self.tagged(request.clone());
        let response = self
            .client
            .post(self.url("/audio/speech"))
            .json(&request)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Open the live event stream for a real-time synthesis request.
    /// The returned response body is the raw SSE byte stream.
    pub(crate) async fn speech_sse(
        &self,
        request: &SynthesisRequest,
    ) -> Result<reqwest::Response, ClientError> {
        request.validate()?;
        let request = self.tagged(request.clone());
        let response = self
            .client
            .post(self.url("/audio/speech"))
            .header("accept", "text/event-stream")
            .json(&SseBody { request: &request, stream_format: "sse" })
            .send()
            .await?;
        Self::check(response).await
    }

    /// Open the raw chunked byte stream (multipart submission path).
    pub(crate) async fn speech_stream_upload(
        &self,
        request: &SynthesisRequest,
    ) -> Result<reqwest::Response, ClientError> {
        request.validate()?;
        let request = self.tagged(request.clone());

        let mut form = reqwest::multipart::Form::new().text("input", request.input.clone());
        if let Some(voice) = &request.voice {
            form = form.text("voice", voice.clone());
        }
        if let Some(v) = request.exaggeration {
            form = form.text("exaggeration", v.to_string());
        }
        if let Some(v) = request.cfg_weight {
            form = form.text("cfg_weight", v.to_string());
        }
        if let Some(v) = request.temperature {
            form = form.text("temperature", v.to_string());
        }
        if let Some(v) = request.streaming_chunk_size {
            form = form.text("streaming_chunk_size", v.to_string());
        }
        if let Some(v) = request.streaming_strategy {
            form = form.text("streaming_strategy", v.as_str());
        }
        if let Some(v) = request.streaming_quality {
            form = form.text("streaming_quality", v.as_str());
        }
        if let Some(session_id) = &request.session_id {
            form = form.text("session_id", session_id.clone());
        }

        let response = self
            .client
            .post(self.url("/audio/speech/stream/upload"))
            .multipart(form)
            .send()
            .await?;
        Self::check(response).await
    }

    pub async fn submit_job(&self, request: &SynthesisRequest) -> Result<SubmitJobResponse, ClientError> {
        request.validate()?;
        let request = self.tagged(request.clone());
        let response = self
            .client
            .post(self.url(LONG_TEXT_PATH))
            .json(&request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, ClientError> {
        let response = self
            .client
            .get(self.url(&format!("{}/{}", LONG_TEXT_PATH, job_id)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn list_jobs(&self, limit: u32) -> Result<JobListResponse, ClientError> {
        let response = self
            .client
            .get(self.url(LONG_TEXT_PATH))
            .query(&[("limit", limit)])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn pause_job(&self, job_id: &str) -> Result<(), ClientError> {
        self.job_control(job_id, "pause").await
    }

    pub async fn resume_job(&self, job_id: &str) -> Result<(), ClientError> {
        self.job_control(job_id, "resume").await
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<(), ClientError> {
        self.job_control(job_id, "cancel").await
    }

    async fn job_control(&self, job_id: &str, action: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .post(self.url(&format!("{}/{}/{}", LONG_TEXT_PATH, job_id, action)))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Open the job's event subscription stream.
    pub(crate) async fn job_events(&self, job_id: &str) -> Result<reqwest::Response, ClientError> {
        let response = self
            .client
            .get(self.url(&format!("{}/{}/events", LONG_TEXT_PATH, job_id)))
            .header("accept", "text/event-stream")
            .send()
            .await?;
        Self::check(response).await
    }

    /// Fetch one ready chunk by the URL the server handed out. Server URLs
    /// are paths relative to the API base; absolute URLs pass through.
    pub async fn download_chunk(&self, chunk_url: &str) -> Result<Vec<u8>, ClientError> {
        let url = if chunk_url.starts_with("http://") || chunk_url.starts_with("https://") {
            chunk_url.to_owned()
        } else {
            self.url(chunk_url)
        };
        let response = self.client.get(url).send().await?;
        let response = Self::check(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn download_job_audio(&self, job_id: &str) -> Result<Vec<u8>, ClientError> {
        let response = self
            .client
            .get(self.url(&format!("{}/{}/audio", LONG_TEXT_PATH, job_id)))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = TtsClient::new("http://localhost:4123///").unwrap();
        assert_eq!(client.base_url(), "http://localhost:4123");
    }

    #[test]
    fn sse_body_carries_stream_format() {
        let request = SynthesisRequest::new("hi");
        let body = serde_json::to_value(SseBody { request: &request, stream_format: "sse" }).unwrap();
        assert_eq!(body["stream_format"], "sse");
        assert_eq!(body["input"], "hi");
        assert!(body.get("voice").is_none());
    }

    #[test]
    fn session_id_is_attached_once() {
        let client = TtsClient::new(DEFAULT_BASE_URL).unwrap().with_session_id("s-1");
        let tagged = client.tagged(SynthesisRequest::new("hi"));
        assert_eq!(tagged.session_id.as_deref(), Some("s-1"));

        let mut explicit = SynthesisRequest::new("hi");
        explicit.session_id = Some("s-2".to_owned());
        assert_eq!(client.tagged(explicit).session_id.as_deref(), Some("s-2"));
    }
}
