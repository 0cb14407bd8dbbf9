
use serde::{Deserialize, Serialize};

use clap::ValueEnum;

use crate::{ClientError, ClientErrorDescription};

/// How the backend segments input text into streamable pieces.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    #[default]
    Sentence,
    Paragraph,
    Fixed,
    Word,
}

impl ChunkStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sentence => "sentence",
            Self::Paragraph => "paragraph",
            Self::Fixed => "fixed",
            Self::Word => "word",
        }
    }
}

/// Latency/fidelity trade-off for streamed synthesis.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamingQuality {
    Fast,
    #[default]
    Balanced,
    High,
}

impl StreamingQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::High => "high",
        }
    }
}

/// One synthesis submission. Immutable once handed to the client.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisRequest {
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exaggeration: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cfg_weight: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming_chunk_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming_strategy: Option<ChunkStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming_quality: Option<StreamingQuality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl SynthesisRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            voice: None,
            exaggeration: None,
            cfg_weight: None,
            temperature: None,
            streaming_chunk_size: None,
            streaming_strategy: None,
            streaming_quality: None,
            session_id: None,
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.input.trim().is_empty() {
            return Err(ClientError::new(ClientErrorDescription::EmptyInput));
        }
        for (name, value) in [
            ("exaggeration", self.exaggeration),
            ("cfg_weight", self.cfg_weight),
            ("temperature", self.temperature),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || !(0.0..=2.0).contains(&v) {
                    return Err(ClientError::new(ClientErrorDescription::InvalidParameter(name)));
                }
            }
        }
        Ok(())
    }
}

/// Sample-format metadata announced once per stream, before any audio bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioInfo {
    pub fn bytes_per_sample(&self) -> u16 {
        self.bits_per_sample / 8
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * self.bytes_per_sample() as u32
    }

    pub fn block_align(&self) -> u16 {
        self.channels * self.bytes_per_sample()
    }
}

/// One unit of decoded audio, identified by its ordinal within the stream/job.
#[derive(Debug, Clone)]
pub struct AudioFragment {
    pub index: u64,
    pub pcm: Vec<u8>,
}

/// Running counters for one stream. Monotonic until the stream completes.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StreamingProgress {
    pub chunks_received: u64,
    pub total_bytes: u64,
    pub is_complete: bool,
}

impl StreamingProgress {
    pub(crate) fn record(&mut self, bytes: usize) {
        self.chunks_received += 1;
        self.total_bytes += bytes as u64;
    }
}

/// Typed view of one real-time stream event. Every event carries the
/// progress snapshot taken right after it was applied.
#[derive(Debug, Clone)]
pub enum SpeechEvent {
    Info { info: AudioInfo, progress: StreamingProgress },
    Delta { fragment: AudioFragment, progress: StreamingProgress },
    Done { progress: StreamingProgress },
}

/// Server-reported lifecycle state of a long-text job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Chunking,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Membership test used everywhere a job's "still running" flag is derived.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Chunking | Self::Processing | Self::Paused)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Pending => "Waiting to start",
            Self::Chunking => "Splitting text into chunks",
            Self::Processing => "Generating audio",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub processed_chunks: u32,
    #[serde(default)]
    pub total_chunks: u32,
    #[serde(default)]
    pub percent: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    #[serde(rename = "job_id")]
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub progress: Option<JobProgress>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct JobStatusResponse {
    pub job: Job,
    #[serde(default)]
    pub progress: Option<JobProgress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobListItem {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobListResponse {
    #[serde(default)]
    pub jobs: Vec<JobListItem>,
}

/// One record from a job's event subscription, as sent on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct JobEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: JobEventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobEventData {
    #[serde(default)]
    pub progress: Option<JobProgress>,
    #[serde(default)]
    pub chunk_index: Option<u64>,
    #[serde(default)]
    pub chunk_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<JobStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_statuses_match_membership_test() {
        for status in [JobStatus::Pending, JobStatus::Chunking, JobStatus::Processing, JobStatus::Paused] {
            assert!(status.is_active(), "{:?} should be active", status);
        }
        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(!status.is_active(), "{:?} should be terminal", status);
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn audio_info_derives_header_fields() {
        let info = AudioInfo { sample_rate: 24000, channels: 1, bits_per_sample: 16 };
        assert_eq!(info.byte_rate(), 48000);
        assert_eq!(info.block_align(), 2);
    }

    #[test]
    fn empty_input_is_rejected() {
        let request = SynthesisRequest::new("   ");
        assert!(request.validate().is_err());
    }

    #[test]
    fn out_of_range_parameter_is_rejected() {
        let mut request = SynthesisRequest::new("hello");
        request.temperature = Some(5.0);
        assert!(request.validate().is_err());
        request.temperature = Some(0.8);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn job_status_deserializes_from_wire_strings() {
        let status: JobStatus = serde_json::from_str("\"chunking\"").unwrap();
        assert_eq!(status, JobStatus::Chunking);
    }

    #[test]
    fn job_event_tolerates_sparse_data() {
        let event: JobEvent = serde_json::from_str(r#"{"event_type":"progress","data":{"progress":{"processed_chunks":3,"total_chunks":10}}}"#).unwrap();
        assert_eq!(event.event_type, "progress");
        assert_eq!(event.data.progress.unwrap().processed_chunks, 3);

        let bare: JobEvent = serde_json::from_str(r#"{"event_type":"job_paused"}"#).unwrap();
        assert!(bare.data.chunk_url.is_none());
    }
}
