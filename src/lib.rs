
pub mod error;
pub mod types;
pub mod api;
pub mod stream;
pub mod playback;
pub mod wav;
pub mod jobs;
pub mod track;
pub mod store;
pub mod settings;

pub mod deps {
    pub use serde_json;
    pub use serde;
}

pub use error::{
    ErrorDescription,
    GenericError,
};

pub use api::{TtsClient, DEFAULT_BASE_URL};
pub use jobs::{JobManager, JobState};
pub use playback::{AudioPlayer, AudioSink, FragmentSequencer};
pub use settings::{AdvancedSettings, ProcessingMode, Settings};
pub use store::KvStore;
pub use stream::{RawAudioEvent, RawAudioStream, SpeechStream};
pub use track::TrackedJobs;
pub use types::{
    AudioFragment, AudioInfo, ChunkStrategy, Job, JobStatus, SpeechEvent, StreamingProgress,
    StreamingQuality, SynthesisRequest,
};

/// Inputs longer than this route to the long-text job path in auto mode.
pub const LONG_TEXT_THRESHOLD: usize = 3000;

#[non_exhaustive]
pub enum ClientErrorDescription {
    EmptyInput,
    InvalidParameter(&'static str),
    Api { status: u16, message: String },
    Transport(String),
    MissingAudioInfo,
    ChunkDecode(String),
    Playback(String),
}

impl ErrorDescription for ClientErrorDescription {
    #[allow(refining_impl_trait)]
    fn description(&self) -> String {
        match self {
            Self::EmptyInput => "Input text must not be empty".to_owned(),
            Self::InvalidParameter(name) => format!("Parameter {} is out of range", name),
            Self::Api { status, message } => {
                if message.is_empty() {
                    format!("Server returned status {}", status)
                } else {
                    format!("Server returned status {}: {}", status, message)
                }
            }
            Self::Transport(message) => format!("Network error: {}", message),
            Self::MissingAudioInfo => "Audio info not received".to_owned(),
            Self::ChunkDecode(message) => format!("Audio chunk could not be decoded: {}", message),
            Self::Playback(message) => format!("Audio playback failed: {}", message),
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type ClientError = GenericError<ClientErrorDescription>;

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::new(ClientErrorDescription::Transport(err.to_string()))
    }
}
