
use base64::Engine as _;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{ClientError, ClientErrorDescription};
use crate::api::TtsClient;
use crate::types::{AudioFragment, AudioInfo, SpeechEvent, StreamingProgress, SynthesisRequest};

/// Wire shape of one `data:` record on the speech event stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RawSpeechEvent {
    #[serde(rename = "speech.audio.info")]
    Info {
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
    },
    #[serde(rename = "speech.audio.delta")]
    Delta { audio: String },
    #[serde(rename = "speech.audio.done")]
    Done {},
}

/// Reassembles newline-delimited records out of arbitrarily split network
/// chunks and extracts the payload of data-bearing lines. Everything else
/// (comments, event name lines, blank keep-alives) is passed over.
#[derive(Debug, Default)]
pub(crate) struct SseFrameDecoder {
    buffer: Vec<u8>,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(payload) = Self::payload_of(&line[..line.len() - 1]) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Drain whatever is left once the transport signals end of stream.
    pub fn finish(&mut self) -> Vec<String> {
        let line = std::mem::take(&mut self.buffer);
        Self::payload_of(&line).into_iter().collect()
    }

    fn payload_of(line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.strip_suffix('\r').unwrap_or(&line);
        if let Some(payload) = line.strip_prefix("data: ") {
            Some(payload.to_owned())
        } else {
            if !line.is_empty() && !line.starts_with(':') && !line.starts_with("event:") {
                log::debug!("ignoring non-data stream line: {}", line);
            }
            None
        }
    }
}

/// Turns decoded record payloads into typed events. Tracks the descriptor,
/// the monotonic progress counters and the fragment ordinal. Malformed
/// records are logged and dropped without ending the stream.
#[derive(Debug, Default)]
pub(crate) struct StreamAssembler {
    info: Option<AudioInfo>,
    progress: StreamingProgress,
    next_index: u64,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, payload: &str) -> Option<SpeechEvent> {
        let raw: RawSpeechEvent = match serde_json::from_str(payload) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("skipping malformed stream record: {}", e);
                return None;
            }
        };

        match raw {
            RawSpeechEvent::Info { sample_rate, channels, bits_per_sample } => {
                if self.info.is_some() {
                    log::warn!("duplicate audio-info record ignored");
                    return None;
                }
                let info = AudioInfo { sample_rate, channels, bits_per_sample };
                self.info = Some(info);
                Some(SpeechEvent::Info { info, progress: self.progress })
            }
            RawSpeechEvent::Delta { audio } => {
                if self.info.is_none() {
                    log::warn!("audio delta before descriptor; dropping record");
                    return None;
                }
                let pcm = match base64::engine::general_purpose::STANDARD.decode(audio) {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        log::warn!("skipping undecodable audio delta: {}", e);
                        return None;
                    }
                };
                self.progress.record(pcm.len());
                let fragment = AudioFragment { index: self.next_index, pcm };
                self.next_index += 1;
                Some(SpeechEvent::Delta { fragment, progress: self.progress })
            }
            RawSpeechEvent::Done {} => {
                self.progress.is_complete = true;
                Some(SpeechEvent::Done { progress: self.progress })
            }
        }
    }

    /// Transport ended without an `audio-done` record. With a descriptor in
    /// hand the stream is treated as complete; without one it is fatal.
    pub fn end_of_stream(&mut self) -> Result<SpeechEvent, ClientError> {
        if self.info.is_none() {
            return Err(ClientError::new(ClientErrorDescription::MissingAudioInfo));
        }
        self.progress.is_complete = true;
        Ok(SpeechEvent::Done { progress: self.progress })
    }
}

/// One live real-time synthesis stream: a finite, non-restartable sequence
/// of [`SpeechEvent`]s. Dropping the handle or calling [`abort`] cancels the
/// reader task and releases the connection; abort is idempotent.
///
/// [`abort`]: SpeechStream::abort
pub struct SpeechStream {
    events: mpsc::Receiver<Result<SpeechEvent, ClientError>>,
    cancel: CancellationToken,
}

impl SpeechStream {
    /// Open the stream. Fails fast on transport errors and non-2xx replies;
    /// once `Ok`, events arrive through [`next_event`].
    ///
    /// [`next_event`]: SpeechStream::next_event
    pub async fn open(client: &TtsClient, request: &SynthesisRequest) -> Result<Self, ClientError> {
        let response = client.speech_sse(request).await?;
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        tokio::spawn(run_speech_reader(response, tx, cancel.clone()));
        Ok(Self { events: rx, cancel })
    }

    /// `None` once the stream has delivered its terminal event or was aborted.
    pub async fn next_event(&mut self) -> Option<Result<SpeechEvent, ClientError>> {
        self.events.recv().await
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SpeechStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_speech_reader(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<SpeechEvent, ClientError>>,
    cancel: CancellationToken,
) {
    let mut decoder = SseFrameDecoder::new();
    let mut assembler = StreamAssembler::new();
    let mut body = response.bytes_stream();

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("speech stream aborted");
                return;
            }
            item = body.next() => item,
        };

        match item {
            Some(Ok(bytes)) => {
                for payload in decoder.push(&bytes) {
                    if let Some(event) = assembler.apply(&payload) {
                        let done = matches!(event, SpeechEvent::Done { .. });
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                        if done {
                            return;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                let _ = tx
                    .send(Err(ClientError::new(ClientErrorDescription::Transport(e.to_string()))))
                    .await;
                return;
            }
            None => break,
        }
    }

    for payload in decoder.finish() {
        if let Some(event) = assembler.apply(&payload) {
            let done = matches!(event, SpeechEvent::Done { .. });
            if tx.send(Ok(event)).await.is_err() || done {
                return;
            }
        }
    }

    let _ = tx.send(assembler.end_of_stream()).await;
}

/// Event from the raw chunked-audio path (`/audio/speech/stream/upload`).
#[derive(Debug, Clone)]
pub enum RawAudioEvent {
    Chunk { bytes: Vec<u8>, progress: StreamingProgress },
    Done { progress: StreamingProgress },
}

/// Progressive consumer for the raw byte-stream path. Same ownership and
/// cancellation rules as [`SpeechStream`].
pub struct RawAudioStream {
    events: mpsc::Receiver<Result<RawAudioEvent, ClientError>>,
    cancel: CancellationToken,
}

impl RawAudioStream {
    pub async fn open(client: &TtsClient, request: &SynthesisRequest) -> Result<Self, ClientError> {
        let response = client.speech_stream_upload(request).await?;
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        tokio::spawn(run_raw_reader(response, tx, cancel.clone()));
        Ok(Self { events: rx, cancel })
    }

    pub async fn next_event(&mut self) -> Option<Result<RawAudioEvent, ClientError>> {
        self.events.recv().await
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RawAudioStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_raw_reader(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<RawAudioEvent, ClientError>>,
    cancel: CancellationToken,
) {
    let mut progress = StreamingProgress::default();
    let mut body = response.bytes_stream();

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("raw audio stream aborted");
                return;
            }
            item = body.next() => item,
        };

        match item {
            Some(Ok(bytes)) => {
                if bytes.is_empty() {
                    continue;
                }
                progress.record(bytes.len());
                if tx
                    .send(Ok(RawAudioEvent::Chunk { bytes: bytes.to_vec(), progress }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Err(e)) => {
                let _ = tx
                    .send(Err(ClientError::new(ClientErrorDescription::Transport(e.to_string()))))
                    .await;
                return;
            }
            None => break,
        }
    }

    progress.is_complete = true;
    let _ = tx.send(Ok(RawAudioEvent::Done { progress })).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use base64::Engine as _;

    fn info_payload() -> String {
        r#"{"type":"speech.audio.info","sample_rate":24000,"channels":1,"bits_per_sample":16}"#.to_owned()
    }

    fn delta_payload(pcm: &[u8]) -> String {
        format!(
            r#"{{"type":"speech.audio.delta","audio":"{}"}}"#,
            base64::engine::general_purpose::STANDARD.encode(pcm)
        )
    }

    #[test]
    fn decoder_reassembles_split_lines() {
        let mut decoder = SseFrameDecoder::new();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let payloads = decoder.push(b":1}\ndata: {\"b\":2}\n");
        assert_eq!(payloads, vec![r#"{"a":1}"#.to_owned(), r#"{"b":2}"#.to_owned()]);
    }

    #[test]
    fn decoder_skips_non_data_lines() {
        let mut decoder = SseFrameDecoder::new();
        let payloads = decoder.push(b"event: ping\r\n: comment\n\ndata: {}\n");
        assert_eq!(payloads, vec!["{}".to_owned()]);
    }

    #[test]
    fn decoder_finish_drains_trailing_record() {
        let mut decoder = SseFrameDecoder::new();
        assert!(decoder.push(b"data: {\"tail\":true}").is_empty());
        assert_eq!(decoder.finish(), vec![r#"{"tail":true}"#.to_owned()]);
    }

    #[test]
    fn assembler_produces_typed_events_with_monotonic_progress() {
        let mut assembler = StreamAssembler::new();

        let Some(SpeechEvent::Info { info, progress }) = assembler.apply(&info_payload()) else {
            panic!("expected info event");
        };
        assert_eq!(info.sample_rate, 24000);
        assert_eq!(progress.chunks_received, 0);

        let mut last = progress;
        for (i, size) in [4000usize, 4000].iter().enumerate() {
            let Some(SpeechEvent::Delta { fragment, progress }) =
                assembler.apply(&delta_payload(&vec![0u8; *size]))
            else {
                panic!("expected delta event");
            };
            assert_eq!(fragment.index, i as u64);
            assert_eq!(fragment.pcm.len(), *size);
            assert!(progress.chunks_received > last.chunks_received);
            assert!(progress.total_bytes > last.total_bytes);
            last = progress;
        }

        let Some(SpeechEvent::Done { progress }) = assembler.apply(r#"{"type":"speech.audio.done"}"#)
        else {
            panic!("expected done event");
        };
        assert!(progress.is_complete);
        assert_eq!(progress.chunks_received, 2);
        assert_eq!(progress.total_bytes, 8000);
    }

    #[test]
    fn malformed_records_are_dropped_not_fatal() {
        let mut assembler = StreamAssembler::new();
        assembler.apply(&info_payload()).unwrap();

        assert!(assembler.apply("{oops").is_none());
        assert!(assembler.apply(r#"{"type":"unknown.event"}"#).is_none());
        assert!(assembler
            .apply(r#"{"type":"speech.audio.delta","audio":"!!not-base64!!"}"#)
            .is_none());

        // the stream keeps going afterwards
        assert!(assembler.apply(&delta_payload(&[0u8; 10])).is_some());
    }

    #[test]
    fn delta_before_descriptor_is_dropped() {
        let mut assembler = StreamAssembler::new();
        assert!(assembler.apply(&delta_payload(&[0u8; 10])).is_none());
        assert!(assembler.apply(&info_payload()).is_some());
    }

    #[test]
    fn duplicate_descriptor_is_ignored() {
        let mut assembler = StreamAssembler::new();
        assert!(assembler.apply(&info_payload()).is_some());
        assert!(assembler.apply(&info_payload()).is_none());
    }

    #[test]
    fn end_without_descriptor_is_fatal() {
        let mut assembler = StreamAssembler::new();
        assert!(assembler.end_of_stream().is_err());
    }

    #[test]
    fn end_after_descriptor_completes_the_stream() {
        let mut assembler = StreamAssembler::new();
        assembler.apply(&info_payload()).unwrap();
        assembler.apply(&delta_payload(&[0u8; 100])).unwrap();

        let SpeechEvent::Done { progress } = assembler.end_of_stream().unwrap() else {
            panic!("expected done event");
        };
        assert!(progress.is_complete);
        assert_eq!(progress.total_bytes, 100);
    }
}
