
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::ClientError;
use crate::api::TtsClient;
use crate::playback::{AudioSink, FragmentSequencer};
use crate::stream::SseFrameDecoder;
use crate::track::TrackedJobs;
use crate::types::{JobEvent, JobListItem, JobProgress, JobStatusResponse, JobStatus, SynthesisRequest};
use crate::wav::{self, WavBuilder};

/// Seconds of processing to expect per server-side text chunk.
const ESTIMATED_SECONDS_PER_CHUNK: u64 = 10;
/// Chunk granularity the backend splits long text into.
const SERVER_CHUNK_CHARS: usize = 2500;

pub fn estimate_processing_seconds(text_len: usize) -> u64 {
    let chunks = text_len.div_ceil(SERVER_CHUNK_CHARS).max(1) as u64;
    chunks * ESTIMATED_SECONDS_PER_CHUNK
}

/// Snapshot of the manager's observable state. Every error path lands in
/// `error` as one human-readable line.
#[derive(Debug, Clone, Default)]
pub struct JobState {
    pub current_job_id: Option<String>,
    pub status: Option<JobStatus>,
    pub progress: Option<JobProgress>,
    pub is_job_active: bool,
    pub is_streaming: bool,
    pub error: Option<String>,
    pub audio: Option<Vec<u8>>,
}

/// What the monitor loop must do after an event has been folded into state.
#[derive(Debug, PartialEq)]
pub(crate) enum EventAction {
    None,
    FetchChunk { index: u64, url: String },
    Completed,
    Failed,
}

/// Folds one subscription event into the state. Pure; the side-effectful
/// part of each transition is returned as an [`EventAction`].
pub(crate) fn apply_event(state: &mut JobState, event: &JobEvent) -> EventAction {
    if let Some(progress) = &event.data.progress {
        state.progress = Some(progress.clone());
    }

    match event.event_type.as_str() {
        "chunk_ready" => {
            state.is_streaming = true;
            match (event.data.chunk_index, &event.data.chunk_url) {
                (Some(index), Some(url)) => EventAction::FetchChunk { index, url: url.clone() },
                _ => {
                    log::warn!("chunk_ready event without index/url; skipping");
                    EventAction::None
                }
            }
        }
        "completed" | "job_completed" => {
            state.status = Some(JobStatus::Completed);
            state.is_job_active = false;
            state.is_streaming = false;
            EventAction::Completed
        }
        "error" | "job_failed" => {
            state.status = Some(JobStatus::Failed);
            state.is_job_active = false;
            state.is_streaming = false;
            state.error = Some(
                event
                    .data
                    .error
                    .clone()
                    .or_else(|| event.data.message.clone())
                    .unwrap_or_else(|| "Job failed".to_owned()),
            );
            EventAction::Failed
        }
        "job_paused" => {
            // paused jobs stay tracked; they can be resumed
            state.status = Some(JobStatus::Paused);
            state.is_streaming = false;
            EventAction::None
        }
        "job_resumed" => {
            state.status = Some(JobStatus::Processing);
            state.error = None;
            state.is_streaming = true;
            EventAction::None
        }
        "progress" | "chunk_completed" => EventAction::None,
        other => {
            log::debug!("unhandled job event type: {}", other);
            EventAction::None
        }
    }
}

/// Decode one fetched chunk and hand every fragment that is now in
/// sequence to the playback sink and the container accumulator.
pub(crate) fn ingest_chunk(
    sink: &dyn AudioSink,
    sequencer: &mut FragmentSequencer,
    parts: &mut WavBuilder,
    index: u64,
    wav_bytes: &[u8],
) -> Result<(), ClientError> {
    let (info, pcm) = wav::decode(wav_bytes)?;
    parts.set_info(info);

    let released = sequencer.push(crate::types::AudioFragment { index, pcm });
    for fragment in released {
        if let Err(e) = sink.play_pcm(&fragment.pcm, &info) {
            // one bad fragment never takes the job down
            log::warn!("playback of chunk {} failed: {}", fragment.index, e);
        }
        parts.insert(fragment.index, fragment.pcm);
    }
    Ok(())
}

/// Write off a chunk that could not be fetched or decoded, releasing any
/// later arrivals it was blocking.
pub(crate) fn ingest_failure(
    sink: &dyn AudioSink,
    sequencer: &mut FragmentSequencer,
    parts: &mut WavBuilder,
    index: u64,
) {
    let info = parts.info();
    for fragment in sequencer.skip(index) {
        if let Some(info) = info {
            if let Err(e) = sink.play_pcm(&fragment.pcm, &info) {
                log::warn!("playback of chunk {} failed: {}", fragment.index, e);
            }
        }
        parts.insert(fragment.index, fragment.pcm);
    }
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Owns the lifecycle of long-text jobs: submit, subscribe, control,
/// fallback polling and resume-after-restart. At most one live event
/// subscription exists at a time; starting a new one tears down the old.
pub struct JobManager {
    client: TtsClient,
    tracker: TrackedJobs,
    sink: Arc<dyn AudioSink>,
    state: Arc<Mutex<JobState>>,
    parts: Arc<Mutex<WavBuilder>>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl JobManager {
    pub fn new(client: TtsClient, tracker: TrackedJobs, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            client,
            tracker,
            sink,
            state: Arc::new(Mutex::new(JobState::default())),
            parts: Arc::new(Mutex::new(WavBuilder::new())),
            monitor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> JobState {
        self.state.lock().clone()
    }

    pub fn tracked_job_ids(&self) -> Vec<String> {
        self.tracker.load()
    }

    /// The container built from fragments streamed so far, if any arrived.
    pub fn streamed_wav(&self) -> Option<Vec<u8>> {
        let parts = self.parts.lock();
        if parts.is_empty() {
            return None;
        }
        parts.finish().ok()
    }

    /// Submit a long-text job and begin monitoring it. The returned id is
    /// already in the tracked set.
    pub async fn submit(&self, request: &SynthesisRequest) -> Result<String, ClientError> {
        {
            let mut state = self.state.lock();
            *state = JobState::default();
        }
        self.parts.lock().clear();

        match self.client.submit_job(request).await {
            Ok(response) => {
                self.tracker.add(&response.job_id);
                {
                    let mut state = self.state.lock();
                    state.current_job_id = Some(response.job_id.clone());
                    state.status = Some(JobStatus::Pending);
                    state.error = None;
                    state.is_job_active = true;
                }
                self.start_monitoring(&response.job_id);
                Ok(response.job_id)
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.error = Some(e.user_message());
                state.is_job_active = false;
                Err(e)
            }
        }
    }

    /// Subscribe to a job's event stream, replacing any previous
    /// subscription for this manager.
    pub fn start_monitoring(&self, job_id: &str) {
        self.stop_monitoring();

        let cancel = CancellationToken::new();
        let ctx = MonitorCtx {
            client: self.client.clone(),
            tracker: self.tracker.clone(),
            sink: self.sink.clone(),
            state: self.state.clone(),
            parts: self.parts.clone(),
            sequencer: Arc::new(Mutex::new(FragmentSequencer::new())),
            cancel: cancel.clone(),
            job_id: job_id.to_owned(),
        };
        let task = tokio::spawn(run_monitor(ctx));
        *self.monitor.lock() = Some(MonitorHandle { cancel, task });
    }

    /// Idempotent: safe to call twice or after natural completion.
    pub fn stop_monitoring(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.cancel.cancel();
            handle.task.abort();
        }
    }

    pub async fn pause(&self, job_id: &str) -> Result<(), ClientError> {
        if let Err(e) = self.client.pause_job(job_id).await {
            self.state.lock().error = Some(e.user_message());
            return Err(e);
        }
        Ok(())
    }

    pub async fn resume(&self, job_id: &str) -> Result<(), ClientError> {
        if let Err(e) = self.client.resume_job(job_id).await {
            self.state.lock().error = Some(e.user_message());
            return Err(e);
        }
        Ok(())
    }

    /// Cancel tears down the subscription and clears all in-memory job,
    /// progress and audio state in addition to the server-side request.
    pub async fn cancel(&self, job_id: &str) -> Result<(), ClientError> {
        match self.client.cancel_job(job_id).await {
            Ok(()) => {
                self.tracker.remove(job_id);
                self.stop_monitoring();
                *self.state.lock() = JobState::default();
                self.parts.lock().clear();
                self.sink.clear();
                Ok(())
            }
            Err(e) => {
                self.state.lock().error = Some(e.user_message());
                Err(e)
            }
        }
    }

    /// Fallback status poll for when the event subscription is unavailable.
    /// Downloads the finished audio exactly once, on the transition into
    /// `completed` while no artifact is held yet.
    pub async fn refresh_status(&self, job_id: &str) -> Result<JobStatusResponse, ClientError> {
        match self.client.job_status(job_id).await {
            Ok(response) => {
                let needs_download = {
                    let mut state = self.state.lock();
                    state.current_job_id = Some(response.job.id.clone());
                    state.status = Some(response.job.status);
                    state.progress = response
                        .progress
                        .clone()
                        .or_else(|| response.job.progress.clone());
                    state.is_job_active = response.job.status.is_active();
                    state.error = response.job.error.clone();
                    response.job.status == JobStatus::Completed && state.audio.is_none()
                };

                if response.job.status.is_terminal() {
                    self.tracker.remove(job_id);
                }
                if needs_download {
                    self.download_completed_audio(job_id).await;
                }
                Ok(response)
            }
            Err(e) => {
                self.state.lock().error = Some(e.user_message());
                Err(e)
            }
        }
    }

    /// Reconcile tracked jobs against the server after a restart. The
    /// server is the source of truth: if none of the tracked jobs is still
    /// active remotely, local activity state is cleared.
    pub async fn resume_tracked(&self) -> Result<Option<String>, ClientError> {
        let tracked = self.tracker.load();
        if tracked.is_empty() {
            return Ok(None);
        }

        let listing = self.client.list_jobs(10).await?;
        let active = listing
            .jobs
            .iter()
            .find(|job| tracked.contains(&job.job_id) && job.status.is_active());

        match active {
            Some(job) => {
                log::info!("resuming monitoring for active job {}", job.job_id);
                {
                    let mut state = self.state.lock();
                    state.current_job_id = Some(job.job_id.clone());
                    state.status = Some(job.status);
                    state.is_job_active = true;
                }
                self.start_monitoring(&job.job_id);
                Ok(Some(job.job_id.clone()))
            }
            None => {
                log::info!("no tracked job is active remotely; clearing local state");
                self.state.lock().is_job_active = false;
                Ok(None)
            }
        }
    }

    /// Listing filtered to active jobs. Pure projection; tracked-set
    /// membership is not touched.
    pub async fn active_jobs(&self, limit: u32) -> Result<Vec<JobListItem>, ClientError> {
        let listing = self.client.list_jobs(limit).await?;
        Ok(listing.jobs.into_iter().filter(|job| job.status.is_active()).collect())
    }

    async fn download_completed_audio(&self, job_id: &str) {
        match self.client.download_job_audio(job_id).await {
            Ok(bytes) => {
                self.state.lock().audio = Some(bytes);
            }
            Err(e) => {
                log::error!("failed to download completed audio: {}", e);
                self.state.lock().error = Some(format!("Failed to download audio: {}", e.user_message()));
            }
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

#[derive(Clone)]
struct MonitorCtx {
    client: TtsClient,
    tracker: TrackedJobs,
    sink: Arc<dyn AudioSink>,
    state: Arc<Mutex<JobState>>,
    parts: Arc<Mutex<WavBuilder>>,
    sequencer: Arc<Mutex<FragmentSequencer>>,
    cancel: CancellationToken,
    job_id: String,
}

async fn run_monitor(ctx: MonitorCtx) {
    let response = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        response = ctx.client.job_events(&ctx.job_id) => response,
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            log::error!("job event subscription failed: {}", e);
            ctx.state.lock().error = Some(format!("Connection error: {}", e.user_message()));
            return;
        }
    };

    let mut decoder = SseFrameDecoder::new();
    let mut body = response.bytes_stream();

    loop {
        let item = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                log::debug!("job monitor for {} aborted", ctx.job_id);
                return;
            }
            item = body.next() => item,
        };

        let bytes = match item {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                ctx.state.lock().error = Some(format!("Connection error: {}", e));
                return;
            }
            None => {
                // stream closed without a terminal event; ask the server
                // where the job actually ended up
                reconcile_after_stream_end(&ctx).await;
                return;
            }
        };

        for payload in decoder.push(&bytes) {
            let event: JobEvent = match serde_json::from_str(&payload) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("skipping malformed job event: {}", e);
                    continue;
                }
            };
            log::debug!("job {}: event {}", ctx.job_id, event.event_type);

            let action = apply_event(&mut ctx.state.lock(), &event);
            match action {
                EventAction::None => {}
                EventAction::FetchChunk { index, url } => {
                    spawn_chunk_fetch(ctx.clone(), index, url);
                }
                EventAction::Completed => {
                    ctx.tracker.remove(&ctx.job_id);
                    download_after_completion(&ctx).await;
                    return;
                }
                EventAction::Failed => {
                    ctx.tracker.remove(&ctx.job_id);
                    return;
                }
            }
        }
    }
}

/// Chunk fetches run concurrently and may complete out of order; the
/// shared sequencer restores ordinal order before playback.
fn spawn_chunk_fetch(ctx: MonitorCtx, index: u64, url: String) {
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = ctx.client.download_chunk(&url) => result,
        };
        if ctx.cancel.is_cancelled() {
            return;
        }

        let mut sequencer = ctx.sequencer.lock();
        let mut parts = ctx.parts.lock();
        match result {
            Ok(bytes) => {
                if let Err(e) = ingest_chunk(&*ctx.sink, &mut sequencer, &mut parts, index, &bytes) {
                    log::warn!("chunk {} unusable: {}", index, e);
                    ingest_failure(&*ctx.sink, &mut sequencer, &mut parts, index);
                }
            }
            Err(e) => {
                log::warn!("chunk {} download failed: {}", index, e);
                ingest_failure(&*ctx.sink, &mut sequencer, &mut parts, index);
            }
        }
    });
}

async fn reconcile_after_stream_end(ctx: &MonitorCtx) {
    match ctx.client.job_status(&ctx.job_id).await {
        Ok(response) => {
            let status = response.job.status;
            {
                let mut state = ctx.state.lock();
                state.status = Some(status);
                state.is_job_active = status.is_active();
                state.is_streaming = false;
                if let Some(progress) = response.progress.or(response.job.progress) {
                    state.progress = Some(progress);
                }
                if let Some(error) = response.job.error {
                    state.error = Some(error);
                }
            }
            if status.is_terminal() {
                ctx.tracker.remove(&ctx.job_id);
            }
            if status == JobStatus::Completed && ctx.state.lock().audio.is_none() {
                download_after_completion(ctx).await;
            }
        }
        Err(e) => {
            log::warn!("status reconciliation after stream end failed: {}", e);
        }
    }
}

async fn download_after_completion(ctx: &MonitorCtx) {
    match ctx.client.download_job_audio(&ctx.job_id).await {
        Ok(bytes) => {
            ctx.state.lock().audio = Some(bytes);
        }
        Err(e) => {
            log::error!("failed to download completed audio: {}", e);
            ctx.state.lock().error = Some(format!("Failed to download audio: {}", e.user_message()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioInfo, JobEventData};

    struct RecordingSink {
        played: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { played: Mutex::new(Vec::new()) }
        }
    }

    impl AudioSink for RecordingSink {
        fn play_pcm(&self, pcm: &[u8], _info: &AudioInfo) -> Result<(), ClientError> {
            self.played.lock().push(pcm.to_vec());
            Ok(())
        }

        fn clear(&self) {
            self.played.lock().clear();
        }
    }

    fn event(event_type: &str, data: JobEventData) -> JobEvent {
        JobEvent { event_type: event_type.to_owned(), data }
    }

    #[test]
    fn paused_then_resumed_leaves_error_clear() {
        let mut state = JobState::default();
        state.is_job_active = true;

        assert_eq!(apply_event(&mut state, &event("job_paused", JobEventData::default())), EventAction::None);
        assert!(state.error.is_none());
        assert!(!state.is_streaming);
        assert!(state.is_job_active);

        assert_eq!(apply_event(&mut state, &event("job_resumed", JobEventData::default())), EventAction::None);
        assert!(state.error.is_none());
        assert!(state.is_streaming);
    }

    #[test]
    fn resumed_clears_a_prior_error() {
        let mut state = JobState::default();
        state.error = Some("transient".to_owned());
        apply_event(&mut state, &event("job_resumed", JobEventData::default()));
        assert!(state.error.is_none());
    }

    #[test]
    fn failure_event_captures_server_message() {
        let mut state = JobState::default();
        state.is_job_active = true;
        let data = JobEventData { error: Some("out of memory".to_owned()), ..Default::default() };

        assert_eq!(apply_event(&mut state, &event("job_failed", data)), EventAction::Failed);
        assert_eq!(state.error.as_deref(), Some("out of memory"));
        assert!(!state.is_job_active);
        assert_eq!(state.status, Some(JobStatus::Failed));
    }

    #[test]
    fn completion_event_stops_activity() {
        let mut state = JobState::default();
        state.is_job_active = true;
        state.is_streaming = true;

        assert_eq!(apply_event(&mut state, &event("job_completed", JobEventData::default())), EventAction::Completed);
        assert!(!state.is_job_active);
        assert!(!state.is_streaming);
    }

    #[test]
    fn chunk_ready_requests_a_fetch() {
        let mut state = JobState::default();
        let data = JobEventData {
            chunk_index: Some(3),
            chunk_url: Some("/audio/speech/long/j1/chunks/3".to_owned()),
            ..Default::default()
        };

        let action = apply_event(&mut state, &event("chunk_ready", data));
        assert_eq!(
            action,
            EventAction::FetchChunk { index: 3, url: "/audio/speech/long/j1/chunks/3".to_owned() }
        );
        assert!(state.is_streaming);
    }

    #[test]
    fn progress_snapshot_is_taken_from_any_event() {
        let mut state = JobState::default();
        let data = JobEventData {
            progress: Some(JobProgress { processed_chunks: 4, total_chunks: 9, percent: 44.0 }),
            ..Default::default()
        };
        apply_event(&mut state, &event("chunk_completed", data));
        assert_eq!(state.progress.as_ref().unwrap().processed_chunks, 4);
    }

    #[test]
    fn out_of_order_chunks_play_in_ordinal_order() {
        let sink = RecordingSink::new();
        let mut sequencer = FragmentSequencer::new();
        let mut parts = WavBuilder::new();
        let info = AudioInfo { sample_rate: 24000, channels: 1, bits_per_sample: 16 };

        let first: Vec<u8> = (0i16..10).flat_map(|s| s.to_le_bytes()).collect();
        let second: Vec<u8> = (10i16..20).flat_map(|s| s.to_le_bytes()).collect();
        let wav_first = wav::assemble(&info, [first.clone()]);
        let wav_second = wav::assemble(&info, [second.clone()]);

        // ordinal 1 downloads before ordinal 0
        ingest_chunk(&sink, &mut sequencer, &mut parts, 1, &wav_second).unwrap();
        assert!(sink.played.lock().is_empty());

        ingest_chunk(&sink, &mut sequencer, &mut parts, 0, &wav_first).unwrap();
        let played = sink.played.lock();
        assert_eq!(played.len(), 2);
        assert_eq!(played[0], first);
        assert_eq!(played[1], second);

        let final_wav = parts.finish().unwrap();
        assert_eq!(&final_wav[44..64], &first[..]);
        assert_eq!(&final_wav[64..84], &second[..]);
    }

    #[test]
    fn failed_chunk_is_skipped_without_stalling() {
        let sink = RecordingSink::new();
        let mut sequencer = FragmentSequencer::new();
        let mut parts = WavBuilder::new();
        let info = AudioInfo { sample_rate: 24000, channels: 1, bits_per_sample: 16 };

        let late: Vec<u8> = (0i16..4).flat_map(|s| s.to_le_bytes()).collect();
        let wav_late = wav::assemble(&info, [late.clone()]);

        ingest_chunk(&sink, &mut sequencer, &mut parts, 1, &wav_late).unwrap();
        assert!(sink.played.lock().is_empty());

        // ordinal 0 never materializes
        ingest_failure(&sink, &mut sequencer, &mut parts, 0);
        assert_eq!(sink.played.lock().len(), 1);
    }

    #[test]
    fn undecodable_chunk_is_an_error() {
        let sink = RecordingSink::new();
        let mut sequencer = FragmentSequencer::new();
        let mut parts = WavBuilder::new();
        assert!(ingest_chunk(&sink, &mut sequencer, &mut parts, 0, b"not a wav").is_err());
    }

    #[test]
    fn processing_estimate_scales_with_chunks() {
        assert_eq!(estimate_processing_seconds(100), ESTIMATED_SECONDS_PER_CHUNK);
        assert_eq!(estimate_processing_seconds(5000), 2 * ESTIMATED_SECONDS_PER_CHUNK);
    }
}
