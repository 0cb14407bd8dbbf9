
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chatterbox_tts_client::{
    AudioPlayer, JobManager, KvStore, ProcessingMode, RawAudioEvent, RawAudioStream, Settings,
    SpeechEvent, SpeechStream, SynthesisRequest, TrackedJobs, TtsClient, ChunkStrategy,
    StreamingQuality, DEFAULT_BASE_URL,
};
use chatterbox_tts_client::wav::WavBuilder;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(about = "Streaming client for a Chatterbox TTS backend", long_about = None, version)]
struct Cli {
    /// Base URL of the synthesis backend
    #[arg(long, global = true, default_value = DEFAULT_BASE_URL)]
    api_base_url: String,

    #[command(subcommand)]
    subcommand: Command,
}

#[derive(Debug, Args)]
struct SynthesisArgs {
    /// Voice to synthesize with
    #[arg(long)]
    voice: Option<String>,

    /// Emotion exaggeration, 0.0 to 2.0
    #[arg(long)]
    exaggeration: Option<f32>,

    /// Classifier-free guidance weight
    #[arg(long)]
    cfg_weight: Option<f32>,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Streaming chunk size in characters
    #[arg(long)]
    chunk_size: Option<u32>,

    /// Text segmentation strategy
    #[arg(long, value_enum)]
    strategy: Option<ChunkStrategy>,

    /// Streaming quality preset
    #[arg(long, value_enum)]
    quality: Option<StreamingQuality>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reads text from stdin and plays it through the default output device
    Speak {
        #[command(flatten)]
        synthesis: SynthesisArgs,

        /// Processing mode override (defaults to the saved preference)
        #[arg(long, value_enum)]
        mode: Option<ProcessingMode>,

        /// Also write the finished WAV here
        #[arg(long)]
        output: Option<std::path::PathBuf>,
    },

    /// Reads text from stdin and writes the finished WAV to stdout
    Synth {
        #[command(flatten)]
        synthesis: SynthesisArgs,

        /// Consume the raw chunked byte stream instead of the event stream
        #[arg(long, conflicts_with = "one_shot")]
        raw: bool,

        /// Request the whole file in one response, no streaming
        #[arg(long)]
        one_shot: bool,
    },

    /// Submits a long-text job from stdin and prints its id
    Submit {
        #[command(flatten)]
        synthesis: SynthesisArgs,
    },

    /// Lists jobs that are still active on the server
    Jobs {
        /// JSON output
        #[arg(long)]
        json: bool,

        /// Maximum number of jobs to fetch
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Polls one job's status
    Status {
        job_id: String,

        /// JSON output
        #[arg(long)]
        json: bool,
    },

    /// Attaches to a running job and plays chunks as they become ready
    Monitor {
        job_id: String,
    },

    /// Resumes monitoring of tracked jobs after a restart
    Resume,

    /// Pauses a running job
    Pause {
        job_id: String,
    },

    /// Resumes a paused job
    ResumeJob {
        job_id: String,
    },

    /// Cancels a job and discards its local state
    Cancel {
        job_id: String,
    },

    /// Saves the processing-mode preference
    SetMode {
        #[arg(value_enum)]
        mode: ProcessingMode,
    },

    /// Saves the streaming-enabled preference
    SetStreaming {
        #[arg(value_parser = clap::value_parser!(bool))]
        enabled: bool,
    },

    /// Prints the saved preferences
    ShowSettings,
}

fn read_stdin_text() -> anyhow::Result<String> {
    let mut text = String::new();
    let _ = std::io::stdin().read_to_string(&mut text)?;
    Ok(text)
}

impl SynthesisArgs {
    /// Saved advanced settings first, explicit flags on top.
    fn into_request(self, settings: &Settings, input: String) -> SynthesisRequest {
        let mut request = settings.request_for(input);
        if self.voice.is_some() {
            request.voice = self.voice;
        }
        if self.exaggeration.is_some() {
            request.exaggeration = self.exaggeration;
        }
        if self.cfg_weight.is_some() {
            request.cfg_weight = self.cfg_weight;
        }
        if self.temperature.is_some() {
            request.temperature = self.temperature;
        }
        if self.chunk_size.is_some() {
            request.streaming_chunk_size = self.chunk_size;
        }
        if self.strategy.is_some() {
            request.streaming_strategy = self.strategy;
        }
        if self.quality.is_some() {
            request.streaming_quality = self.quality;
        }
        request
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();

    let store = KvStore::open_default();
    let settings = Settings::new(store.clone());
    let tracker = TrackedJobs::new(store);
    let client = TtsClient::new(args.api_base_url)?;

    match args.subcommand {
        Command::Speak { synthesis, mode, output } => {
            let text = read_stdin_text()?;
            let request = synthesis.into_request(&settings, text);

            let mode = mode.unwrap_or_else(|| settings.processing_mode());
            if mode.use_long_text(&request.input) {
                log::info!("Routing to the long-text path ({} characters)", request.input.chars().count());
                speak_long_text(&client, &tracker, &request, output.as_deref()).await?;
            } else {
                speak_streaming(&client, &request, output.as_deref()).await?;
            }
        }

        Command::Synth { synthesis, raw, one_shot } => {
            let text = read_stdin_text()?;
            let request = synthesis.into_request(&settings, text);

            if one_shot {
                let audio = client.speech(&request).await?;
                std::io::stdout().write_all(&audio)?;
            } else if raw {
                // the raw path delivers a WAV byte stream; concatenation of
                // the chunks is the finished file
                let mut stream = RawAudioStream::open(&client, &request).await?;
                let mut out = std::io::stdout();
                while let Some(event) = stream.next_event().await {
                    match event? {
                        RawAudioEvent::Chunk { bytes, .. } => out.write_all(&bytes)?,
                        RawAudioEvent::Done { progress } => {
                            log::info!(
                                "Stream complete: {} chunks, {} bytes",
                                progress.chunks_received,
                                progress.total_bytes
                            );
                            break;
                        }
                    }
                }
            } else {
                let mut stream = SpeechStream::open(&client, &request).await?;
                let mut builder = WavBuilder::new();
                while let Some(event) = stream.next_event().await {
                    match event? {
                        SpeechEvent::Info { info, .. } => builder.set_info(info),
                        SpeechEvent::Delta { fragment, .. } => builder.push(fragment.pcm),
                        SpeechEvent::Done { progress } => {
                            log::info!(
                                "Stream complete: {} chunks, {} bytes",
                                progress.chunks_received,
                                progress.total_bytes
                            );
                            break;
                        }
                    }
                }
                std::io::stdout().write_all(builder.finish()?.as_slice())?;
            }
        }

        Command::Submit { synthesis } => {
            let text = read_stdin_text()?;
            let request = synthesis.into_request(&settings, text);

            let manager = job_manager_without_audio(&client, &tracker);
            let job_id = manager.submit(&request).await?;
            manager.stop_monitoring();
            println!("{}", job_id);
        }

        Command::Jobs { json, limit } => {
            let manager = job_manager_without_audio(&client, &tracker);
            let jobs = manager.active_jobs(limit).await?;

            if json {
                let items: Vec<_> = jobs
                    .iter()
                    .map(|job| serde_json::json!({ "job_id": job.job_id, "status": job.status }))
                    .collect();
                let mut json = serde_json::to_string_pretty(&items)?;
                json.push('\n');
                std::io::stdout().write_all(json.as_bytes())?;
            } else {
                println!("JOB_ID\tSTATUS");
                for job in jobs {
                    println!("{}\t{}", job.job_id, job.status.message());
                }
            }
        }

        Command::Status { job_id, json } => {
            let manager = job_manager_without_audio(&client, &tracker);
            let response = manager.refresh_status(&job_id).await?;

            if json {
                let value = serde_json::json!({
                    "job_id": response.job.id,
                    "status": response.job.status,
                    "error": response.job.error,
                    "progress": response.progress,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("{}: {}", response.job.id, response.job.status.message());
                if let Some(progress) = &response.progress {
                    println!("{}/{} chunks", progress.processed_chunks, progress.total_chunks);
                }
                if let Some(error) = &response.job.error {
                    println!("error: {}", error);
                }
            }
        }

        Command::Monitor { job_id } => {
            let player = AudioPlayer::new()?;
            let manager = JobManager::new(client.clone(), tracker, Arc::new(player.clone()));

            manager.refresh_status(&job_id).await?;
            if !manager.state().is_job_active {
                log::info!("Job {} is no longer active", job_id);
                return Ok(());
            }

            manager.start_monitoring(&job_id);
            wait_for_job(&manager).await?;
            log::info!("Waiting for audio to finish...");
            player.wait_until_idle().await;
        }

        Command::Resume => {
            let player = AudioPlayer::new()?;
            let manager = JobManager::new(client.clone(), tracker, Arc::new(player.clone()));

            match manager.resume_tracked().await? {
                Some(job_id) => {
                    log::info!("Resumed monitoring of job {}", job_id);
                    wait_for_job(&manager).await?;
                    player.wait_until_idle().await;
                }
                None => {
                    log::info!("No tracked job is active");
                }
            }
        }

        Command::Pause { job_id } => {
            job_manager_without_audio(&client, &tracker).pause(&job_id).await?;
            log::info!("Paused job {}", job_id);
        }

        Command::ResumeJob { job_id } => {
            job_manager_without_audio(&client, &tracker).resume(&job_id).await?;
            log::info!("Resumed job {}", job_id);
        }

        Command::Cancel { job_id } => {
            job_manager_without_audio(&client, &tracker).cancel(&job_id).await?;
            log::info!("Cancelled job {}", job_id);
        }

        Command::SetMode { mode } => {
            settings.set_processing_mode(mode);
            log::info!("Processing mode saved");
        }

        Command::SetStreaming { enabled } => {
            settings.set_streaming_enabled(enabled);
            log::info!("Streaming preference saved");
        }

        Command::ShowSettings => {
            let advanced = settings.advanced();
            println!("processing mode: {:?}", settings.processing_mode());
            println!("streaming enabled: {}", settings.streaming_enabled());
            println!("exaggeration: {}", advanced.exaggeration);
            println!("cfg weight: {}", advanced.cfg_weight);
            println!("temperature: {}", advanced.temperature);
            println!("chunk size: {:?}", advanced.streaming_chunk_size);
            println!("strategy: {:?}", advanced.streaming_strategy);
            println!("quality: {:?}", advanced.streaming_quality);
        }
    }

    Ok(())
}

/// Managers for control-only commands get a sink that swallows audio.
fn job_manager_without_audio(client: &TtsClient, tracker: &TrackedJobs) -> JobManager {
    struct NullSink;

    impl chatterbox_tts_client::AudioSink for NullSink {
        fn play_pcm(
            &self,
            _pcm: &[u8],
            _info: &chatterbox_tts_client::AudioInfo,
        ) -> Result<(), chatterbox_tts_client::ClientError> {
            Ok(())
        }

        fn clear(&self) {}
    }

    JobManager::new(client.clone(), tracker.clone(), Arc::new(NullSink))
}

async fn speak_streaming(
    client: &TtsClient,
    request: &SynthesisRequest,
    output: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let player = AudioPlayer::new()?;
    let mut stream = SpeechStream::open(client, request).await?;
    let mut builder = WavBuilder::new();
    let mut current_info = None;

    while let Some(event) = stream.next_event().await {
        match event? {
            SpeechEvent::Info { info, .. } => {
                log::info!("Audio: {} Hz, {} channel(s), {} bit", info.sample_rate, info.channels, info.bits_per_sample);
                current_info = Some(info);
                builder.set_info(info);
            }
            SpeechEvent::Delta { fragment, progress } => {
                log::debug!("Chunk {}: {} bytes total", fragment.index, progress.total_bytes);
                if let Some(info) = &current_info {
                    if let Err(e) = player.play_fragment(&fragment, info) {
                        log::warn!("Failed to play chunk {}: {}", fragment.index, e);
                    }
                }
                builder.push(fragment.pcm);
            }
            SpeechEvent::Done { progress } => {
                log::info!(
                    "Stream complete: {} chunks, {} bytes",
                    progress.chunks_received,
                    progress.total_bytes
                );
                break;
            }
        }
    }

    log::info!("Waiting for audio to finish...");
    player.wait_until_idle().await;
    log::debug!("Chunks played: {}", player.chunks_played());

    if let Some(path) = output {
        std::fs::write(path, builder.finish()?)?;
        log::info!("Wrote {}", path.display());
    }

    Ok(())
}

async fn speak_long_text(
    client: &TtsClient,
    tracker: &TrackedJobs,
    request: &SynthesisRequest,
    output: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let player = AudioPlayer::new()?;
    let manager = JobManager::new(client.clone(), tracker.clone(), Arc::new(player.clone()));

    let job_id = manager.submit(request).await?;
    log::info!("Submitted long-text job {}", job_id);
    log::info!(
        "Estimated processing time: about {} seconds",
        chatterbox_tts_client::jobs::estimate_processing_seconds(request.input.chars().count())
    );

    wait_for_job(&manager).await?;

    // Nothing streamed locally (the job may have finished between submit
    // and subscribe): play the downloaded artifact instead.
    if manager.streamed_wav().is_none() {
        if let Some(audio) = manager.state().audio {
            if let Err(e) = player.play_wav(&audio) {
                log::warn!("Failed to play downloaded audio: {}", e);
            }
        }
    }

    log::info!("Waiting for audio to finish...");
    player.wait_until_idle().await;
    log::debug!("Chunks played: {}", player.chunks_played());

    if let Some(path) = output {
        let state = manager.state();
        let wav = match state.audio {
            Some(audio) => audio,
            None => manager
                .streamed_wav()
                .ok_or_else(|| anyhow::anyhow!("no audio was produced for job {}", job_id))?,
        };
        std::fs::write(path, wav)?;
        log::info!("Wrote {}", path.display());
    }

    Ok(())
}

/// Poll the manager until its job reaches a terminal state or errors out.
async fn wait_for_job(manager: &JobManager) -> anyhow::Result<()> {
    let mut reported_paused = false;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let state = manager.state();

        if let Some(error) = state.error {
            anyhow::bail!("{}", error);
        }
        if let Some(status) = state.status {
            if status.is_terminal() {
                log::info!("Job finished: {}", status.message());
                return Ok(());
            }
            if status == chatterbox_tts_client::JobStatus::Paused && !reported_paused {
                log::info!("Job is paused; waiting for it to resume");
                reported_paused = true;
            }
        }
    }
}
