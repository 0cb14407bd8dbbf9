
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;

use rubato::{Resampler, SincFixedIn, SincInterpolationType, SincInterpolationParameters, WindowFunction};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample,
    Sample,
    StreamConfig,
};

use crate::{ClientError, ClientErrorDescription};
use crate::types::{AudioFragment, AudioInfo};

pub(crate) fn format_sample<O: FromSample<i16> + Sample>(sample: i16) -> O {
    O::from_sample(sample)
}

/// Target for decoded fragments. The job manager and stream drivers write
/// through this seam so tests can observe playback without a device.
pub trait AudioSink: Send + Sync {
    fn play_pcm(&self, pcm: &[u8], info: &AudioInfo) -> Result<(), ClientError>;
    fn clear(&self);
}

/// Reorders concurrently fetched fragments so only the next strictly
/// sequential ordinal is released downstream. Ahead-of-turn arrivals are
/// buffered; a failed ordinal is skipped so the sequence never stalls.
#[derive(Debug, Default)]
pub struct FragmentSequencer {
    next_index: u64,
    buffered: BTreeMap<u64, AudioFragment>,
    skipped: BTreeSet<u64>,
}

impl FragmentSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one arrival; returns the run of fragments now in order.
    pub fn push(&mut self, fragment: AudioFragment) -> Vec<AudioFragment> {
        if fragment.index < self.next_index || self.buffered.contains_key(&fragment.index) {
            log::warn!("dropping duplicate fragment {}", fragment.index);
            return Vec::new();
        }
        self.buffered.insert(fragment.index, fragment);
        self.advance()
    }

    /// Give up on an ordinal that failed to download or decode.
    pub fn skip(&mut self, index: u64) -> Vec<AudioFragment> {
        if index < self.next_index {
            return Vec::new();
        }
        self.buffered.remove(&index);
        self.skipped.insert(index);
        self.advance()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    fn advance(&mut self) -> Vec<AudioFragment> {
        let mut released = Vec::new();
        loop {
            if let Some(fragment) = self.buffered.remove(&self.next_index) {
                released.push(fragment);
                self.next_index += 1;
            } else if self.skipped.remove(&self.next_index) {
                self.next_index += 1;
            } else {
                break;
            }
        }
        released
    }
}

#[derive(Debug)]
struct CurrentChunk {
    buffer: Vec<i16>,
    pos: usize,
}

/// The queue proper: pending chunks in enqueue order plus at most one
/// chunk being rendered. A finished chunk's buffer is dropped the moment
/// its last sample leaves, before the next chunk starts.
#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Vec<i16>>,
    current: Option<CurrentChunk>,
    chunks_started: u64,
    chunks_finished: u64,
}

impl QueueState {
    fn enqueue(&mut self, samples: Vec<i16>) {
        self.pending.push_back(samples);
    }

    fn clear(&mut self) {
        self.pending.clear();
        if self.current.take().is_some() {
            self.chunks_finished += 1;
        }
    }

    /// Render into a device buffer, crossing chunk boundaries without gaps.
    /// Returns false once the queue has gone idle.
    fn fill_into<S: FromSample<i16> + Sample>(&mut self, buffer: &mut [S]) -> bool {
        let mut written = 0;
        while written < buffer.len() {
            if self.current.is_none() {
                match self.pending.pop_front() {
                    Some(chunk) => {
                        self.chunks_started += 1;
                        self.current = Some(CurrentChunk { buffer: chunk, pos: 0 });
                    }
                    None => break,
                }
            }

            let current = self.current.as_mut().unwrap();
            let take = (buffer.len() - written).min(current.buffer.len() - current.pos);
            for i in 0..take {
                buffer[written + i] = format_sample::<S>(current.buffer[current.pos + i]);
            }
            current.pos += take;
            written += take;

            if current.pos >= current.buffer.len() {
                self.current = None;
                self.chunks_finished += 1;
            }
        }

        for slot in buffer[written..].iter_mut() {
            *slot = format_sample::<S>(0);
        }

        self.current.is_some() || !self.pending.is_empty()
    }

    fn is_idle(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }
}

/// Serialized, back-to-back playback of decoded fragments on the default
/// output device. The device stream lives on its own thread and is torn
/// down when the last handle is dropped.
#[derive(Debug, Clone)]
pub struct AudioPlayer {
    state: Arc<Mutex<QueueState>>,
    sample_rate: u32,
    channel_count: u16,
    is_playing: Arc<AtomicBool>,
    _device: Arc<std::sync::mpsc::Sender<()>>,
}

impl AudioPlayer {
    pub fn new() -> Result<Self, ClientError> {
        let state: Arc<Mutex<QueueState>> = Arc::new(Mutex::new(QueueState::default()));
        let is_playing = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        // cpal streams are not Send; the stream is built and owned by a
        // dedicated thread and dropped when every player handle is gone.
        let thread_state = state.clone();
        let thread_playing = is_playing.clone();
        std::thread::spawn(move || {
            let stream = match build_output_stream(thread_state, thread_playing) {
                Ok((stream, config)) => {
                    let _ = ready_tx.send(Ok(config));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Wake on shutdown signal or on the last sender dropping.
            let _ = shutdown_rx.recv();
            drop(stream);
        });

        let (sample_rate, channel_count) = ready_rx
            .recv()
            .map_err(|_| ClientError::new(ClientErrorDescription::Playback("audio output thread died during startup".into())))??;

        Ok(Self {
            state,
            sample_rate,
            channel_count,
            is_playing,
            _device: Arc::new(shutdown_tx),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    /// Queue one fragment's PCM for playback after everything already
    /// queued. 16-bit little-endian input, resampled to the device rate.
    pub fn play_pcm(&self, pcm: &[u8], info: &AudioInfo) -> Result<(), ClientError> {
        if pcm.is_empty() {
            return Ok(());
        }
        if info.bits_per_sample != 16 {
            return Err(ClientError::new(ClientErrorDescription::Playback(format!(
                "unsupported bit depth: {}",
                info.bits_per_sample
            ))));
        }

        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if pcm.len() % 2 != 0 {
            log::warn!("dropping trailing odd byte of PCM fragment");
        }

        let device_samples = self.prepare(samples, info)?;
        if device_samples.is_empty() {
            return Ok(());
        }

        self.state.lock().enqueue(device_samples);
        self.is_playing.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub fn play_fragment(&self, fragment: &AudioFragment, info: &AudioInfo) -> Result<(), ClientError> {
        self.play_pcm(&fragment.pcm, info)
    }

    /// Queue a whole WAV file (chunk download or final artifact).
    pub fn play_wav(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let (info, pcm) = crate::wav::decode(bytes)?;
        self.play_pcm(&pcm, &info)
    }

    /// Drop everything queued and cut the current chunk short.
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().is_idle()
    }

    pub fn chunks_played(&self) -> u64 {
        self.state.lock().chunks_finished
    }

    /// Resolve once queued audio has drained. Polling matches the device
    /// callback granularity; a notification would still need the callback
    /// to fire one more time.
    pub async fn wait_until_idle(&self) {
        loop {
            if self.is_idle() && !self.is_playing.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    /// Downmix to mono, resample to the device rate and fan out to the
    /// device channel count.
    fn prepare(&self, samples: Vec<i16>, info: &AudioInfo) -> Result<Vec<i16>, ClientError> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let mono: Vec<f64> = samples
            .chunks(info.channels.max(1) as usize)
            .map(|frame| {
                let sum: f64 = frame.iter().map(|&s| format_sample::<f64>(s)).sum();
                sum / frame.len() as f64
            })
            .collect();

        let ratio = self.sample_rate as f64 / info.sample_rate as f64;
        let resampled = resample_mono(mono, ratio)?;

        Ok(resampled
            .iter()
            .flat_map(|&sample| {
                std::iter::repeat(<i16 as Sample>::from_sample(sample)).take(self.channel_count as usize)
            })
            .collect())
    }
}

impl AudioSink for AudioPlayer {
    fn play_pcm(&self, pcm: &[u8], info: &AudioInfo) -> Result<(), ClientError> {
        AudioPlayer::play_pcm(self, pcm, info)
    }

    fn clear(&self) {
        AudioPlayer::clear(self)
    }
}

fn build_output_stream(
    state: Arc<Mutex<QueueState>>,
    is_playing: Arc<AtomicBool>,
) -> Result<(cpal::Stream, (u32, u16)), ClientError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| ClientError::new(ClientErrorDescription::Playback("no default output device".into())))?;
    let mut supported_configs_range = device
        .supported_output_configs()
        .map_err(|e| ClientError::new(ClientErrorDescription::Playback(e.to_string())))?;
    let supported_config = supported_configs_range
        .next()
        .ok_or_else(|| ClientError::new(ClientErrorDescription::Playback("no supported audio config".into())))?
        .with_max_sample_rate();
    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();

    let err_fn = |err| log::error!("an error occurred on the output audio stream: {}", err);

    macro_rules! build {
        ($t:ty) => {{
            let state = state.clone();
            let is_playing = is_playing.clone();
            device.build_output_stream(
                &config,
                move |data: &mut [$t], _: &cpal::OutputCallbackInfo| {
                    let still_playing = state.lock().fill_into(data);
                    is_playing.store(still_playing, Ordering::Relaxed);
                },
                err_fn,
                None,
            )
        }};
    }

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build!(f32),
        cpal::SampleFormat::F64 => build!(f64),
        cpal::SampleFormat::I8 => build!(i8),
        cpal::SampleFormat::U8 => build!(u8),
        cpal::SampleFormat::I16 => build!(i16),
        cpal::SampleFormat::U16 => build!(u16),
        cpal::SampleFormat::I32 => build!(i32),
        cpal::SampleFormat::U32 => build!(u32),
        cpal::SampleFormat::I64 => build!(i64),
        cpal::SampleFormat::U64 => build!(u64),
        _ => {
            return Err(ClientError::new(ClientErrorDescription::Playback(
                "unsupported sample format".into(),
            )));
        }
    }
    .map_err(|e| ClientError::new(ClientErrorDescription::Playback(e.to_string())))?;

    stream
        .play()
        .map_err(|e| ClientError::new(ClientErrorDescription::Playback(e.to_string())))?;

    Ok((stream, (config.sample_rate.0, config.channels)))
}

fn resample_mono(samples: Vec<f64>, ratio: f64) -> Result<Vec<f64>, ClientError> {
    if (ratio - 1.0).abs() < 1e-9 {
        return Ok(samples);
    }

    let playback_err = |e: &dyn std::fmt::Display| {
        ClientError::new(ClientErrorDescription::Playback(format!("resampling failed: {}", e)))
    };

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let input_chunk_size = samples.len().min(1024);

    let mut resampler = SincFixedIn::<f64>::new(ratio, 2.0, params, input_chunk_size, 1)
        .map_err(|e| playback_err(&e))?;

    let new_length = (samples.len() as f64 * ratio) as usize;
    let output_delay = resampler.output_delay();
    let mut output_buffer: Vec<f64> = Vec::with_capacity(new_length + output_delay);

    let mut input_buffer = vec![vec![0.0f64; input_chunk_size]];
    let mut output_frames = vec![vec![0.0f64; resampler.output_frames_max()]];
    let mut input_index = 0;

    loop {
        let frames = resampler.input_frames_next();
        let remaining = samples.len() - input_index;
        if frames > remaining {
            break;
        }

        input_buffer[0].clear();
        input_buffer[0].extend_from_slice(&samples[input_index..input_index + frames]);

        let (_, output_count) = resampler
            .process_into_buffer(&input_buffer, &mut output_frames, None)
            .map_err(|e| playback_err(&e))?;
        output_buffer.extend_from_slice(&output_frames[0][..output_count]);

        input_index += frames;
    }

    let frames = resampler.input_frames_next();
    let remaining = samples.len() - input_index;
    if remaining > 0 {
        input_buffer[0].clear();
        input_buffer[0].extend_from_slice(&samples[input_index..]);
        input_buffer[0].resize(frames, 0.0);

        let (_, output_count) = resampler
            .process_into_buffer(&input_buffer, &mut output_frames, None)
            .map_err(|e| playback_err(&e))?;
        output_buffer.extend_from_slice(&output_frames[0][..output_count]);
    }

    while output_buffer.len() < new_length + output_delay {
        let (_, output_count) = resampler
            .process_partial_into_buffer(None::<&[Vec<f64>]>, &mut output_frames, None)
            .map_err(|e| playback_err(&e))?;
        output_buffer.extend_from_slice(&output_frames[0][..output_count]);
    }

    output_buffer.drain(..output_delay);
    output_buffer.truncate(new_length);
    Ok(output_buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(index: u64, len: usize) -> AudioFragment {
        AudioFragment { index, pcm: vec![index as u8; len] }
    }

    #[test]
    fn sequencer_releases_in_ordinal_order() {
        let mut sequencer = FragmentSequencer::new();

        assert!(sequencer.push(fragment(2, 4)).is_empty());
        assert!(sequencer.push(fragment(1, 4)).is_empty());
        assert_eq!(sequencer.buffered_len(), 2);

        let released = sequencer.push(fragment(0, 4));
        let indices: Vec<u64> = released.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(sequencer.next_index(), 3);
        assert_eq!(sequencer.buffered_len(), 0);
    }

    #[test]
    fn sequencer_skip_unblocks_later_arrivals() {
        let mut sequencer = FragmentSequencer::new();

        let released = sequencer.push(fragment(0, 4));
        assert_eq!(released.len(), 1);

        assert!(sequencer.push(fragment(2, 4)).is_empty());
        let released = sequencer.skip(1);
        let indices: Vec<u64> = released.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![2]);
        assert_eq!(sequencer.next_index(), 3);
    }

    #[test]
    fn sequencer_drops_duplicates_and_stale_indices() {
        let mut sequencer = FragmentSequencer::new();
        sequencer.push(fragment(0, 4));
        assert!(sequencer.push(fragment(0, 4)).is_empty());
        assert_eq!(sequencer.next_index(), 1);

        sequencer.push(fragment(2, 4));
        assert!(sequencer.push(fragment(2, 8)).is_empty());
        assert_eq!(sequencer.buffered_len(), 1);
    }

    #[test]
    fn queue_plays_chunks_back_to_back_in_enqueue_order() {
        let mut state = QueueState::default();
        state.enqueue(vec![1; 5]);
        state.enqueue(vec![2; 3]);
        state.enqueue(vec![3; 4]);

        let mut heard: Vec<i16> = Vec::new();
        let mut buffer = [0i16; 4];
        while state.fill_into(&mut buffer) {
            heard.extend_from_slice(&buffer);
        }
        heard.extend_from_slice(&buffer);
        let trimmed: Vec<i16> = heard.into_iter().filter(|&s| s != 0).collect();

        // contiguous, ordered and gapless across chunk boundaries
        let expected: Vec<i16> = [vec![1i16; 5], vec![2; 3], vec![3; 4]].concat();
        assert_eq!(trimmed, expected);
        assert_eq!(state.chunks_started, 3);
        assert_eq!(state.chunks_finished, 3);
        assert!(state.is_idle());
    }

    #[test]
    fn queue_holds_at_most_one_current_chunk() {
        let mut state = QueueState::default();
        state.enqueue(vec![1; 10]);
        state.enqueue(vec![2; 10]);

        let mut buffer = [0i16; 4];
        state.fill_into(&mut buffer);

        // first chunk partially rendered: started but not finished, and the
        // second has not begun
        assert_eq!(state.chunks_started, 1);
        assert_eq!(state.chunks_finished, 0);
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn finished_chunk_buffer_is_released_before_next_starts() {
        let mut state = QueueState::default();
        state.enqueue(vec![1; 2]);
        state.enqueue(vec![2; 2]);

        let mut buffer = [0i16; 2];
        state.fill_into(&mut buffer);
        assert_eq!(state.chunks_finished, 1);
        assert!(state.current.is_none());

        state.fill_into(&mut buffer);
        assert_eq!(state.chunks_finished, 2);
        assert!(state.is_idle());
    }

    #[test]
    fn clear_drops_pending_and_current() {
        let mut state = QueueState::default();
        state.enqueue(vec![1; 10]);
        state.enqueue(vec![2; 10]);

        let mut buffer = [0i16; 4];
        state.fill_into(&mut buffer);
        state.clear();

        assert!(state.is_idle());
        let playing = state.fill_into(&mut buffer);
        assert!(!playing);
        assert!(buffer.iter().all(|&s| s == 0));
    }

    #[test]
    fn idle_queue_renders_silence() {
        let mut state = QueueState::default();
        let mut buffer = [7i16; 8];
        let playing = state.fill_into(&mut buffer);
        assert!(!playing);
        assert!(buffer.iter().all(|&s| s == 0));
    }

    #[test]
    fn resample_identity_ratio_is_passthrough() {
        let samples: Vec<f64> = (0..100).map(|i| i as f64 / 100.0).collect();
        let out = resample_mono(samples.clone(), 1.0).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn resample_doubles_length_at_ratio_two() {
        let samples = vec![0.5f64; 4800];
        let out = resample_mono(samples, 2.0).unwrap();
        assert_eq!(out.len(), 9600);
    }
}
