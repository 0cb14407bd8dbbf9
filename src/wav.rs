
use std::collections::BTreeMap;
use std::io::Cursor;

use crate::{ClientError, ClientErrorDescription};
use crate::types::AudioInfo;

pub const MIME_TYPE: &str = "audio/wav";

/// Frames raw PCM buffers into one RIFF/WAVE file, data in input order.
/// An empty chunk list yields a valid header with a zero-length data chunk.
pub fn assemble(info: &AudioInfo, chunks: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Vec<u8> {
    let chunks: Vec<_> = chunks.into_iter().collect();
    let data_len: usize = chunks.iter().map(|c| c.as_ref().len()).sum();

    let mut out = Vec::with_capacity(44 + data_len);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM format tag
    out.extend_from_slice(&info.channels.to_le_bytes());
    out.extend_from_slice(&info.sample_rate.to_le_bytes());
    out.extend_from_slice(&info.byte_rate().to_le_bytes());
    out.extend_from_slice(&info.block_align().to_le_bytes());
    out.extend_from_slice(&info.bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data_len as u32).to_le_bytes());
    for chunk in &chunks {
        out.extend_from_slice(chunk.as_ref());
    }
    out
}

/// Ordinal-keyed PCM accumulator for one stream or job. Fragments may be
/// inserted out of order; `finish` concatenates them by index.
#[derive(Debug, Default)]
pub struct WavBuilder {
    info: Option<AudioInfo>,
    chunks: BTreeMap<u64, Vec<u8>>,
}

impl WavBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_info(&mut self, info: AudioInfo) {
        if self.info.is_none() {
            self.info = Some(info);
        }
    }

    pub fn info(&self) -> Option<AudioInfo> {
        self.info
    }

    /// Append at the next unused ordinal (streams deliver in emission order).
    pub fn push(&mut self, pcm: Vec<u8>) {
        let index = self.chunks.keys().next_back().map(|i| i + 1).unwrap_or(0);
        self.chunks.insert(index, pcm);
    }

    pub fn insert(&mut self, index: u64, pcm: Vec<u8>) {
        self.chunks.insert(index, pcm);
    }

    pub fn data_len(&self) -> usize {
        self.chunks.values().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.info = None;
        self.chunks.clear();
    }

    pub fn finish(&self) -> Result<Vec<u8>, ClientError> {
        let info = self
            .info
            .ok_or(ClientError::new(ClientErrorDescription::MissingAudioInfo))?;
        Ok(assemble(&info, self.chunks.values()))
    }
}

/// Unpacks a fetched WAV chunk into its descriptor and little-endian PCM
/// bytes. Only 16-bit integer PCM is accepted, matching what the backend
/// emits for chunk downloads.
pub fn decode(bytes: &[u8]) -> Result<(AudioInfo, Vec<u8>), ClientError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| ClientError::new(ClientErrorDescription::ChunkDecode(e.to_string())))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(ClientError::new(ClientErrorDescription::ChunkDecode(format!(
            "unsupported sample format: {:?} / {}",
            spec.sample_format, spec.bits_per_sample
        ))));
    }

    let info = AudioInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
    };

    let mut pcm = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        let sample = sample
            .map_err(|e| ClientError::new(ClientErrorDescription::ChunkDecode(e.to_string())))?;
        pcm.extend_from_slice(&sample.to_le_bytes());
    }

    Ok((info, pcm))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_24k_mono() -> AudioInfo {
        AudioInfo { sample_rate: 24000, channels: 1, bits_per_sample: 16 }
    }

    #[test]
    fn header_lengths_match_payload() {
        let info = info_24k_mono();
        let wav = assemble(&info, [vec![0u8; 4000], vec![0u8; 4000]]);

        assert_eq!(wav.len(), 44 + 8000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(wav[4..8].try_into().unwrap()), 36 + 8000);
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 8000);
        // ByteRate = 24000 * 1 * 2
        assert_eq!(u32::from_le_bytes(wav[28..32].try_into().unwrap()), 48000);
    }

    #[test]
    fn empty_input_yields_bare_header() {
        let wav = assemble(&info_24k_mono(), Vec::<Vec<u8>>::new());
        assert_eq!(wav.len(), 44);
        assert_eq!(u32::from_le_bytes(wav[4..8].try_into().unwrap()), 36);
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 0);
    }

    #[test]
    fn output_parses_with_hound() {
        let pcm: Vec<u8> = (0i16..100).flat_map(|s| s.to_le_bytes()).collect();
        let wav = assemble(&info_24k_mono(), [pcm]);

        let reader = hound::WavReader::new(Cursor::new(&wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 24000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 100);
    }

    #[test]
    fn builder_orders_fragments_by_index() {
        let mut builder = WavBuilder::new();
        builder.set_info(info_24k_mono());
        builder.insert(1, vec![3, 0, 4, 0]);
        builder.insert(0, vec![1, 0, 2, 0]);

        let wav = builder.finish().unwrap();
        assert_eq!(&wav[44..], &[1, 0, 2, 0, 3, 0, 4, 0]);
    }

    #[test]
    fn builder_without_info_is_an_error() {
        let mut builder = WavBuilder::new();
        builder.push(vec![0, 0]);
        assert!(builder.finish().is_err());
    }

    #[test]
    fn decode_round_trips_assembled_output() {
        let pcm: Vec<u8> = (-50i16..50).flat_map(|s| s.to_le_bytes()).collect();
        let wav = assemble(&info_24k_mono(), [pcm.clone()]);

        let (info, decoded) = decode(&wav).unwrap();
        assert_eq!(info, info_24k_mono());
        assert_eq!(decoded, pcm);
    }
}
