
use serde::{Deserialize, Serialize};

use clap::ValueEnum;

use crate::LONG_TEXT_THRESHOLD;
use crate::store::KvStore;
use crate::types::{ChunkStrategy, StreamingQuality, SynthesisRequest};

pub const PROCESSING_MODE_KEY: &str = "chatterbox-processing-mode";
pub const STREAMING_ENABLED_KEY: &str = "chatterbox-streaming-enabled";
pub const ADVANCED_SETTINGS_KEY: &str = "chatterbox-advanced-settings";

/// Which synthesis path a submission takes. `Auto` routes by input length.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingMode {
    #[default]
    Auto,
    Streaming,
    LongText,
}

impl ProcessingMode {
    pub fn use_long_text(self, text: &str) -> bool {
        match self {
            Self::Streaming => false,
            Self::LongText => true,
            Self::Auto => text.chars().count() > LONG_TEXT_THRESHOLD,
        }
    }
}

// The mode is stored wrapped, `{"mode":"auto"}`, matching the documented
// store schema for this key.
#[derive(Serialize, Deserialize, Default)]
struct ProcessingModeDoc {
    #[serde(default)]
    mode: ProcessingMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedSettings {
    pub exaggeration: f32,
    pub cfg_weight: f32,
    pub temperature: f32,
    pub streaming_chunk_size: Option<u32>,
    pub streaming_strategy: ChunkStrategy,
    pub streaming_quality: StreamingQuality,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            exaggeration: 0.5,
            cfg_weight: 0.5,
            temperature: 0.8,
            streaming_chunk_size: None,
            streaming_strategy: ChunkStrategy::Sentence,
            streaming_quality: StreamingQuality::Balanced,
        }
    }
}

/// Typed repository over the durable store. Absent or malformed entries
/// fall back to defaults; reads never fail.
#[derive(Debug, Clone)]
pub struct Settings {
    store: KvStore,
}

impl Settings {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        self.store
            .get(PROCESSING_MODE_KEY)
            .and_then(|raw| serde_json::from_str::<ProcessingModeDoc>(&raw).ok())
            .map(|doc| doc.mode)
            .unwrap_or_default()
    }

    pub fn set_processing_mode(&self, mode: ProcessingMode) {
        match serde_json::to_string(&ProcessingModeDoc { mode }) {
            Ok(raw) => self.store.set(PROCESSING_MODE_KEY, &raw),
            Err(e) => log::warn!("settings: failed to encode processing mode: {}", e),
        }
    }

    pub fn streaming_enabled(&self) -> bool {
        self.store
            .get(STREAMING_ENABLED_KEY)
            .map(|raw| raw.trim() == "true")
            .unwrap_or(false)
    }

    pub fn set_streaming_enabled(&self, enabled: bool) {
        self.store.set(STREAMING_ENABLED_KEY, if enabled { "true" } else { "false" });
    }

    pub fn advanced(&self) -> AdvancedSettings {
        self.store
            .get(ADVANCED_SETTINGS_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn set_advanced(&self, settings: &AdvancedSettings) {
        match serde_json::to_string(settings) {
            Ok(raw) => self.store.set(ADVANCED_SETTINGS_KEY, &raw),
            Err(e) => log::warn!("settings: failed to encode advanced settings: {}", e),
        }
    }

    /// A request pre-filled with the persisted generation parameters.
    pub fn request_for(&self, input: impl Into<String>) -> SynthesisRequest {
        let advanced = self.advanced();
        let mut request = SynthesisRequest::new(input);
        request.exaggeration = Some(advanced.exaggeration);
        request.cfg_weight = Some(advanced.cfg_weight);
        request.temperature = Some(advanced.temperature);
        request.streaming_chunk_size = advanced.streaming_chunk_size;
        request.streaming_strategy = Some(advanced.streaming_strategy);
        request.streaming_quality = Some(advanced.streaming_quality);
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_in_temp_dir() -> (tempfile::TempDir, Settings) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(KvStore::open_at(dir.path()));
        (dir, settings)
    }

    #[test]
    fn defaults_when_nothing_stored() {
        let (_dir, settings) = settings_in_temp_dir();
        assert_eq!(settings.processing_mode(), ProcessingMode::Auto);
        assert!(!settings.streaming_enabled());
        assert_eq!(settings.advanced(), AdvancedSettings::default());
    }

    #[test]
    fn malformed_entries_fall_back_to_defaults() {
        let (dir, settings) = settings_in_temp_dir();
        let store = KvStore::open_at(dir.path());
        store.set(PROCESSING_MODE_KEY, "{not json");
        store.set(ADVANCED_SETTINGS_KEY, "[1,2,3]");

        assert_eq!(settings.processing_mode(), ProcessingMode::Auto);
        assert_eq!(settings.advanced(), AdvancedSettings::default());
    }

    #[test]
    fn mode_round_trips_through_store() {
        let (_dir, settings) = settings_in_temp_dir();
        settings.set_processing_mode(ProcessingMode::LongText);
        assert_eq!(settings.processing_mode(), ProcessingMode::LongText);
    }

    #[test]
    fn advanced_settings_round_trip() {
        let (_dir, settings) = settings_in_temp_dir();
        let mut advanced = AdvancedSettings::default();
        advanced.temperature = 0.6;
        advanced.streaming_strategy = ChunkStrategy::Paragraph;
        settings.set_advanced(&advanced);
        assert_eq!(settings.advanced(), advanced);
    }

    #[test]
    fn auto_mode_routes_by_threshold() {
        let short = "a".repeat(100);
        let long = "a".repeat(5000);
        assert!(!ProcessingMode::Auto.use_long_text(&short));
        assert!(ProcessingMode::Auto.use_long_text(&long));
        assert!(!ProcessingMode::Streaming.use_long_text(&long));
        assert!(ProcessingMode::LongText.use_long_text(&short));
    }

    #[test]
    fn request_for_applies_persisted_parameters() {
        let (_dir, settings) = settings_in_temp_dir();
        let request = settings.request_for("hello");
        assert_eq!(request.exaggeration, Some(0.5));
        assert_eq!(request.cfg_weight, Some(0.5));
        assert_eq!(request.temperature, Some(0.8));
        assert_eq!(request.streaming_strategy, Some(ChunkStrategy::Sentence));
    }
}
