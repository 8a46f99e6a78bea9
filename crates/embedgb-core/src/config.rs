use crate::cartridge::BootRom;
use crate::hardware::Model;

/// Session settings a frontend can persist alongside its own.
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default, rename_all = "kebab-case")
)]
pub struct SessionConfig {
    pub model: Model,
    /// Host audio sample rate in Hz.
    pub sample_rate: u32,
    /// Audio latency the ring must absorb, in milliseconds.
    pub audio_latency_ms: u32,
    /// Per-tick cycle budget ceiling, in frames.
    pub max_catch_up: f32,
    /// Frames without a cartridge RAM write before a dirty save is flushable.
    pub idle_save_frames: u32,
    /// Optional boot ROM; without one the post-boot state is installed.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub boot_rom: Option<BootRom>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: Model::Dmg,
            sample_rate: 44_100,
            audio_latency_ms: 100,
            max_catch_up: 1.5,
            idle_save_frames: 180,
            boot_rom: None,
        }
    }
}

impl SessionConfig {
    pub fn with_model(model: Model) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    /// Stereo frames the audio ring holds: twice the configured latency, and
    /// never less than one video frame of audio plus slack.
    pub fn audio_capacity_frames(&self) -> usize {
        let rate = self.sample_rate as usize;
        let latency = rate * self.audio_latency_ms as usize * 2 / 1000;
        let one_frame = rate.div_ceil(60);
        latency.max(one_frame * 2)
    }
}
