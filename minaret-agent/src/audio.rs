//! The audio output guard: the one owner of the physical audio sink.
//!
//! Playback requests are serialized by an atomic busy claim, never queued.
//! A request that arrives while muted or busy is an expected no-op, not a
//! fault.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use minaret_core::{AudioState, PrayerName};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{AudioBackendConfig, AudioConfig};

const TEST_ASSET: &str = "test-audio.wav";

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("failed to run {tool}: {source}")]
    ToolSpawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}")]
    ToolFailed {
        tool: &'static str,
        status: std::process::ExitStatus,
    },
}

/// What became of a playback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// Played to completion.
    Played,
    /// Skipped because the device is muted.
    SkippedMuted,
    /// Skipped because something else holds the sink.
    SkippedBusy,
    /// Attempted but failed (missing asset or backend error); logged, not
    /// propagated, and subsequent requests are unaffected.
    Failed,
}

/// The mechanism that actually produces sound and drives the mixer.
#[async_trait]
pub trait AudioBackend: Send + Sync + 'static {
    async fn play_file(&self, path: &Path) -> Result<(), AudioError>;
    /// A generic audible tone, used when no test asset exists.
    async fn play_tone(&self) -> Result<(), AudioError>;
    async fn set_mixer_volume(&self, percent: u8) -> Result<(), AudioError>;
}

/// Backend driving the ALSA userland tools, as deployed on the device.
pub struct AlsaBackend {
    mixer_control: String,
}

impl AlsaBackend {
    pub fn new(mixer_control: String) -> Self {
        Self { mixer_control }
    }
}

async fn run_tool(tool: &'static str, command: &mut Command) -> Result<(), AudioError> {
    let status = command
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|source| AudioError::ToolSpawn { tool, source })?;
    if status.success() {
        Ok(())
    } else {
        Err(AudioError::ToolFailed { tool, status })
    }
}

#[async_trait]
impl AudioBackend for AlsaBackend {
    async fn play_file(&self, path: &Path) -> Result<(), AudioError> {
        run_tool("aplay", Command::new("aplay").arg(path)).await
    }

    async fn play_tone(&self) -> Result<(), AudioError> {
        run_tool(
            "speaker-test",
            Command::new("speaker-test").args(["-t", "sine", "-f", "1000", "-l", "1", "-s", "1"]),
        )
        .await
    }

    async fn set_mixer_volume(&self, percent: u8) -> Result<(), AudioError> {
        run_tool(
            "amixer",
            Command::new("amixer")
                .arg("set")
                .arg(&self.mixer_control)
                .arg(format!("{percent}%")),
        )
        .await
    }
}

/// Backend that only logs. Selected by config on hosts without a sink.
#[derive(Default)]
pub struct MockBackend;

#[async_trait]
impl AudioBackend for MockBackend {
    async fn play_file(&self, path: &Path) -> Result<(), AudioError> {
        info!(path = %path.display(), "mock backend: play");
        Ok(())
    }

    async fn play_tone(&self) -> Result<(), AudioError> {
        info!("mock backend: tone");
        Ok(())
    }

    async fn set_mixer_volume(&self, percent: u8) -> Result<(), AudioError> {
        info!(percent, "mock backend: mixer volume");
        Ok(())
    }
}

/// An audio file visible in the asset directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFileInfo {
    pub name: String,
    pub size_bytes: u64,
}

struct GuardInner {
    backend: Box<dyn AudioBackend>,
    audio_dir: PathBuf,
    volume: AtomicU8,
    muted: AtomicBool,
    playing: AtomicBool,
}

/// Clears the busy flag when dropped, so playback failures can never leave
/// the sink claimed.
struct PlayClaim<'a>(&'a AtomicBool);

impl<'a> PlayClaim<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PlayClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct AudioGuard {
    inner: Arc<GuardInner>,
}

impl AudioGuard {
    pub fn new(backend: Box<dyn AudioBackend>, audio_dir: PathBuf, default_volume: u8) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                backend,
                audio_dir,
                volume: AtomicU8::new(default_volume.min(100)),
                muted: AtomicBool::new(false),
                playing: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        let backend: Box<dyn AudioBackend> = match &config.backend {
            AudioBackendConfig::Alsa { mixer_control } => {
                Box::new(AlsaBackend::new(mixer_control.clone()))
            }
            AudioBackendConfig::Mock => Box::new(MockBackend),
        };
        Self::new(backend, config.audio_dir.clone(), config.default_volume)
    }

    /// Apply the stored volume to the mixer and report missing assets.
    /// Called once at startup.
    pub async fn initialize(&self) {
        let volume = self.inner.volume.load(Ordering::Relaxed);
        if let Err(e) = self.inner.backend.set_mixer_volume(volume).await {
            warn!(error = %e, "Could not apply startup volume");
        }

        for name in PrayerName::ALL {
            let path = self.inner.audio_dir.join(name.asset_file_name());
            if !path.exists() {
                warn!(asset = name.asset_file_name(), "Audio asset missing");
            }
        }
        if !self.inner.audio_dir.join(TEST_ASSET).exists() {
            info!("No dedicated test asset, manual tests will use a tone");
        }
    }

    /// Clamp to 0..=100, store, and push to the mixer. Mixer failures are
    /// logged and do not block later volume changes.
    pub async fn set_volume(&self, requested: i64) -> u8 {
        let clamped = requested.clamp(0, 100) as u8;
        self.inner.volume.store(clamped, Ordering::Relaxed);
        if let Err(e) = self.inner.backend.set_mixer_volume(clamped).await {
            warn!(error = %e, volume = clamped, "Mixer volume change failed");
        }
        info!(volume = clamped, "Volume set");
        clamped
    }

    /// Pure state flag: audio already in flight keeps playing.
    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::Relaxed);
        info!(muted, "Mute updated");
    }

    pub fn status(&self) -> AudioState {
        AudioState {
            volume_percent: self.inner.volume.load(Ordering::Relaxed),
            muted: self.inner.muted.load(Ordering::Relaxed),
            currently_playing: self.inner.playing.load(Ordering::Relaxed),
        }
    }

    /// Play the call for `name` to completion.
    ///
    /// Muted or busy requests return immediately without touching the
    /// sink. The busy flag is released on every exit path.
    pub async fn play_prayer(&self, name: PrayerName) -> PlayOutcome {
        if self.inner.muted.load(Ordering::Relaxed) {
            debug!(prayer = %name, "Muted, skipping playback");
            return PlayOutcome::SkippedMuted;
        }
        let Some(_claim) = PlayClaim::acquire(&self.inner.playing) else {
            debug!(prayer = %name, "Sink busy, skipping playback");
            return PlayOutcome::SkippedBusy;
        };

        let path = self.inner.audio_dir.join(name.asset_file_name());
        if !path.exists() {
            warn!(path = %path.display(), "Audio asset not found, skipping");
            return PlayOutcome::Failed;
        }

        info!(prayer = %name, "Playing prayer audio");
        match self.inner.backend.play_file(&path).await {
            Ok(()) => {
                info!(prayer = %name, "Finished prayer audio");
                PlayOutcome::Played
            }
            Err(e) => {
                warn!(prayer = %name, error = %e, "Prayer playback failed");
                PlayOutcome::Failed
            }
        }
    }

    /// Operator-initiated test playback: respects the busy claim but is
    /// deliberately audible even while muted.
    pub async fn play_test(&self) -> PlayOutcome {
        let Some(_claim) = PlayClaim::acquire(&self.inner.playing) else {
            debug!("Sink busy, skipping test audio");
            return PlayOutcome::SkippedBusy;
        };

        let path = self.inner.audio_dir.join(TEST_ASSET);
        let result = if path.exists() {
            info!("Playing test audio");
            self.inner.backend.play_file(&path).await
        } else {
            info!("Playing test tone");
            self.inner.backend.play_tone().await
        };

        match result {
            Ok(()) => PlayOutcome::Played,
            Err(e) => {
                warn!(error = %e, "Test playback failed");
                PlayOutcome::Failed
            }
        }
    }

    pub async fn available_audio_files(&self) -> Vec<AudioFileInfo> {
        let mut files = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.inner.audio_dir).await else {
            return files;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".wav") {
                continue;
            }
            let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            files.push(AudioFileInfo { name, size_bytes });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }
}
