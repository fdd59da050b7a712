//! Audio egress: local playback and recording
//!
//! While a web client holds the floor, its uplink Opus frames are wrapped
//! into Ogg pages and written to the speaker subprocess and to a recording
//! subprocess that produces a 44.1 kHz PCM WAV. The recording is finalized
//! into the recordings directory when the floor is released.

use chrono::Local;
use log::{debug, info, warn};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use super::ogg::OggStreamWriter;
use crate::config::{AudioConfig, PathsConfig, SpeakerFlavor, TimingConfig};

/// In-flight recording for the current floor session.
struct RecordingSlot {
    child: Child,
    stdin: Option<ChildStdin>,
    ogg: OggStreamWriter,
    temp_path: PathBuf,
    final_path: PathBuf,
}

struct SpeakerProc {
    child: Child,
    stdin: Option<ChildStdin>,
}

/// Speaker subprocess state. In persistent mode the Ogg writer survives
/// across floor sessions so the granule position stays monotone and the
/// downstream decoder never resets.
struct SpeakerState {
    proc: Option<SpeakerProc>,
    ogg: Option<OggStreamWriter>,
    cooldown_until: Option<Instant>,
}

pub struct AudioEgress {
    audio: AudioConfig,
    timing: TimingConfig,
    recordings_dir: PathBuf,
    temp_dir: PathBuf,
    speaker: Mutex<SpeakerState>,
    recording: Mutex<Option<RecordingSlot>>,
}

impl AudioEgress {
    pub fn new(audio: AudioConfig, timing: TimingConfig, paths: &PathsConfig) -> Self {
        Self {
            audio,
            timing,
            recordings_dir: paths.recordings_dir.clone(),
            temp_dir: paths.recordings_temp_dir.clone(),
            speaker: Mutex::new(SpeakerState {
                proc: None,
                ogg: None,
                cooldown_until: None,
            }),
            recording: Mutex::new(None),
        }
    }

    /// Floor granted to a web client: open the recording slot and make sure
    /// a speaker subprocess is running. Subprocess trouble is logged, never
    /// propagated; the floor session continues without the failing sink.
    pub async fn begin_session(&self, client_id: &str) {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        self.open_recording(Some(client_id), &stamp).await;
        self.ensure_speaker().await;
    }

    /// Floor claimed by the external VOX: record the radio-side audio that
    /// arrives through the server microphone. No speaker; the radio is
    /// already audible locally.
    pub async fn begin_external_session(&self) {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        self.open_recording(None, &stamp).await;
    }

    /// One Opus payload from the holder's uplink: page it out to both sinks.
    pub async fn handle_opus_payload(&self, payload: &[u8]) {
        self.write_to_recorder(payload).await;
        self.write_to_speaker(payload).await;
    }

    /// One Opus payload for the recorder only (radio-side capture).
    pub async fn record_opus_payload(&self, payload: &[u8]) {
        self.write_to_recorder(payload).await;
    }

    /// Floor released or timed out: finalize the recording and, in
    /// per-session mode, stop the speaker.
    pub async fn end_session(&self) {
        if let Some(slot) = self.recording.lock().await.take() {
            finalize_recording(slot, self.timing.recorder_close()).await;
        }

        if self.audio.speaker_flavor == SpeakerFlavor::PerSession {
            let mut speaker = self.speaker.lock().await;
            if let Some(mut proc) = speaker.proc.take() {
                proc.stdin.take();
                if let Err(e) = proc.child.start_kill() {
                    debug!("Speaker subprocess kill failed: {}", e);
                }
            }
            speaker.ogg = None;
        }
    }

    /// Whether a recording slot is currently open.
    pub async fn recording_active(&self) -> bool {
        self.recording.lock().await.is_some()
    }

    async fn open_recording(&self, client_id: Option<&str>, stamp: &str) {
        let (temp_name, final_name) = match client_id {
            Some(client_id) => (
                format!("recording_{}_{}.wav", stamp, client_id),
                format!("web_{}_{}.wav", stamp, client_id),
            ),
            None => (
                format!("recording_{}.wav", stamp),
                format!("rec_{}.wav", stamp),
            ),
        };
        let temp_path = self.temp_dir.join(temp_name);
        let final_path = self.recordings_dir.join(final_name);

        let mut command = Command::new("ffmpeg");
        command
            .args(["-hide_banner", "-loglevel", "error", "-f", "ogg", "-i", "-"])
            .args(["-ar", "44100", "-ac", "1", "-acodec", "pcm_s16le", "-y"])
            .arg(&temp_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match command.spawn() {
            Ok(mut child) => {
                let stdin = child.stdin.take();
                if stdin.is_none() {
                    warn!("Recorder subprocess has no stdin; recording skipped");
                    return;
                }
                info!("Recording to {:?}", temp_path);
                let slot = RecordingSlot {
                    child,
                    stdin,
                    ogg: OggStreamWriter::new(rand::thread_rng().gen()),
                    temp_path,
                    final_path,
                };
                *self.recording.lock().await = Some(slot);
            }
            Err(e) => warn!("Failed to spawn recorder subprocess: {}", e),
        }
    }

    async fn ensure_speaker(&self) {
        if !self.audio.enable_local_audio {
            return;
        }

        let mut speaker = self.speaker.lock().await;
        if speaker.proc.is_some() {
            return;
        }
        if let Some(until) = speaker.cooldown_until {
            if Instant::now() < until {
                debug!("Speaker subprocess in cool-down; local playback stays off");
                return;
            }
            speaker.cooldown_until = None;
        }

        let mut command = match self.audio.speaker_flavor {
            SpeakerFlavor::Persistent => {
                let mut cmd = Command::new("python3");
                cmd.arg("speaker_player.py");
                if !self.audio.speaker_device_id.is_empty() {
                    cmd.args(["--device", &self.audio.speaker_device_id]);
                }
                cmd
            }
            SpeakerFlavor::PerSession => {
                let mut cmd = Command::new("ffplay");
                cmd.args(["-nodisp", "-autoexit", "-loglevel", "error", "-f", "ogg", "-i", "-"]);
                cmd
            }
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match command.spawn() {
            Ok(mut child) => {
                let stdin = child.stdin.take();
                if stdin.is_none() {
                    warn!("Speaker subprocess has no stdin; playback disabled");
                    return;
                }
                speaker.proc = Some(SpeakerProc { child, stdin });
                if speaker.ogg.is_none() {
                    speaker.ogg = Some(OggStreamWriter::new(rand::thread_rng().gen()));
                }
            }
            Err(e) => {
                warn!(
                    "Failed to spawn speaker subprocess: {}; cool-down {}s",
                    e,
                    self.timing.respawn_cooldown().as_secs()
                );
                speaker.cooldown_until = Some(Instant::now() + self.timing.respawn_cooldown());
            }
        }
    }

    async fn write_to_recorder(&self, payload: &[u8]) {
        let mut recording = self.recording.lock().await;
        let Some(slot) = recording.as_mut() else {
            return;
        };

        let mut bytes = slot.ogg.header_pages();
        bytes.extend_from_slice(&slot.ogg.audio_page(payload));

        let Some(stdin) = slot.stdin.as_mut() else {
            return;
        };
        if let Err(e) = write_with_deadline(stdin, &bytes, self.timing.subprocess_write()).await {
            warn!("Recorder write failed ({}); dropping frame", e);
        }
    }

    async fn write_to_speaker(&self, payload: &[u8]) {
        let mut speaker = self.speaker.lock().await;
        let Some(ogg) = speaker.ogg.as_mut() else {
            return;
        };

        let mut bytes = ogg.header_pages();
        bytes.extend_from_slice(&ogg.audio_page(payload));

        let Some(proc) = speaker.proc.as_mut() else {
            return;
        };
        let Some(stdin) = proc.stdin.as_mut() else {
            return;
        };

        if let Err(e) = write_with_deadline(stdin, &bytes, self.timing.subprocess_write()).await {
            warn!(
                "Speaker write failed ({}); disabling playback for {}s",
                e,
                self.timing.respawn_cooldown().as_secs()
            );
            let cooldown = Instant::now() + self.timing.respawn_cooldown();
            if let Some(mut dead) = speaker.proc.take() {
                dead.stdin.take();
                let _ = dead.child.start_kill();
            }
            speaker.ogg = None;
            speaker.cooldown_until = Some(cooldown);
        }
    }
}

/// Bounded-deadline write so a wedged subprocess cannot back up the RTP
/// pipeline. Timeout surfaces as an error; the caller drops the frame.
async fn write_with_deadline(
    stdin: &mut ChildStdin,
    bytes: &[u8],
    deadline: Duration,
) -> std::io::Result<()> {
    match tokio::time::timeout(deadline, stdin.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "subprocess write deadline exceeded",
        )),
    }
}

/// Half-close stdin, wait out the encoder, then move the temp file into the
/// recordings directory. An empty temp file is dropped; a wait overrun
/// leaves the temp file for external cleanup.
async fn finalize_recording(mut slot: RecordingSlot, close_deadline: Duration) {
    slot.stdin.take();

    match tokio::time::timeout(close_deadline, slot.child.wait()).await {
        Ok(Ok(status)) => debug!("Recorder subprocess exited: {}", status),
        Ok(Err(e)) => {
            warn!("Recorder subprocess wait failed: {}", e);
            return;
        }
        Err(_) => {
            warn!(
                "Recorder subprocess did not exit within {:?}; leaving {:?} for external cleanup",
                close_deadline, slot.temp_path
            );
            return;
        }
    }

    let has_bytes = tokio::fs::metadata(&slot.temp_path)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false);
    if !has_bytes {
        debug!("Dropping empty recording {:?}", slot.temp_path);
        let _ = tokio::fs::remove_file(&slot.temp_path).await;
        return;
    }

    let target = unique_target(&slot.final_path);
    match tokio::fs::rename(&slot.temp_path, &target).await {
        Ok(()) => info!("Recording finished: {:?}", target),
        Err(_) => {
            // Cross-filesystem move: copy then unlink
            match tokio::fs::copy(&slot.temp_path, &target).await {
                Ok(_) => {
                    let _ = tokio::fs::remove_file(&slot.temp_path).await;
                    info!("Recording finished (copied): {:?}", target);
                }
                Err(e) => warn!(
                    "Failed to move recording {:?} to {:?}: {}",
                    slot.temp_path, target, e
                ),
            }
        }
    }
}

/// Never overwrite an existing recording: suffix a counter until the name
/// is free. The suffix stays inside the download whitelist's trailing
/// alphanumeric segment: names with a client-id segment get digits appended
/// to it, names ending at the timestamp start a new segment.
fn unique_target(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("recording");
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("wav");
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    let ends_at_timestamp = stem
        .rsplit('_')
        .next()
        .map(|last| last.len() == 6 && last.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(true);

    let mut n = 1;
    loop {
        let candidate_stem = if ends_at_timestamp {
            format!("{}_{}", stem, n)
        } else {
            format!("{}{}", stem, n)
        };
        let candidate = parent.join(format!("{}.{}", candidate_stem, extension));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
