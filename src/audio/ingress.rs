//! Audio ingress: server microphone
//!
//! A transcoder subprocess captures the local microphone and emits
//! Ogg/Opus on stdout. Each extracted packet is stamped into RTP and fanned
//! out to every connected P2P track, unless a web client holds the floor
//! (echo suppression) or the mic mode keeps it muted.

use log::{debug, info, warn};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::fanout_opus_frame;
use super::ogg::OggPacketReader;
use crate::config::ServerMicMode;
use crate::floor::{is_web_client, EXTERNAL_CLIENT_ID, SERVER_CLIENT_ID};
use crate::web::SharedState;

/// Whether mic frames may be forwarded right now.
///
/// A real (web) client holding the floor always mutes the mic, preventing a
/// local mic → speaker → mic loop. In `ptt` mode the mic is additionally
/// muted unless the server itself holds the floor.
pub fn mic_transmit_allowed(holder: Option<&str>, mode: ServerMicMode) -> bool {
    if let Some(holder) = holder {
        if is_web_client(holder) {
            return false;
        }
    }
    match mode {
        ServerMicMode::Always => true,
        ServerMicMode::Ptt => holder == Some(SERVER_CLIENT_ID),
    }
}

/// Spawn the microphone pipeline if enabled. The transcoder is respawned
/// after a cool-down whenever it exits; it never busy-loops.
pub fn spawn_mic_ingress(state: Arc<SharedState>) {
    if !state.config.audio.enable_server_mic {
        return;
    }

    tokio::spawn(async move {
        let device = state.config.audio.mic_device.clone();
        let mode = state.config.audio.server_mic_mode;
        let cooldown = state.config.timing.respawn_cooldown();

        loop {
            match run_mic_transcoder(&state, &device, mode).await {
                Ok(()) => info!("Mic transcoder stream ended"),
                Err(e) => warn!("Mic transcoder failed: {}", e),
            }
            debug!("Respawning mic transcoder in {:?}", cooldown);
            tokio::time::sleep(cooldown).await;
        }
    });
}

async fn run_mic_transcoder(
    state: &Arc<SharedState>,
    device: &str,
    mode: ServerMicMode,
) -> std::io::Result<()> {
    let mut child = Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error"])
        .args(["-f", "alsa", "-i", device])
        .args(["-ac", "1", "-ar", "48000"])
        .args(["-c:a", "libopus", "-b:a", "64k", "-frame_duration", "20"])
        .args(["-f", "ogg", "-"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let Some(mut stdout) = child.stdout.take() else {
        let _ = child.start_kill();
        return Err(std::io::Error::other("mic transcoder has no stdout"));
    };

    info!("Mic transcoder running on device {}", device);

    let mut reader = OggPacketReader::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        for packet in reader.push(&buf[..n]) {
            let holder = state.floor.holder();
            if holder.as_deref() == Some(EXTERNAL_CLIENT_ID) {
                // Radio-side audio: capture it alongside the fan-out
                state.egress.record_opus_payload(&packet).await;
            }
            if !mic_transmit_allowed(holder.as_deref(), mode) {
                continue;
            }
            fanout_opus_frame(&state.registry, None, &packet).await;
        }
    }

    let _ = child.wait().await;
    Ok(())
}
