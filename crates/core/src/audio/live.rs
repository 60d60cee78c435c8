//! Capture from a system input device through cpal.
//!
//! cpal streams are not `Send` on every platform, so the stream lives on a
//! dedicated thread for its whole life and hands sample blocks out over a
//! channel. The source itself only holds the receiving end.

use std::{
    fmt::Display,
    thread::{self, JoinHandle},
    time::Duration,
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, Stream,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use super::{downmix, AudioFrame, FrameSource};
use crate::{Result, RhythmError};

/// Longest gap between callbacks before the device is considered gone.
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

fn unavailable(err: impl Display) -> RhythmError {
    RhythmError::CaptureUnavailable(err.to_string())
}

/// Mono frames from a live input device, timestamped by samples received
/// since the stream started.
pub struct LiveInputSource {
    blocks: Receiver<Vec<f32>>,
    pending: Vec<f32>,
    sample_rate: u32,
    frame_len: usize,
    position: u64,
    device_name: String,
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl LiveInputSource {
    /// Opens `device_name` (`"default"` picks the host's default input) and
    /// starts streaming. Every failure is reported as
    /// [`RhythmError::CaptureUnavailable`].
    pub fn open(device_name: &str, frame_len: usize) -> Result<Self> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(u32, String)>>(1);
        let (blocks_tx, blocks_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let wanted = device_name.to_string();

        let worker = thread::Builder::new()
            .name("live-input".to_string())
            .spawn(move || {
                let stream = match build_stream(&wanted, blocks_tx) {
                    Ok((stream, sample_rate, name)) => {
                        let _ = ready_tx.send(Ok((sample_rate, name)));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = shutdown_rx.recv();
                drop(stream);
            })?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(unavailable("input thread exited before the stream started")));
        let (sample_rate, device_name) = match ready {
            Ok(ready) => ready,
            Err(err) => {
                let _ = worker.join();
                return Err(err);
            }
        };

        info!(device = %device_name, sample_rate, "live input streaming");
        Ok(Self {
            blocks: blocks_rx,
            pending: Vec::new(),
            sample_rate,
            frame_len: frame_len.max(1),
            position: 0,
            device_name,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        })
    }
}

impl FrameSource for LiveInputSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn next_frame(&mut self) -> Result<Option<AudioFrame>> {
        while self.pending.len() < self.frame_len {
            match self.blocks.recv_timeout(STALL_TIMEOUT) {
                Ok(block) => self.pending.extend(block),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(unavailable(format!("input `{}` stopped delivering audio", self.device_name)))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }

        let samples: Vec<f32> = self.pending.drain(..self.frame_len).collect();
        let timestamp = self.position as f64 / self.sample_rate as f64;
        self.position += samples.len() as u64;
        Ok(Some(AudioFrame { samples, timestamp }))
    }
}

impl Drop for LiveInputSource {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        debug!(device = %self.device_name, "live input closed");
    }
}

impl std::fmt::Debug for LiveInputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveInputSource")
            .field("device", &self.device_name)
            .field("sample_rate", &self.sample_rate)
            .field("frame_len", &self.frame_len)
            .finish()
    }
}

fn find_device(wanted: &str) -> Result<Device> {
    let host = cpal::default_host();
    if wanted == "default" {
        return host
            .default_input_device()
            .ok_or_else(|| unavailable("no default audio input device"));
    }

    host.input_devices()
        .map_err(unavailable)?
        .find(|device| device.name().map(|name| name == wanted).unwrap_or(false))
        .ok_or_else(|| unavailable(format!("audio input `{wanted}` not found")))
}

fn build_stream(wanted: &str, blocks: Sender<Vec<f32>>) -> Result<(Stream, u32, String)> {
    let device = find_device(wanted)?;
    let name = device.name().unwrap_or_else(|_| wanted.to_string());
    let supported = device.default_input_config().map_err(unavailable)?;
    let sample_format = supported.sample_format();
    let config = supported.config();
    let channels = config.channels.max(1) as usize;
    let sample_rate = config.sample_rate.0;

    let on_error = |err: cpal::StreamError| error!("live input stream error: {err}");
    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = blocks.send(downmix(data, channels));
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let scaled: Vec<f32> = data.iter().map(|&s| s as f32 / 32_768.0).collect();
                let _ = blocks.send(downmix(&scaled, channels));
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let scaled: Vec<f32> = data.iter().map(|&s| (s as f32 - 32_768.0) / 32_768.0).collect();
                let _ = blocks.send(downmix(&scaled, channels));
            },
            on_error,
            None,
        ),
        other => return Err(unavailable(format!("unsupported input sample format {other:?}"))),
    }
    .map_err(unavailable)?;

    stream.play().map_err(unavailable)?;
    debug!(device = %name, ?sample_format, channels, sample_rate, "input stream built");
    Ok((stream, sample_rate, name))
}
