use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use hound::{SampleFormat, WavReader};
use tracing::{debug, info, warn};

use crate::{
    clock::{seconds_to_nanos, ClockSource},
    config::AudioConfig,
    onset::{OnsetDecision, OnsetDetector},
    Result, RhythmError,
};

#[cfg(feature = "live-input")]
mod live;
#[cfg(feature = "live-input")]
pub use live::LiveInputSource;

/// Name of whoever currently owns the process-wide audio input.
static DEVICE_HOLDER: Mutex<Option<String>> = Mutex::new(None);

fn lock_holder() -> Result<MutexGuard<'static, Option<String>>> {
    DEVICE_HOLDER
        .lock()
        .map_err(|_| RhythmError::Poisoned("audio input device"))
}

/// Exclusive claim on the audio input. Only one guard can be alive at a time;
/// dropping it releases the device.
#[derive(Debug)]
pub struct InputDevice {
    holder: String,
}

impl InputDevice {
    pub fn acquire(holder: impl Into<String>) -> Result<Self> {
        let holder = holder.into();
        let mut slot = lock_holder()?;
        if let Some(current) = slot.as_ref() {
            return Err(RhythmError::DeviceBusy {
                holder: current.clone(),
            });
        }

        info!(%holder, "audio input acquired");
        *slot = Some(holder.clone());
        Ok(Self { holder })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for InputDevice {
    fn drop(&mut self) {
        let mut slot = DEVICE_HOLDER
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
        debug!(holder = %self.holder, "audio input released");
    }
}

/// Mono block of samples and the stream time (seconds) of its first sample.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub timestamp: f64,
}

/// Anything that yields consecutive mono frames.
pub trait FrameSource {
    fn sample_rate(&self) -> u32;

    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<AudioFrame>>;
}

/// In-memory mono signal chopped into fixed-size frames. The final frame may
/// be shorter than `frame_len`.
#[derive(Debug, Clone)]
pub struct BufferFrameSource {
    samples: Vec<f32>,
    sample_rate: u32,
    frame_len: usize,
    position: usize,
}

impl BufferFrameSource {
    pub fn new(samples: Vec<f32>, sample_rate: u32, frame_len: usize) -> Self {
        Self {
            samples,
            sample_rate: sample_rate.max(1),
            frame_len: frame_len.max(1),
            position: 0,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

impl FrameSource for BufferFrameSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn next_frame(&mut self) -> Result<Option<AudioFrame>> {
        if self.position >= self.samples.len() {
            return Ok(None);
        }

        let end = (self.position + self.frame_len).min(self.samples.len());
        let frame = AudioFrame {
            samples: self.samples[self.position..end].to_vec(),
            timestamp: self.position as f64 / self.sample_rate as f64,
        };
        self.position = end;
        Ok(Some(frame))
    }
}

/// Recorded input decoded from a WAV file and downmixed to mono.
#[derive(Debug, Clone)]
pub struct WavFrameSource {
    inner: BufferFrameSource,
    channels: u16,
}

impl WavFrameSource {
    /// Decodes `path`. Failing to open or parse the file is reported as
    /// [`RhythmError::CaptureUnavailable`].
    pub fn open(path: &Path, frame_len: usize) -> Result<Self> {
        let reader = WavReader::open(path).map_err(|err| {
            RhythmError::CaptureUnavailable(format!("{}: {err}", path.display()))
        })?;
        let spec = reader.spec();
        let channels = spec.channels.max(1);

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()?,
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|sample| sample.map(|value| value as f32 / scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let mono = downmix(&interleaved, channels as usize);
        debug!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            channels,
            samples = mono.len(),
            "decoded wav input"
        );

        Ok(Self {
            inner: BufferFrameSource::new(mono, spec.sample_rate, frame_len),
            channels,
        })
    }

    /// Channel count of the file before downmixing.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn duration_seconds(&self) -> f64 {
        self.inner.duration_seconds()
    }
}

impl FrameSource for WavFrameSource {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn next_frame(&mut self) -> Result<Option<AudioFrame>> {
        self.inner.next_frame()
    }
}

/// Opens the configured capture device as a frame source. Builds without
/// the `live-input` feature have no device backend and always report
/// [`RhythmError::CaptureUnavailable`].
pub fn open_live_input(audio: &AudioConfig) -> Result<Box<dyn FrameSource + Send>> {
    #[cfg(feature = "live-input")]
    {
        let source = LiveInputSource::open(&audio.device_name, audio.block_size)?;
        Ok(Box::new(source))
    }
    #[cfg(not(feature = "live-input"))]
    {
        Err(RhythmError::CaptureUnavailable(format!(
            "no audio backend for input `{}` (built without the live-input feature)",
            audio.device_name
        )))
    }
}

pub(crate) fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Feeds frames from a source into an onset detector while owning the input
/// device.
#[derive(Debug)]
pub struct CaptureEngine {
    detector: OnsetDetector,
    device: InputDevice,
}

impl CaptureEngine {
    pub fn open(device_name: impl Into<String>, detector: OnsetDetector) -> Result<Self> {
        let device = InputDevice::acquire(device_name)?;
        Ok(Self { detector, device })
    }

    pub fn device(&self) -> &InputDevice {
        &self.device
    }

    pub fn process_frame(&mut self, frame: &AudioFrame) -> OnsetDecision {
        self.detector.ingest(&frame.samples, frame.timestamp)
    }

    /// Plays the source back in real time against `clock`, starting at
    /// `origin_nanos`, and forwards each accepted onset to `captures` as an
    /// absolute clock timestamp. Returns the number of onsets forwarded.
    /// Stops early when `stop` fires or the receiver goes away.
    pub fn stream<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
        clock: &dyn ClockSource,
        origin_nanos: u64,
        stop: &Receiver<()>,
        captures: &Sender<u64>,
    ) -> Result<usize> {
        self.detector.reset();
        let mut forwarded = 0;

        while let Some(frame) = source.next_frame()? {
            // A frame is complete once its last sample would have arrived.
            let frame_end = frame.timestamp + frame.samples.len() as f64 / source.sample_rate() as f64;
            let due = origin_nanos + seconds_to_nanos(frame_end);
            let now = clock.now_nanos();
            if due > now {
                match stop.recv_timeout(Duration::from_nanos(due - now)) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
            }

            if let Some(onset) = self.process_frame(&frame).onset() {
                let stamp = origin_nanos + seconds_to_nanos(onset.timestamp);
                if captures.send(stamp).is_err() {
                    warn!("capture receiver disconnected; stopping input stream");
                    break;
                }
                forwarded += 1;
            }
        }

        Ok(forwarded)
    }
}

#[cfg(test)]
pub(crate) static DEVICE_TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use hound::{WavSpec, WavWriter};
    use tempfile::tempdir;

    use super::*;
    use crate::{
        analysis::SpectralAnalyzer,
        clock::{ManualClock, MonotonicClock},
        onset::OnsetConfig,
    };

    const SAMPLE_RATE: u32 = 8_000;

    fn device_lock() -> MutexGuard<'static, ()> {
        DEVICE_TEST_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn detector() -> OnsetDetector {
        OnsetDetector::new(
            OnsetConfig::default(),
            SpectralAnalyzer::with_frame_len(SAMPLE_RATE, 256),
        )
    }

    /// Silence with short 400 Hz bursts starting at each of `hits` seconds.
    fn clicks(hits: &[f64], seconds: f64) -> Vec<f32> {
        let mut samples = vec![0.0f32; (seconds * SAMPLE_RATE as f64) as usize];
        for hit in hits {
            let start = (hit * SAMPLE_RATE as f64) as usize;
            for i in 0..400 {
                if let Some(sample) = samples.get_mut(start + i) {
                    *sample = 0.8 * (2.0 * PI * 400.0 * i as f32 / SAMPLE_RATE as f32).sin();
                }
            }
        }
        samples
    }

    #[test]
    fn device_is_exclusive_until_released() {
        let _serial = device_lock();

        let first = InputDevice::acquire("practice").unwrap();
        match InputDevice::acquire("calibration") {
            Err(RhythmError::DeviceBusy { holder }) => assert_eq!(holder, "practice"),
            other => panic!("expected busy device, got {other:?}"),
        }

        drop(first);
        let second = InputDevice::acquire("calibration").unwrap();
        assert_eq!(second.holder(), "calibration");
    }

    #[test]
    fn buffer_source_chunks_with_timestamps() {
        let mut source = BufferFrameSource::new(vec![0.0; 10], 4, 4);
        let mut stamps = Vec::new();
        let mut lengths = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            stamps.push(frame.timestamp);
            lengths.push(frame.samples.len());
        }
        assert_eq!(stamps, vec![0.0, 1.0, 2.0]);
        assert_eq!(lengths, vec![4, 4, 2]);
    }

    #[test]
    fn wav_source_downmixes_int_samples() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..300 {
            writer.write_sample(i16::MAX / 2).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut source = WavFrameSource::open(&path, 256).unwrap();
        assert_eq!(source.channels(), 2);
        assert_eq!(source.sample_rate(), SAMPLE_RATE);

        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.samples.len(), 256);
        assert!((frame.samples[0] - 0.25).abs() < 1e-3);
        let tail = source.next_frame().unwrap().unwrap();
        assert_eq!(tail.samples.len(), 44);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn missing_recording_reports_capture_unavailable() {
        let dir = tempdir().unwrap();
        let err = WavFrameSource::open(&dir.path().join("absent.wav"), 256).unwrap_err();
        assert!(matches!(err, RhythmError::CaptureUnavailable(_)));
        assert!(err.is_capture_unavailable());
    }

    #[test]
    fn detects_recorded_hits_frame_by_frame() {
        let _serial = device_lock();
        let dir = tempdir().unwrap();
        let path = dir.path().join("hits.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for sample in clicks(&[0.256, 0.768, 1.28], 1.6) {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();

        let mut source = WavFrameSource::open(&path, 256).unwrap();
        let mut engine = CaptureEngine::open("wav-test", detector()).unwrap();
        assert_eq!(engine.device().holder(), "wav-test");

        let mut stamps = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            if let Some(onset) = engine.process_frame(&frame).onset() {
                stamps.push(onset.timestamp);
            }
        }
        assert_eq!(stamps, vec![0.256, 0.768, 1.28]);
    }

    #[cfg(not(feature = "live-input"))]
    #[test]
    fn live_input_without_a_backend_is_unavailable() {
        let audio = AudioConfig::default();
        let err = open_live_input(&audio).err().expect("no backend compiled in");
        assert!(err.is_capture_unavailable());
        assert!(err.to_string().contains(&audio.device_name));
    }

    #[test]
    fn second_capture_engine_is_refused() {
        let _serial = device_lock();
        let _first = CaptureEngine::open("one", detector()).unwrap();
        let err = CaptureEngine::open("two", detector()).unwrap_err();
        assert!(err.is_capture_unavailable());
    }

    #[test]
    fn streams_onsets_as_clock_timestamps() {
        let _serial = device_lock();
        let clock = MonotonicClock::new();
        let (_stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (tx, rx) = crossbeam_channel::unbounded();

        let mut source = BufferFrameSource::new(clicks(&[0.512], 0.6), SAMPLE_RATE, 256);
        let mut engine = CaptureEngine::open("stream-test", detector()).unwrap();
        let origin = clock.now_nanos();
        let forwarded = engine
            .stream(&mut source, &clock, origin, &stop_rx, &tx)
            .unwrap();

        assert_eq!(forwarded, 1);
        assert_eq!(rx.try_recv().unwrap(), origin + 512_000_000);
        // Playback is paced by the clock.
        assert!(clock.now_nanos() - origin >= 590_000_000);
    }

    #[test]
    fn stop_signal_ends_streaming_early() {
        let _serial = device_lock();
        let clock = ManualClock::new();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (tx, rx) = crossbeam_channel::unbounded();
        stop_tx.send(()).unwrap();

        let mut source = BufferFrameSource::new(clicks(&[0.0], 5.0), SAMPLE_RATE, 256);
        let mut engine = CaptureEngine::open("stop-test", detector()).unwrap();
        let forwarded = engine
            .stream(&mut source, &clock, 0, &stop_rx, &tx)
            .unwrap();

        assert_eq!(forwarded, 0);
        assert!(rx.try_recv().is_err());
    }
}
