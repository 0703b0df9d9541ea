use hound::{SampleFormat, WavReader};
use log::debug;
use std::io::BufRead;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::Sample;

/// Per-IR delay, in samples. The dynamic part is subject to the manager's
/// delay scale, the fixed part is not.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IrDelay {
    pub dynamic: f64,
    pub fixed: f64,
}

/// Uniform batch of impulse responses as delivered by any source adapter:
/// `count` rows of `ir_length` samples, contiguous and row-major, plus
/// optional per-IR delays already converted to samples.
pub struct IrBatch {
    pub sample_rate: f64,
    pub ir_length: usize,
    pub count: usize,
    pub samples: Vec<Sample>,
    pub delays: Option<Vec<IrDelay>>,
}

pub trait IrSource {
    fn load(&self) -> Result<IrBatch>;
}

/// IR batch backed by a WAV file: channel `c` of the file is IR `c`.
pub struct WavIrSource {
    path: PathBuf,
}

impl WavIrSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IrSource for WavIrSource {
    fn load(&self) -> Result<IrBatch> {
        let mut reader = WavReader::open(&self.path)?;
        let spec = reader.spec();
        let channels = spec.channels as usize;
        if channels == 0 {
            return Err(Error::IrLoadFailed(format!(
                "{} has no channels",
                self.path.display()
            )));
        }

        // normalize integer PCM to f32, keep processing in f32
        let interleaved: Vec<Sample> = if spec.sample_format == SampleFormat::Float {
            reader.samples::<f32>().collect::<std::result::Result<_, _>>()?
        } else {
            let max_val = 2.0f32.powi(spec.bits_per_sample as i32 - 1);
            reader
                .samples::<i32>()
                .map(|s| s.map(|x| x as f32 / max_val))
                .collect::<std::result::Result<_, _>>()?
        };

        let frames = interleaved.len() / channels;
        if frames == 0 {
            return Err(Error::IrLoadFailed(format!(
                "{} is empty",
                self.path.display()
            )));
        }

        let mut samples = vec![0.; channels * frames];
        for frame in 0..frames {
            for channel in 0..channels {
                samples[channel * frames + frame] = interleaved[frame * channels + channel];
            }
        }

        Ok(IrBatch {
            sample_rate: spec.sample_rate as f64,
            ir_length: frames,
            count: channels,
            samples,
            delays: None,
        })
    }
}

/// Dimensions of a SOFA measurement set. IRs and delays are stored as a
/// 3-D array indexed measurement, receiver, emitter; the linear order of
/// the batch iterates in exactly that nesting.
#[derive(Clone, Copy, Debug)]
pub struct SofaLayout {
    pub measurements: usize,
    pub receivers: usize,
    pub emitters: usize,
    /// Number of delay measurements; may be smaller than `measurements`,
    /// in which case delay lookups wrap.
    pub delay_measurements: usize,
}

impl SofaLayout {
    pub fn index(&self, measurement: usize, receiver: usize, emitter: usize) -> usize {
        measurement * self.receivers * self.emitters + receiver * self.emitters + emitter
    }

    pub fn count(&self) -> usize {
        self.measurements * self.receivers * self.emitters
    }
}

/// IR batch over the decoded contents of a SOFA container. Raw delays are
/// given in seconds; on load they are converted to samples and split into
/// a fixed part (the mean over all measurements and receivers of that
/// emitter) and a dynamic remainder, so that delay scaling moves each IR
/// relative to its emitter's mean time of arrival.
pub struct SofaIrSource {
    pub sample_rate: f64,
    pub ir_length: usize,
    pub layout: SofaLayout,
    /// `layout.count()` rows of `ir_length` samples in linear index order.
    pub samples: Vec<Sample>,
    /// Raw delays in seconds, `delay_measurements * receivers * emitters`.
    pub delays: Option<Vec<f64>>,
}

impl IrSource for SofaIrSource {
    fn load(&self) -> Result<IrBatch> {
        let count = self.layout.count();
        if self.samples.len() < count * self.ir_length {
            return Err(Error::IrLoadFailed(format!(
                "SOFA data too short: {} samples for {count} x {}",
                self.samples.len(),
                self.ir_length
            )));
        }

        let delay_count =
            self.layout.delay_measurements * self.layout.receivers * self.layout.emitters;
        if let Some(raw) = &self.delays {
            if raw.len() < delay_count {
                return Err(Error::IrLoadFailed(format!(
                    "SOFA delays too short: {} values for {delay_count}",
                    raw.len()
                )));
            }
        }
        let delays = self
            .delays
            .as_ref()
            .map(|raw| split_emitter_delays(&self.layout, raw, self.sample_rate));

        Ok(IrBatch {
            sample_rate: self.sample_rate,
            ir_length: self.ir_length,
            count,
            samples: self.samples[..count * self.ir_length].to_vec(),
            delays,
        })
    }
}

/// Convert raw SOFA delays (seconds) to sample-domain dynamic/fixed pairs.
/// The fixed part of every IR of emitter `e` is the mean delay of that
/// emitter; the dynamic part is the per-measurement deviation from it.
pub fn split_emitter_delays(
    layout: &SofaLayout,
    raw_seconds: &[f64],
    sample_rate: f64,
) -> Vec<IrDelay> {
    let delay_measurements = layout.delay_measurements.max(1);
    let mut raw = Vec::with_capacity(layout.count());
    let mut sums = vec![0.0; layout.emitters];

    for measurement in 0..layout.measurements {
        for receiver in 0..layout.receivers {
            for emitter in 0..layout.emitters {
                let index = layout.index(measurement % delay_measurements, receiver, emitter);
                let delay = raw_seconds[index] * sample_rate;
                raw.push(delay);
                sums[emitter] += delay;
            }
        }
    }

    let per_emitter = (layout.measurements * layout.receivers) as f64;
    let means: Vec<f64> = sums.iter().map(|sum| sum / per_emitter).collect();

    raw.iter()
        .enumerate()
        .map(|(i, &delay)| {
            let emitter = i % layout.emitters;
            IrDelay {
                dynamic: delay - means[emitter],
                fixed: means[emitter],
            }
        })
        .collect()
}

/// Parse per-IR delay pairs from text: one `<dynamic> <static>` pair per
/// line, whitespace separated, values in samples. Further tokens on a
/// line are ignored, lines that do not start with two numbers are
/// skipped.
pub fn read_ir_delays<R: BufRead>(reader: R) -> Vec<IrDelay> {
    let mut delays = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let mut tokens = line.split_whitespace();
        let (Some(first), Some(second)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        match (first.parse::<f64>(), second.parse::<f64>()) {
            (Ok(dynamic), Ok(fixed)) => delays.push(IrDelay { dynamic, fixed }),
            _ => debug!("skipping malformed delay line: {line}"),
        }
    }
    delays
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn delay_file_parsing() {
        let text = "1.5 2.5\n-3.0 0.0 extra tokens ignored\n\nnot a number\n4 5\n";
        let delays = read_ir_delays(Cursor::new(text));
        assert_eq!(
            delays,
            vec![
                IrDelay { dynamic: 1.5, fixed: 2.5 },
                IrDelay { dynamic: -3.0, fixed: 0.0 },
                IrDelay { dynamic: 4.0, fixed: 5.0 },
            ]
        );
    }

    #[test]
    fn emitter_delays_split_around_the_mean() {
        let layout = SofaLayout {
            measurements: 2,
            receivers: 1,
            emitters: 2,
            delay_measurements: 2,
        };
        // emitter 0 delays: 10ms, 20ms; emitter 1: 30ms, 30ms
        let raw = vec![0.010, 0.030, 0.020, 0.030];
        let delays = split_emitter_delays(&layout, &raw, 1000.0);

        assert_eq!(delays.len(), 4);
        // emitter 0 mean is 15 samples
        assert!((delays[0].fixed - 15.0).abs() < 1e-9);
        assert!((delays[0].dynamic - -5.0).abs() < 1e-9);
        assert!((delays[2].fixed - 15.0).abs() < 1e-9);
        assert!((delays[2].dynamic - 5.0).abs() < 1e-9);
        // emitter 1 is constant, so fully static
        assert!((delays[1].fixed - 30.0).abs() < 1e-9);
        assert!(delays[1].dynamic.abs() < 1e-9);
        assert!(delays[3].dynamic.abs() < 1e-9);
    }

    #[test]
    fn fewer_delay_measurements_wrap() {
        let layout = SofaLayout {
            measurements: 4,
            receivers: 1,
            emitters: 1,
            delay_measurements: 2,
        };
        let raw = vec![0.001, 0.003];
        let delays = split_emitter_delays(&layout, &raw, 1000.0);
        assert_eq!(delays.len(), 4);
        // measurements 0 and 2 share a delay, as do 1 and 3
        assert_eq!(delays[0], delays[2]);
        assert_eq!(delays[1], delays[3]);
        assert!((delays[0].fixed - 2.0).abs() < 1e-9);
        assert!((delays[0].dynamic - -1.0).abs() < 1e-9);
    }

    #[test]
    fn wav_source_round_trip() {
        let path = std::env::temp_dir().join(format!(
            "auralize_wav_source_{}.wav",
            std::process::id()
        ));
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for frame in 0..64i32 {
            writer.write_sample((frame * 256) as i16).unwrap();
            writer.write_sample(-(frame * 128) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let batch = WavIrSource::new(&path).load().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(batch.count, 2);
        assert_eq!(batch.ir_length, 64);
        assert_eq!(batch.sample_rate, 48000.0);
        assert!(batch.delays.is_none());
        // channel 0 ramps up, channel 1 ramps down
        assert!((batch.samples[1] - 256.0 / 32768.0).abs() < 1e-6);
        assert!((batch.samples[64 + 1] + 128.0 / 32768.0).abs() < 1e-6);

        assert!(matches!(
            WavIrSource::new("/nonexistent/irs.wav").load(),
            Err(Error::IrLoadFailed(_))
        ));
    }
}
