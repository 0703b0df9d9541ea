use log::{debug, error, info, warn};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fft::Context;
use crate::filter::{FadeWindow, Filter, FilterFade};
use crate::sources::{read_ir_delays, IrBatch, IrDelay, IrSource};
use crate::worker::{ParameterUpdate, Worker};
use crate::Sample;

/// Default headroom, in samples, for per-convolver delays. Bounds the
/// tail delay line of every worker and can be changed per manager while
/// no workers exist.
pub const DEFAULT_MAX_EXTRA_DELAY: usize = 2400;

#[derive(Clone, Copy)]
struct Parameters {
    ir_index: usize,
    gain: f64,
    extra_delay: f64,
    dirty: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            ir_index: 0,
            gain: 1.0,
            extra_delay: 0.0,
            dirty: true,
        }
    }
}

/// Precomputed fade/window data shared by a batch of fixed convolvers.
pub struct FixedConvolverData {
    sample_rate: f64,
    window: FadeWindow,
}

/// Owns the impulse response library, the per-IR delay table and a set of
/// per-channel convolver workers, and fans one audio tick out across all
/// of them.
///
/// Parameter changes are staged and take effect at the next tick,
/// interpolated across that block by the workers. The processing call
/// itself never fails: with no filters, no workers or all-silent input it
/// produces silence.
pub struct ConvolverManager {
    context: Arc<Context>,
    partitions: usize,
    filters: Vec<Arc<Filter>>,
    ir_delays: Vec<IrDelay>,
    workers: Vec<Worker>,
    parameters: Vec<Parameters>,
    delay_scale: f64,
    audio_scale: Sample,
    hq: bool,
    max_extra_delay: usize,
    create_sample_rate: f64,
    update_all: bool,
}

impl ConvolverManager {
    pub fn new(partition_size: usize) -> Result<Self> {
        Ok(Self {
            context: Arc::new(Context::new(partition_size)?),
            partitions: 0,
            filters: Vec::new(),
            ir_delays: Vec::new(),
            workers: Vec::new(),
            parameters: Vec::new(),
            delay_scale: 1.0,
            audio_scale: 1.0,
            hq: true,
            max_extra_delay: DEFAULT_MAX_EXTRA_DELAY,
            create_sample_rate: 48_000.0,
            update_all: true,
        })
    }

    /// Manager with its library loaded from `source` in one go.
    pub fn with_irs(
        source: &dyn IrSource,
        partition_size: usize,
        fade: &FilterFade,
    ) -> Result<Self> {
        let mut manager = Self::new(partition_size)?;
        manager.load_irs(source, fade)?;
        Ok(manager)
    }

    pub fn partition_size(&self) -> usize {
        self.context.block_size()
    }

    /// Change the partition size. Only allowed while no workers exist,
    /// since their delay lines and spectral history depend on it.
    pub fn set_partition_size(&mut self, partition_size: usize) -> Result<()> {
        if !self.workers.is_empty() {
            error!("cannot change partition size with active convolvers");
            return Err(Error::HasWorkers);
        }
        self.context = Arc::new(Context::new(partition_size)?);
        Ok(())
    }

    /// Change the delay headroom of workers created from now on.
    pub fn set_max_extra_delay(&mut self, samples: usize) -> Result<()> {
        if !self.workers.is_empty() {
            error!("cannot change delay headroom with active convolvers");
            return Err(Error::HasWorkers);
        }
        self.max_extra_delay = samples;
        Ok(())
    }

    /// Sample rate used to interpret fade times for in-memory IR data
    /// passed to [`create_irs`](Self::create_irs).
    pub fn set_create_sample_rate(&mut self, sample_rate: f64) {
        self.create_sample_rate = sample_rate;
    }

    pub fn num_irs(&self) -> usize {
        self.filters.len()
    }

    /// Approximate number of samples of audio the engine holds.
    pub fn samples_buffered(&self) -> usize {
        self.partition_size() * self.partitions + self.max_extra_delay
    }

    /// Whether the given convolver has seen audio recently enough that it
    /// still does work each tick.
    pub fn is_processing(&self, convolver: usize) -> bool {
        self.workers
            .get(convolver)
            .is_some_and(|worker| worker.is_processing())
    }

    /// Rebuild the filter library from an IR batch. On failure the library
    /// is left empty; the error is reported but never fatal.
    pub fn load_irs(&mut self, source: &dyn IrSource, fade: &FilterFade) -> Result<()> {
        self.filters.clear();
        let batch = match source.load() {
            Ok(batch) => batch,
            Err(err) => {
                error!("failed to load impulse responses: {err}");
                return Err(err);
            }
        };
        self.install_batch(&batch, fade);
        Ok(())
    }

    /// Rebuild the filter library from contiguous in-memory IR data,
    /// `count` responses of `ir_length` samples each. Fade times are
    /// interpreted at the manager's create sample rate.
    pub fn create_irs(
        &mut self,
        samples: &[Sample],
        count: usize,
        ir_length: usize,
        fade: &FilterFade,
    ) {
        if samples.len() < count * ir_length {
            error!(
                "IR data too short: {} samples for {count} x {ir_length}",
                samples.len()
            );
            self.filters.clear();
            return;
        }
        let batch = IrBatch {
            sample_rate: self.create_sample_rate,
            ir_length,
            count,
            samples: samples[..count * ir_length].to_vec(),
            delays: None,
        };
        self.install_batch(&batch, fade);
    }

    fn install_batch(&mut self, batch: &IrBatch, fade: &FilterFade) {
        self.filters.clear();
        if batch.count == 0 || batch.ir_length == 0 {
            warn!("empty IR batch, library cleared");
            return;
        }

        let window = fade.window(batch.sample_rate, batch.ir_length);
        self.partitions = window.partitions(self.partition_size());

        info!(
            "building {} filters, {} samples each, {} partitions",
            batch.count,
            window.len(),
            self.partitions
        );

        let mut response = vec![0.; window.len()];
        for i in 0..batch.count {
            let offset = i * batch.ir_length + window.start();
            response.copy_from_slice(&batch.samples[offset..offset + window.len()]);
            window.apply(&mut response);
            self.filters.push(Arc::new(Filter::new(&self.context, &response)));
        }

        if let Some(delays) = &batch.delays {
            self.ir_delays = delays.clone();
        }
        self.update_all = true;
    }

    /// Read per-IR delay pairs (dynamic, static; in samples) from a text
    /// file. Existing delays are cleared first; an unreadable file is not
    /// an error and simply leaves them empty.
    pub fn load_ir_delays(&mut self, path: &Path) {
        self.ir_delays.clear();
        match std::fs::File::open(path) {
            Ok(file) => {
                self.ir_delays = read_ir_delays(BufReader::new(file));
                info!(
                    "loaded {} IR delays from {}",
                    self.ir_delays.len(),
                    path.display()
                );
                self.update_all = true;
            }
            Err(err) => debug!("no IR delay file {}: {err}", path.display()),
        }
    }

    /// Install per-IR delays directly, in samples. The dynamic part is
    /// scaled by the delay scale at parameter-update time, the static
    /// part is not.
    pub fn set_ir_delays(&mut self, dynamic: &[f64], fixed: &[f64]) {
        self.ir_delays = dynamic
            .iter()
            .zip(fixed)
            .map(|(&dynamic, &fixed)| IrDelay { dynamic, fixed })
            .collect();
        self.update_all = true;
    }

    /// Scale applied to the dynamic part of every IR delay, e.g. to widen
    /// or narrow interaural time differences.
    pub fn set_delay_scale(&mut self, scale: f64) {
        self.delay_scale = scale;
        self.update_all = true;
    }

    /// Toggle windowed-sinc fractional-delay reads on every worker.
    pub fn enable_hq_processing(&mut self, enable: bool) {
        self.hq = enable;
        self.update_all = true;
    }

    /// Scale applied to every convolver's output when mixing.
    pub fn set_audio_scale(&mut self, scale: Sample) {
        if scale > 0. {
            self.audio_scale = scale;
        }
    }

    /// Short-window RMS peak of a filter, usable to derive an audio scale
    /// that keeps the loudest filter at unity.
    pub fn filter_level(data: &[Sample], window: usize) -> Sample {
        let window = window.max(1);
        let mut sum = 0.0f32;
        let mut max = 0.0f32;
        for i in 0..data.len() {
            sum += data[i] * data[i];
            if i >= window {
                sum -= data[i - window] * data[i - window];
            }
            max = max.max(sum);
        }
        (max / window.min(data.len().max(1)) as Sample).sqrt()
    }

    /// Create or destroy workers until `count` are running. New workers
    /// start on IR 0 with unity gain and no extra delay.
    pub fn set_convolver_count(&mut self, count: usize) {
        self.parameters.resize_with(count, Parameters::default);

        while self.workers.len() < count {
            self.workers.push(Worker::new(
                &self.context,
                self.partitions,
                self.max_extra_delay,
                None,
            ));
            let index = self.workers.len() - 1;
            if let Err(err) = self.select_ir(index, 0, 1.0, 0.0) {
                debug!("convolver {index} created without an IR: {err}");
            }
        }
        self.workers.truncate(count);
    }

    pub fn num_convolvers(&self) -> usize {
        self.workers.len()
    }

    /// Route IR `ir` to convolver `convolver` with the given gain and
    /// additional delay (in samples). Takes effect at the next tick; a
    /// changed IR is crossfaded in over one block.
    pub fn select_ir(
        &mut self,
        convolver: usize,
        ir: usize,
        gain: f64,
        extra_delay: f64,
    ) -> Result<()> {
        if convolver >= self.workers.len() {
            error!("convolver {convolver} out of range");
            return Err(Error::OutOfRange {
                kind: "convolver",
                index: convolver,
                len: self.workers.len(),
            });
        }
        if ir >= self.filters.len() {
            error!("IR {ir} out of range");
            return Err(Error::OutOfRange {
                kind: "IR",
                index: ir,
                len: self.filters.len(),
            });
        }

        let params = &mut self.parameters[convolver];
        params.ir_index = ir;
        params.gain = gain;
        params.extra_delay = extra_delay;
        params.dirty = true;
        Ok(())
    }

    fn update_worker_parameters(&mut self, index: usize) {
        self.parameters[index].dirty = false;
        let params = self.parameters[index];
        if params.ir_index >= self.filters.len() {
            return;
        }

        let ir_delay = self
            .ir_delays
            .get(params.ir_index)
            .map(|delay| delay.fixed + delay.dynamic * self.delay_scale)
            .unwrap_or(0.0);

        self.workers[index].stage_update(ParameterUpdate {
            gain: params.gain,
            delay: ir_delay + params.extra_delay,
            hq: self.hq,
            filter: Some(self.filters[params.ir_index].clone()),
        });
    }

    /// Run one tick of `partition_size` frames: start every worker (in
    /// index order, each on its input channel), then collect and mix every
    /// output (again in index order).
    ///
    /// `input` is interleaved with `in_channels` channels, `output` with
    /// `out_channels`; worker `i` reads channel `i / out_channels` and
    /// accumulates onto channel `i % out_channels`. The output buffer is
    /// expected to be zeroed by the caller.
    pub fn convolve(
        &mut self,
        input: &[Sample],
        output: &mut [Sample],
        in_channels: usize,
        out_channels: usize,
    ) {
        if out_channels == 0 {
            return;
        }
        debug_assert!(input.len() >= self.partition_size() * in_channels);
        debug_assert!(output.len() >= self.partition_size() * out_channels);

        for i in 0..self.workers.len() {
            if self.update_all || self.parameters[i].dirty {
                self.update_worker_parameters(i);
            }
            self.workers[i].start(input, i / out_channels, in_channels);
        }
        self.update_all = false;

        for i in 0..self.workers.len() {
            self.workers[i].end(output, i % out_channels, out_channels, self.audio_scale);
        }
    }

    /// Prepare the shared fade/window data for a batch of fixed
    /// convolvers. Any existing workers are removed.
    pub fn prepare_fixed_convolvers(
        &mut self,
        ir_length: usize,
        sample_rate: f64,
        fade: &FilterFade,
    ) -> FixedConvolverData {
        if !self.workers.is_empty() {
            warn!("removing existing convolvers for fixed set");
            self.workers.clear();
        }
        self.parameters.clear();

        let window = fade.window(sample_rate, ir_length);
        self.partitions = window.partitions(self.partition_size());

        FixedConvolverData {
            sample_rate,
            window,
        }
    }

    /// Append one fixed convolver: its filter is built from `ir` with the
    /// prepared fade and its delay (given in seconds) is baked in. Fixed
    /// convolvers ignore later filter selection but still follow gain,
    /// delay-scale and quality changes.
    pub fn create_fixed_convolver(
        &mut self,
        ir: &[Sample],
        delay_seconds: f64,
        data: &FixedConvolverData,
    ) {
        let start = data.window.start().min(ir.len());
        let end = (start + data.window.len()).min(ir.len());
        let mut response = vec![0.; data.window.len()];
        response[..end - start].copy_from_slice(&ir[start..end]);
        data.window.apply(&mut response);

        let filter = Arc::new(Filter::new(&self.context, &response));
        self.filters.push(filter.clone());

        let delay = delay_seconds * data.sample_rate;
        self.parameters.push(Parameters {
            ir_index: self.filters.len() - 1,
            gain: 1.0,
            extra_delay: delay,
            dirty: false,
        });
        self.workers.push(Worker::new(
            &self.context,
            self.partitions,
            self.max_extra_delay,
            Some((filter, delay)),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_size_is_locked_by_workers() {
        let mut manager = ConvolverManager::new(128).unwrap();
        manager.create_irs(&[1.0; 256], 1, 256, &FilterFade::default());
        manager.set_convolver_count(1);
        assert!(matches!(
            manager.set_partition_size(256),
            Err(Error::HasWorkers)
        ));
        assert!(matches!(
            manager.set_max_extra_delay(0),
            Err(Error::HasWorkers)
        ));

        manager.set_convolver_count(0);
        assert!(manager.set_partition_size(256).is_ok());
        assert_eq!(manager.partition_size(), 256);
    }

    #[test]
    fn select_ir_validates_both_indices() {
        let mut manager = ConvolverManager::new(128).unwrap();
        manager.create_irs(&[1.0; 256], 2, 128, &FilterFade::default());
        manager.set_convolver_count(1);

        assert!(manager.select_ir(0, 1, 1.0, 0.0).is_ok());
        assert!(matches!(
            manager.select_ir(1, 0, 1.0, 0.0),
            Err(Error::OutOfRange { kind: "convolver", .. })
        ));
        assert!(matches!(
            manager.select_ir(0, 2, 1.0, 0.0),
            Err(Error::OutOfRange { kind: "IR", .. })
        ));
    }

    #[test]
    fn convolve_with_nothing_loaded_is_silent() {
        let mut manager = ConvolverManager::new(128).unwrap();
        manager.set_convolver_count(2);
        let input = vec![1.0; 256];
        let mut output = vec![0.0; 256];
        manager.convolve(&input, &mut output, 2, 2);
        assert!(output.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn filter_level_tracks_the_loudest_window() {
        let mut data = vec![0.0; 2000];
        for x in data[1000..1480].iter_mut() {
            *x = 0.5;
        }
        let level = ConvolverManager::filter_level(&data, 480);
        assert!((level - 0.5).abs() < 1e-3);

        let quiet = ConvolverManager::filter_level(&vec![0.0; 2000], 480);
        assert_eq!(quiet, 0.0);
    }
}
