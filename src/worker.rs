use crossbeam_channel::{bounded, Receiver, Sender};
use log::warn;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::block_convolver::BlockConvolver;
use crate::fft::Context;
use crate::filter::Filter;
use crate::fractional;
use crate::Sample;

/// Parameters staged by the manager and consumed by the worker thread at
/// the start of its next processed block.
pub(crate) struct ParameterUpdate {
    pub gain: f64,
    pub delay: f64,
    pub hq: bool,
    pub filter: Option<Arc<Filter>>,
}

struct Job {
    input: Vec<Sample>,
    output: Vec<Sample>,
    zero_blocks: u32,
    update: Option<ParameterUpdate>,
}

/// Audio-thread half of one per-channel convolver. The processing half
/// runs on its own thread; the two halves exchange a single job buffer
/// over a pair of rendezvous channels, which doubles as the start/done
/// signalling and as the publication point for parameter updates.
pub(crate) struct Worker {
    zero_blocks: u32,
    max_zero_blocks: u32,
    job: Option<Job>,
    started: bool,
    pending_update: Option<ParameterUpdate>,
    job_tx: Option<Sender<Job>>,
    done_rx: Receiver<Job>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn new(
        context: &Arc<Context>,
        partitions: usize,
        max_extra_delay: usize,
        fixed: Option<(Arc<Filter>, f64)>,
    ) -> Self {
        let block_size = context.block_size();
        let max_zero_blocks =
            (partitions + (max_extra_delay + block_size - 1) / block_size + 1) as u32;

        let (job_tx, job_rx) = bounded::<Job>(1);
        let (done_tx, done_rx) = bounded::<Job>(1);

        let state = WorkerState::new(context, partitions, max_extra_delay, fixed);
        let thread = thread::spawn(move || state.run(job_rx, done_tx));

        Self {
            zero_blocks: 0,
            max_zero_blocks,
            job: Some(Job {
                input: vec![0.; block_size],
                output: vec![0.; block_size],
                zero_blocks: 0,
                update: None,
            }),
            started: false,
            pending_update: None,
            job_tx: Some(job_tx),
            done_rx,
            thread: Some(thread),
        }
    }

    /// Stage parameters for the next processed block, replacing any update
    /// that has not been delivered yet.
    pub(crate) fn stage_update(&mut self, update: ParameterUpdate) {
        self.pending_update = Some(update);
    }

    /// Whether audio is still in flight anywhere in this worker's chain
    /// (convolver history or tail delay line).
    pub(crate) fn is_processing(&self) -> bool {
        self.zero_blocks < self.max_zero_blocks
    }

    /// De-interleave one block from `input` and hand it to the processing
    /// thread. Never blocks. After enough consecutive silent blocks the
    /// hand-off is skipped entirely and the tick is a no-op.
    pub(crate) fn start(&mut self, input: &[Sample], offset: usize, stride: usize) {
        let Some(mut job) = self.job.take() else {
            return;
        };

        let mut nonzero = false;
        for (n, slot) in job.input.iter_mut().enumerate() {
            let sample = input[offset + n * stride];
            *slot = sample;
            nonzero |= sample != 0.0;
        }

        if nonzero {
            self.zero_blocks = 0;
        } else if self.zero_blocks < self.max_zero_blocks {
            self.zero_blocks += 1;
        }

        if self.zero_blocks < self.max_zero_blocks {
            job.zero_blocks = self.zero_blocks;
            job.update = self.pending_update.take();
            match &self.job_tx {
                Some(tx) => match tx.send(job) {
                    Ok(()) => self.started = true,
                    Err(returned) => {
                        warn!("convolver thread is gone, dropping block");
                        self.job = Some(returned.into_inner());
                    }
                },
                None => self.job = Some(job),
            }
        } else {
            self.job = Some(job);
        }
    }

    /// Wait for the processing thread (only if this tick was started) and
    /// accumulate its output block, scaled, into the interleaved output.
    pub(crate) fn end(&mut self, output: &mut [Sample], offset: usize, stride: usize, scale: Sample) {
        if !self.started {
            return;
        }
        self.started = false;

        match self.done_rx.recv() {
            Ok(job) => {
                for (n, sample) in job.output.iter().enumerate() {
                    output[offset + n * stride] += sample * scale;
                }
                self.job = Some(job);
            }
            Err(_) => warn!("convolver thread is gone, output block lost"),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // closing the job channel stops the processing loop
        self.job_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Processing-thread half: block convolver plus the tail delay line with
/// gain and fractional-delay ramping.
struct WorkerState {
    block_size: usize,
    partitions: usize,
    convolver: BlockConvolver,
    active_filter: Option<Arc<Filter>>,
    target_filter: Option<Arc<Filter>>,
    accepts_filters: bool,
    delay_line: Vec<Sample>,
    delay_pos: usize,
    max_delay: f64,
    prev_gain: f64,
    prev_delay: f64,
    gain: f64,
    delay: f64,
    hq: bool,
}

impl WorkerState {
    fn new(
        context: &Arc<Context>,
        partitions: usize,
        max_extra_delay: usize,
        fixed: Option<(Arc<Filter>, f64)>,
    ) -> Self {
        let block_size = context.block_size();
        // one working block plus the delay headroom, whole blocks
        let delay_len = (1 + (max_extra_delay + block_size - 1) / block_size) * block_size;
        let max_delay =
            (delay_len as f64 - block_size as f64 - 1.0 - fractional::additional_delay() as f64)
                .max(0.0);

        let mut convolver = BlockConvolver::new(context, partitions);
        let mut active_filter = None;
        let mut accepts_filters = true;
        let mut delay = 0.0;
        if let Some((filter, fixed_delay)) = fixed {
            match convolver.set_filter(filter.clone()) {
                Ok(()) => active_filter = Some(filter),
                Err(err) => warn!("fixed convolver filter rejected: {err}"),
            }
            accepts_filters = false;
            delay = fixed_delay;
        }

        Self {
            block_size,
            partitions,
            convolver,
            active_filter,
            target_filter: None,
            accepts_filters,
            delay_line: vec![0.; delay_len],
            delay_pos: 0,
            max_delay,
            prev_gain: 1.0,
            prev_delay: 0.0,
            gain: 1.0,
            delay,
            hq: true,
        }
    }

    fn run(mut self, jobs: Receiver<Job>, done: Sender<Job>) {
        while let Ok(mut job) = jobs.recv() {
            if let Some(update) = job.update.take() {
                self.apply(update);
            }
            self.process(&job.input, &mut job.output, job.zero_blocks);
            if done.send(job).is_err() {
                break;
            }
        }
    }

    fn apply(&mut self, update: ParameterUpdate) {
        self.gain = update.gain;
        self.delay = update.delay;
        self.hq = update.hq;
        if self.accepts_filters {
            if let Some(filter) = update.filter {
                self.target_filter = Some(filter);
            }
        }
    }

    fn sync_filter(&mut self) {
        let Some(target) = self.target_filter.clone() else {
            return;
        };
        let unchanged = self
            .active_filter
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, &target));
        if unchanged {
            return;
        }

        // first filter takes effect directly, later ones are crossfaded
        let result = if self.active_filter.is_none() {
            self.convolver.set_filter(target.clone())
        } else {
            self.convolver.crossfade_filter(target.clone())
        };
        match result {
            Ok(()) => self.active_filter = Some(target),
            Err(err) => warn!("rejecting filter swap: {err}"),
        }
    }

    fn process(&mut self, input: &[Sample], output: &mut [Sample], zero_blocks: u32) {
        let block_size = self.block_size;
        let delay_len = self.delay_line.len();

        // the convolver only has work while input may still be in its
        // history window
        if (zero_blocks as usize) < self.partitions {
            self.sync_filter();
            let dest = &mut self.delay_line[self.delay_pos..self.delay_pos + block_size];
            self.convolver.filter_block(input, dest);
        } else {
            self.delay_line[self.delay_pos..self.delay_pos + block_size].fill(0.);
        }

        // ramp gain and delay linearly across the block so parameter
        // changes cannot click
        let gain = self.gain;
        let delay = self.delay.min(self.max_delay);
        let pos1 = (self.delay_pos + delay_len) as f64 - self.prev_delay;
        let pos2 = (self.delay_pos + block_size + delay_len) as f64 - delay;
        let step = 1.0 / block_size as f64;

        for (n, slot) in output.iter_mut().enumerate() {
            let b = n as f64 * step;
            let a = 1.0 - b;
            let pos = a * pos1 + b * pos2;
            let g = a * self.prev_gain + b * gain;
            let sample = if self.hq {
                fractional::read(&self.delay_line, pos)
            } else {
                self.delay_line[pos as usize % delay_len]
            };
            *slot = (g * sample as f64) as Sample;
        }

        self.delay_pos = (self.delay_pos + block_size) % delay_len;
        self.prev_delay = delay;
        self.prev_gain = gain;
    }
}
