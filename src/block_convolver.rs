use rustfft::num_complex::Complex;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fft::{complex_multiply_accumulate, Context, Fft};
use crate::filter::Filter;
use crate::Sample;

/// Streaming uniform partitioned convolver (overlap-save).
///
/// Keeps a ring of the last `partitions` input spectra; each block the
/// sliding window `[previous block | new block]` is transformed into the
/// ring, multiplied bin-wise against the filter partitions and the second
/// half of the inverse transform emitted. Swapping filters either takes
/// effect on the next block (`set_filter`) or is crossfaded linearly over
/// exactly one block (`crossfade_filter`).
#[derive(Clone)]
pub struct BlockConvolver {
    block_size: usize,
    partitions: usize,
    fft: Fft,
    history: Vec<Vec<Complex<Sample>>>,
    head: usize,
    prev_input: Vec<Sample>,
    fft_buffer: Vec<Sample>,
    conv: Vec<Complex<Sample>>,
    conv_fading: Vec<Complex<Sample>>,
    time: Vec<Sample>,
    time_fading: Vec<Sample>,
    current: Option<Arc<Filter>>,
    pending: Option<Arc<Filter>>,
}

impl BlockConvolver {
    pub fn new(context: &Context, partitions: usize) -> Self {
        let block_size = context.block_size();
        let spectrum_size = context.spectrum_size();
        Self {
            block_size,
            partitions,
            fft: context.fft().clone(),
            history: vec![vec![Complex::new(0., 0.); spectrum_size]; partitions],
            head: 0,
            prev_input: vec![0.; block_size],
            fft_buffer: vec![0.; context.fft_size()],
            conv: vec![Complex::new(0., 0.); spectrum_size],
            conv_fading: vec![Complex::new(0., 0.); spectrum_size],
            time: vec![0.; context.fft_size()],
            time_fading: vec![0.; context.fft_size()],
            current: None,
            pending: None,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Replace the filter outright; the next block is produced entirely
    /// with `filter`. Any pending crossfade is dropped.
    pub fn set_filter(&mut self, filter: Arc<Filter>) -> Result<()> {
        self.check(&filter)?;
        self.current = Some(filter);
        self.pending = None;
        Ok(())
    }

    /// Schedule a filter swap crossfaded linearly over the next block.
    /// Establishes the filter directly when none is set yet.
    pub fn crossfade_filter(&mut self, filter: Arc<Filter>) -> Result<()> {
        self.check(&filter)?;
        if self.current.is_none() {
            self.current = Some(filter);
        } else {
            self.pending = Some(filter);
        }
        Ok(())
    }

    fn check(&self, filter: &Filter) -> Result<()> {
        if filter.block_size() != self.block_size {
            return Err(Error::FilterMismatch {
                expected: self.block_size,
                got: filter.block_size(),
            });
        }
        Ok(())
    }

    /// Convolve one block. Without a filter the output is zeroed but the
    /// input history still advances, so a later filter starts against
    /// valid context.
    pub fn filter_block(&mut self, input: &[Sample], output: &mut [Sample]) {
        debug_assert_eq!(input.len(), self.block_size);
        debug_assert_eq!(output.len(), self.block_size);

        if self.partitions == 0 {
            output.fill(0.);
            return;
        }

        self.fft_buffer[..self.block_size].copy_from_slice(&self.prev_input);
        self.fft_buffer[self.block_size..].copy_from_slice(input);
        self.prev_input.copy_from_slice(input);

        self.head = (self.head + 1) % self.partitions;
        if self
            .fft
            .forward(&mut self.fft_buffer, &mut self.history[self.head])
            .is_err()
        {
            output.fill(0.);
            return;
        }

        let current = match &self.current {
            Some(filter) => filter.clone(),
            None => {
                output.fill(0.);
                return;
            }
        };

        accumulate(
            &mut self.conv,
            &self.history,
            self.head,
            self.partitions,
            &current,
        );
        if self.fft.inverse(&mut self.conv, &mut self.time).is_err() {
            output.fill(0.);
            return;
        }

        match self.pending.take() {
            None => output.copy_from_slice(&self.time[self.block_size..]),
            Some(pending) => {
                accumulate(
                    &mut self.conv_fading,
                    &self.history,
                    self.head,
                    self.partitions,
                    &pending,
                );
                if self
                    .fft
                    .inverse(&mut self.conv_fading, &mut self.time_fading)
                    .is_err()
                {
                    output.copy_from_slice(&self.time[self.block_size..]);
                    return;
                }

                let step = 1.0 / self.block_size as Sample;
                for n in 0..self.block_size {
                    let b = n as Sample * step;
                    let a = 1.0 - b;
                    output[n] = a * self.time[self.block_size + n]
                        + b * self.time_fading[self.block_size + n];
                }
                self.current = Some(pending);
            }
        }
    }
}

fn accumulate(
    conv: &mut [Complex<Sample>],
    history: &[Vec<Complex<Sample>>],
    head: usize,
    partitions: usize,
    filter: &Filter,
) {
    conv.fill(Complex::new(0., 0.));
    for k in 0..filter.partitions().min(partitions) {
        let index = (head + partitions - k) % partitions;
        complex_multiply_accumulate(conv, filter.spectrum(k), &history[index]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_with_unit_impulse() {
        let context = Context::new(128).unwrap();
        let mut response = [0.0; 256];
        response[0] = 1.0;
        let filter = Arc::new(Filter::new(&context, &response));
        let mut convolver = BlockConvolver::new(&context, filter.partitions());
        convolver.set_filter(filter).unwrap();

        let input = vec![1.0; 128];
        let mut output = vec![0.0; 128];
        for _ in 0..4 {
            convolver.filter_block(&input, &mut output);
            for sample in &output {
                assert!((sample - 1.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn without_filter_output_is_silent_but_history_advances() {
        let context = Context::new(64).unwrap();
        let mut convolver = BlockConvolver::new(&context, 2);

        let mut impulse = vec![0.0; 64];
        impulse[0] = 1.0;
        let mut output = vec![1.0; 64];
        convolver.filter_block(&impulse, &mut output);
        assert!(output.iter().all(|&x| x == 0.0));

        // the impulse fed before the filter was set is still in history,
        // so the second partition of the filter sees it
        let mut response = vec![0.0; 128];
        response[64] = 1.0;
        let filter = Arc::new(Filter::new(&context, &response));
        convolver.set_filter(filter).unwrap();
        convolver.filter_block(&vec![0.0; 64], &mut output);
        assert!((output[0] - 1.0).abs() < 1e-5);
        assert!(output[1..].iter().all(|&x| x.abs() < 1e-5));
    }

    #[test]
    fn mismatched_filter_is_rejected() {
        let context = Context::new(128).unwrap();
        let other = Context::new(256).unwrap();
        let filter = Arc::new(Filter::new(&other, &[1.0; 64]));
        let mut convolver = BlockConvolver::new(&context, 2);
        assert!(matches!(
            convolver.set_filter(filter),
            Err(Error::FilterMismatch {
                expected: 128,
                got: 256
            })
        ));
    }
}
