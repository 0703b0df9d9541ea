use rustfft::num_complex::Complex;
use std::f64::consts::PI;

use crate::fft::{copy_and_pad, Context};
use crate::Sample;

/// Frequency-domain representation of one impulse response: `partitions`
/// half spectra, one per block-sized segment of the IR, each zero-padded
/// to the context's FFT size before transforming. Immutable once built and
/// shared between the manager's library and the workers referencing it.
pub struct Filter {
    block_size: usize,
    spectra: Vec<Vec<Complex<Sample>>>,
}

impl Filter {
    pub fn new(context: &Context, ir: &[Sample]) -> Self {
        let block_size = context.block_size();
        let partitions = (ir.len() + block_size - 1) / block_size;
        let mut fft_buffer = vec![0.; context.fft_size()];
        let mut spectra = Vec::with_capacity(partitions);

        for i in 0..partitions {
            let remaining = ir.len() - i * block_size;
            let size_copy = remaining.min(block_size);
            copy_and_pad(&mut fft_buffer, &ir[i * block_size..], size_copy);
            let mut spectrum = vec![Complex::new(0., 0.); context.spectrum_size()];
            context.fft().forward(&mut fft_buffer, &mut spectrum).unwrap();
            spectra.push(spectrum);
        }

        Self {
            block_size,
            spectra,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn partitions(&self) -> usize {
        self.spectra.len()
    }

    pub(crate) fn spectrum(&self, partition: usize) -> &[Complex<Sample>] {
        &self.spectra[partition]
    }
}

/// Fade profile applied while building filters, all times in seconds.
/// The defaults select the whole IR with no fade. A non-zero fade-out
/// window also truncates the filter, so a fade can be used to cut a
/// usable subset out of long measured responses.
#[derive(Clone, Copy, Debug, Default)]
pub struct FilterFade {
    pub fade_in_start: f64,
    pub fade_in_length: f64,
    pub fade_out_start: f64,
    pub fade_out_length: f64,
}

impl FilterFade {
    /// Resolve the fade against a concrete sample rate and IR length.
    pub(crate) fn window(&self, sample_rate: f64, ir_length: usize) -> FadeWindow {
        let start = ((self.fade_in_start.max(0.0) * sample_rate).floor() as usize).min(ir_length);

        let len = if self.fade_out_start + self.fade_out_length == 0.0 {
            ir_length - start
        } else {
            let len = ((self.fade_out_start + self.fade_out_length - self.fade_in_start).max(0.0)
                * sample_rate)
                .ceil() as usize;
            len.min(ir_length - start)
        };

        FadeWindow {
            start,
            len,
            fade_in: raised_cosine_ramp(self.fade_in_length, sample_rate),
            fade_out: raised_cosine_ramp(self.fade_out_length, sample_rate),
        }
    }
}

fn raised_cosine_ramp(length_seconds: f64, sample_rate: f64) -> Vec<Sample> {
    let len = (length_seconds * sample_rate).ceil() as usize;
    if len == 0 {
        return Vec::new();
    }
    let scale = 1.0 / (length_seconds * sample_rate);
    (0..len)
        .map(|i| {
            let v = (i as f64 * scale).min(1.0);
            (0.5 - 0.5 * (v * PI).cos()) as Sample
        })
        .collect()
}

/// A fade resolved to samples: which part of the IR to keep and the ramps
/// to multiply onto its head and tail.
pub(crate) struct FadeWindow {
    start: usize,
    len: usize,
    fade_in: Vec<Sample>,
    // stored forwards, applied from the last sample backwards
    fade_out: Vec<Sample>,
}

impl FadeWindow {
    pub(crate) fn start(&self) -> usize {
        self.start
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn partitions(&self, block_size: usize) -> usize {
        (self.len + block_size - 1) / block_size
    }

    pub(crate) fn apply(&self, data: &mut [Sample]) {
        let len = data.len();
        for (i, ramp) in self.fade_in.iter().enumerate().take(len) {
            data[i] *= ramp;
        }
        for (i, ramp) in self.fade_out.iter().enumerate().take(len) {
            data[len - 1 - i] *= ramp;
        }
    }
}
