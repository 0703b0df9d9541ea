use realfft::{ComplexToReal, FftError, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::Sample;

/// Forward/inverse real FFT pair of a fixed size. Plans are shared, so
/// cloning is cheap; each clone may be used from its own thread.
#[derive(Clone)]
pub struct Fft {
    forward: Arc<dyn RealToComplex<Sample>>,
    inverse: Arc<dyn ComplexToReal<Sample>>,
}

impl Fft {
    pub fn new(length: usize) -> Self {
        let mut planner = RealFftPlanner::<Sample>::new();
        Self {
            forward: planner.plan_fft_forward(length),
            inverse: planner.plan_fft_inverse(length),
        }
    }

    pub fn forward(
        &self,
        input: &mut [Sample],
        output: &mut [Complex<Sample>],
    ) -> std::result::Result<(), FftError> {
        self.forward.process(input, output)?;
        Ok(())
    }

    /// Inverse transform, normalized so that `forward` followed by
    /// `inverse` reproduces the input.
    pub fn inverse(
        &self,
        input: &mut [Complex<Sample>],
        output: &mut [Sample],
    ) -> std::result::Result<(), FftError> {
        // DC and Nyquist bins of a real signal's spectrum are real; the
        // residue left there by bin-wise products must not reach the plan,
        // which rejects non-zero imaginary parts in those bins.
        input[0].im = 0.;
        if let Some(last) = input.last_mut() {
            last.im = 0.;
        }
        self.inverse.process(input, output)?;

        let len = output.len();
        output.iter_mut().for_each(|bin| *bin /= len as Sample);

        Ok(())
    }
}

impl std::fmt::Debug for Fft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fft")
    }
}

pub fn complex_size(size: usize) -> usize {
    (size / 2) + 1
}

pub fn copy_and_pad(dst: &mut [Sample], src: &[Sample], src_size: usize) {
    assert!(dst.len() >= src_size);
    dst[0..src_size].clone_from_slice(&src[0..src_size]);
    dst[src_size..].iter_mut().for_each(|value| *value = 0.);
}

pub fn complex_multiply_accumulate(
    result: &mut [Complex<Sample>],
    a: &[Complex<Sample>],
    b: &[Complex<Sample>],
) {
    assert_eq!(result.len(), a.len());
    assert_eq!(result.len(), b.len());
    let len = result.len();
    let end4 = 4 * (len / 4);
    for i in (0..end4).step_by(4) {
        result[i + 0].re += a[i + 0].re * b[i + 0].re - a[i + 0].im * b[i + 0].im;
        result[i + 1].re += a[i + 1].re * b[i + 1].re - a[i + 1].im * b[i + 1].im;
        result[i + 2].re += a[i + 2].re * b[i + 2].re - a[i + 2].im * b[i + 2].im;
        result[i + 3].re += a[i + 3].re * b[i + 3].re - a[i + 3].im * b[i + 3].im;
        result[i + 0].im += a[i + 0].re * b[i + 0].im + a[i + 0].im * b[i + 0].re;
        result[i + 1].im += a[i + 1].re * b[i + 1].im + a[i + 1].im * b[i + 1].re;
        result[i + 2].im += a[i + 2].re * b[i + 2].im + a[i + 2].im * b[i + 2].re;
        result[i + 3].im += a[i + 3].re * b[i + 3].im + a[i + 3].im * b[i + 3].re;
    }
    for i in end4..len {
        result[i].re += a[i].re * b[i].re - a[i].im * b[i].im;
        result[i].im += a[i].re * b[i].im + a[i].im * b[i].re;
    }
}

/// Shared FFT context for one partition size: plans for transforms of
/// length `2 * block_size`. Built once per manager and referenced by every
/// filter and convolver; never mutated after construction.
pub struct Context {
    block_size: usize,
    fft: Fft,
}

impl Context {
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::InvalidBlockSize(block_size));
        }
        Ok(Self {
            block_size,
            fft: Fft::new(2 * block_size),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn fft_size(&self) -> usize {
        2 * self.block_size
    }

    /// Number of bins in a half spectrum of `fft_size`.
    pub fn spectrum_size(&self) -> usize {
        complex_size(self.fft_size())
    }

    pub(crate) fn fft(&self) -> &Fft {
        &self.fft
    }
}
