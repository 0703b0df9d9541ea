pub mod block_convolver;
pub mod error;
pub mod fft;
pub mod filter;
pub mod fractional;
pub mod manager;
pub mod sources;
mod worker;

// todo: make the sample type generic over f32/f64
pub type Sample = f32;

pub use block_convolver::BlockConvolver;
pub use error::{Error, Result};
pub use fft::Context;
pub use filter::{Filter, FilterFade};
pub use manager::{ConvolverManager, FixedConvolverData, DEFAULT_MAX_EXTRA_DELAY};
pub use sources::{IrBatch, IrDelay, IrSource, SofaIrSource, SofaLayout, WavIrSource};
