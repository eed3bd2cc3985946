//! # ReStyle-pSp
//!
//! Iterative StyleGAN inversion with a pixel2style2pixel encoder.
//!
//! ## Architecture Overview
//!
//! 1. **Encoder**: IR-SE or ResNet backbone with gradual (feature pyramid)
//!    or single-head style outputs, one code per generator style input
//! 2. **Generator**: StyleGAN2 or StyleGAN2-ADA synthesis network
//! 3. **Latent average**: the reference the first iteration's codes are
//!    predicted against
//!
//! ## Residual Refinement
//!
//! Every pass feeds the encoder the input image concatenated with the current
//! reconstruction (the average image on the first pass):
//!
//! w_0 = E(x, y_avg) + w_avg,   w_t = E(x, y_{t-1}) + w_{t-1}

pub mod backbone;
pub mod checkpoint;
pub mod encoder;
pub mod generator;
pub mod generator_ada;
pub mod inference;
pub mod layers;
pub mod model;
pub mod state_dict;

pub use checkpoint::*;
pub use encoder::*;
pub use generator::*;
pub use generator_ada::*;
pub use inference::*;
pub use model::*;
pub use state_dict::*;
