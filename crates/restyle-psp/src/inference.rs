//! Iterative ReStyle inversion: repeated pSp passes that refine one code.

use candle_core::Tensor;
use restyle_core::{Error, Result};

use crate::layers::adaptive_avg_pool2d;
use crate::model::{ForwardOptions, IterationPhase, Psp};

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Refinement steps per batch
    pub n_iters_per_batch: usize,
    /// Pool every returned image to 256x256
    pub resize_outputs: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            n_iters_per_batch: 5,
            resize_outputs: false,
        }
    }
}

/// Output of one refinement step.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub images: Tensor,
    pub latents: Tensor,
}

/// Drives a [`Psp`] through the residual refinement loop.
pub struct ReStyleRunner {
    net: Psp,
    avg_image: Tensor,
    config: RunnerConfig,
}

impl ReStyleRunner {
    /// Wrap `net` and render the image of its latent average.
    pub fn new(net: Psp, config: RunnerConfig) -> Result<Self> {
        let avg_image = average_image(&net)?;
        tracing::info!(
            "ReStyle runner: {} iterations per batch, average image {:?}",
            config.n_iters_per_batch,
            avg_image.dims()
        );
        Ok(Self {
            net,
            avg_image,
            config,
        })
    }

    /// Invert an RGB batch `[batch, 3, h, w]`, returning every iteration's output.
    ///
    /// The first pass pairs each input with the average image; each later pass
    /// pairs it with the previous reconstruction and refines the previous code.
    pub fn run_on_batch(&self, x: &Tensor) -> Result<Vec<IterationResult>> {
        let (batch, channels, height, width) = x.dims4()?;
        let expected = self.net.encoder().input_channels();
        if channels + 3 != expected {
            return Err(Error::InvalidInput(format!(
                "encoder expects {} channels, got {} + 3 for the reference image",
                expected, channels
            )));
        }

        let avg_image = adaptive_avg_pool2d(&self.avg_image, height, width)?
            .broadcast_as((batch, 3, height, width))?
            .to_dtype(x.dtype())?
            .to_device(x.device())?;

        let mut results: Vec<IterationResult> = Vec::with_capacity(self.config.n_iters_per_batch);
        for iter in 0..self.config.n_iters_per_batch {
            let (reference, phase) = match results.last() {
                None => (avg_image.clone(), IterationPhase::Initial),
                Some(prev) => (
                    adaptive_avg_pool2d(&prev.images, height, width)?,
                    IterationPhase::Refinement {
                        previous: &prev.latents,
                    },
                ),
            };
            let input = Tensor::cat(&[x, &reference], 1)?;

            let out = self.net.forward(
                &input,
                &ForwardOptions {
                    phase,
                    resize: self.config.resize_outputs,
                    randomize_noise: false,
                    return_latents: true,
                    ..Default::default()
                },
            )?;
            let latents = out.latents.ok_or_else(|| {
                Error::InvalidInput("generator did not return latents".to_string())
            })?;
            tracing::debug!("iteration {}: images {:?}", iter, out.images.dims());

            results.push(IterationResult {
                images: out.images,
                latents,
            });
        }
        Ok(results)
    }

    /// The decoded latent average, `[1, 3, 256, 256]`.
    pub fn avg_image(&self) -> &Tensor {
        &self.avg_image
    }

    pub fn net(&self) -> &Psp {
        &self.net
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }
}

/// Decode the latent average without noise and pool it to 256x256.
pub fn average_image(net: &Psp) -> Result<Tensor> {
    let latent_avg = net.latent_avg().ok_or(Error::MissingLatentAverage)?;
    let latent_dim = latent_avg.dim(latent_avg.rank() - 1)?;
    let codes = latent_avg
        .broadcast_as((1, net.n_styles(), latent_dim))?
        .contiguous()?;
    let out = net.forward(
        &codes,
        &ForwardOptions {
            input_code: true,
            average_code: true,
            randomize_noise: false,
            ..Default::default()
        },
    )?;
    Ok(out.images)
}
