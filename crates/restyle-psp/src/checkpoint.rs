//! Reconciles the supported weight sources into encoder and decoder state.
//!
//! Two mutually exclusive sources:
//! - a joint checkpoint written by this model (`encoder.*`, `decoder.*`,
//!   `latent_avg`)
//! - a pretrained generator checkpoint plus an optional standalone encoder
//!   checkpoint

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use restyle_core::{Error, Options, Result};
use crate::encoder::LatentEncoder;
use crate::generator::{GeneratorKind, ImageGenerator};
use crate::state_dict::{LoadMode, LoadReport, StateDict, NESTED_STATE_KEY};

pub const LATENT_AVG_KEY: &str = "latent_avg";
pub const ENCODER_PREFIX: &str = "encoder";
pub const DECODER_PREFIX: &str = "decoder";
/// Sub-mapping holding rosinality StyleGAN2 EMA weights
pub const G_EMA_PREFIX: &str = "g_ema";
/// Sub-mapping holding StyleGAN2-ADA generator weights
pub const ADA_GENERATOR_PREFIX: &str = "G";
const INPUT_LAYER_WEIGHT: &str = "input_layer.0.weight";

/// Where the model weights come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSource {
    /// A checkpoint holding both networks and the latent average
    Joint { path: PathBuf },
    /// Separately pretrained encoder (optional) and generator
    Split {
        encoder: Option<PathBuf>,
        generator: PathBuf,
        kind: GeneratorKind,
    },
}

impl CheckpointSource {
    pub fn from_options(opts: &Options) -> Result<Self> {
        if let Some(path) = &opts.checkpoint_path {
            return Ok(CheckpointSource::Joint { path: path.clone() });
        }
        let generator = opts.stylegan_weights.clone().ok_or_else(|| {
            Error::Config("stylegan_weights is required when checkpoint_path is not set".into())
        })?;
        Ok(CheckpointSource::Split {
            encoder: opts.encoder_weights.clone(),
            generator,
            kind: GeneratorKind::from_options(opts),
        })
    }

    /// Read the source into installable weights.
    ///
    /// Checkpoints are read on the CPU; the latent average is moved to `device`.
    pub fn load(&self, opts: &Options, device: &Device) -> Result<LoadedWeights> {
        let n_styles = opts.n_styles();
        let weights = match self {
            CheckpointSource::Joint { path } => {
                tracing::info!("Loading ReStyle pSp from checkpoint: {}", path.display());
                let ckpt = StateDict::load_nested(path, &[NESTED_STATE_KEY], &Device::Cpu)?;
                LoadedWeights {
                    encoder: ckpt.get_keys(ENCODER_PREFIX),
                    encoder_mode: LoadMode::Partial,
                    decoder: require_weights(ckpt.get_keys(DECODER_PREFIX), path, DECODER_PREFIX)?,
                    decoder_mode: LoadMode::Strict,
                    latent_avg: load_latent_avg(&ckpt, None, device)?,
                }
            }
            CheckpointSource::Split {
                encoder,
                generator,
                kind,
            } => {
                let encoder = match encoder {
                    Some(path) => load_encoder_checkpoint(path, opts.input_nc)?,
                    None => None,
                };

                tracing::info!(
                    "Loading decoder weights from pretrained path: {}",
                    generator.display()
                );
                let (prefix, nested, decoder_mode): (&str, &[&str], LoadMode) = match kind {
                    // third-party StyleGAN2 ports drift in their buffer names
                    GeneratorKind::StyleGan2 => (G_EMA_PREFIX, &[G_EMA_PREFIX][..], LoadMode::Partial),
                    GeneratorKind::StyleGan2Ada => (
                        ADA_GENERATOR_PREFIX,
                        &[NESTED_STATE_KEY, ADA_GENERATOR_PREFIX][..],
                        LoadMode::Strict,
                    ),
                };
                let ckpt = StateDict::load_nested(generator, nested, &Device::Cpu)?;
                let decoder = require_weights(ckpt.get_keys(prefix), generator, prefix)?;

                LoadedWeights {
                    encoder: encoder.unwrap_or_default(),
                    encoder_mode: LoadMode::Partial,
                    decoder,
                    decoder_mode,
                    latent_avg: load_latent_avg(&ckpt, Some(n_styles), device)?,
                }
            }
        };

        if let Some(latent_avg) = &weights.latent_avg {
            validate_latent_avg(latent_avg, n_styles, opts.latent_dim)?;
        } else {
            tracing::warn!("checkpoint has no {}; initial iterations will fail", LATENT_AVG_KEY);
        }
        Ok(weights)
    }
}

/// Encoder and decoder state ready to install, plus the latent average.
#[derive(Debug, Clone)]
pub struct LoadedWeights {
    pub encoder: StateDict,
    pub encoder_mode: LoadMode,
    pub decoder: StateDict,
    pub decoder_mode: LoadMode,
    pub latent_avg: Option<Tensor>,
}

impl LoadedWeights {
    /// Install both state dicts. Decoder mismatches under strict mode are fatal.
    pub fn install(
        &self,
        encoder: &dyn LatentEncoder,
        decoder: &dyn ImageGenerator,
    ) -> Result<(LoadReport, LoadReport)> {
        let encoder_report = encoder.load_state_dict(&self.encoder, self.encoder_mode)?;
        log_report("encoder", &encoder_report);
        let decoder_report = decoder.load_state_dict(&self.decoder, self.decoder_mode)?;
        log_report("decoder", &decoder_report);
        Ok((encoder_report, decoder_report))
    }
}

/// A generator sub-mapping that resolved to nothing would leave the decoder untrained.
fn require_weights(state: StateDict, path: &Path, prefix: &str) -> Result<StateDict> {
    if state.is_empty() {
        return Err(Error::MissingWeights {
            path: path.to_path_buf(),
            prefix: prefix.to_string(),
        });
    }
    Ok(state)
}

fn log_report(module: &str, report: &LoadReport) {
    tracing::debug!(
        "{}: loaded {} tensors, {} missing, {} unexpected",
        module,
        report.loaded.len(),
        report.missing.len(),
        report.unexpected.len()
    );
    if !report.missing.is_empty() {
        tracing::warn!(
            "{}: {} parameters left at initialization",
            module,
            report.missing.len()
        );
        tracing::debug!("{} uninitialized: {:?}", module, report.missing);
    }
}

/// Read an optional standalone encoder checkpoint; a missing file is skipped.
fn load_encoder_checkpoint(path: &Path, input_nc: usize) -> Result<Option<StateDict>> {
    if !path.exists() {
        tracing::warn!(
            "encoder weights not found at {}, keeping encoder initialization",
            path.display()
        );
        return Ok(None);
    }
    tracing::info!("Loading encoder weights from {}", path.display());
    let state = StateDict::load(path, &Device::Cpu)?;
    Ok(Some(widen_input_layer(state, input_nc)?))
}

/// Adapt an RGB input layer to `input_nc` channels.
///
/// The pretrained weights fill the first three channels; the rest are drawn
/// from a standard normal.
pub fn widen_input_layer(mut state: StateDict, input_nc: usize) -> Result<StateDict> {
    let Some(weight) = state.get(INPUT_LAYER_WEIGHT) else {
        return Ok(state);
    };
    let (out_c, in_c, kh, kw) = weight.dims4()?;
    if in_c != 3 || input_nc <= 3 {
        return Ok(state);
    }

    let extra = Tensor::randn(0f32, 1f32, (out_c, input_nc - 3, kh, kw), weight.device())?
        .to_dtype(weight.dtype())?;
    let widened = Tensor::cat(&[weight, &extra], 1)?;
    tracing::debug!("widened {} to {} input channels", INPUT_LAYER_WEIGHT, input_nc);
    state.insert(INPUT_LAYER_WEIGHT, widened);
    Ok(state)
}

/// Read `latent_avg` from the top level of a checkpoint.
///
/// With `repeat`, the stored vector is tiled along a new leading axis so the
/// result has `repeat` rows.
pub fn load_latent_avg(
    ckpt: &StateDict,
    repeat: Option<usize>,
    device: &Device,
) -> Result<Option<Tensor>> {
    let Some(latent_avg) = ckpt.get(LATENT_AVG_KEY) else {
        return Ok(None);
    };
    let mut latent_avg = latent_avg.to_dtype(DType::F32)?.to_device(device)?;
    if let Some(n) = repeat {
        if latent_avg.rank() == 1 {
            latent_avg = latent_avg.unsqueeze(0)?;
        }
        latent_avg = latent_avg.repeat((n, 1))?;
    }
    Ok(Some(latent_avg))
}

/// The latent average must broadcast against `[batch, n_styles, latent_dim]` codes.
pub fn validate_latent_avg(latent_avg: &Tensor, n_styles: usize, latent_dim: usize) -> Result<()> {
    let dims = latent_avg.dims();
    let ok = match dims {
        [d] => *d == latent_dim,
        [rows, d] => (*rows == 1 || *rows == n_styles) && *d == latent_dim,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            key: LATENT_AVG_KEY.to_string(),
            expected: vec![n_styles, latent_dim],
            found: dims.to_vec(),
        })
    }
}
