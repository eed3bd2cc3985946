//! Model options read once at construction.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::DeviceType;
use crate::error::{Error, Result};

/// Default location of the standalone IR-SE50 encoder weights.
pub const DEFAULT_ENCODER_WEIGHTS: &str = "pretrained_models/model_ir_se50.safetensors";

/// Resolution every output is pooled to when `resize` is requested.
pub const CANONICAL_RESOLUTION: usize = 256;

/// Configuration record for a ReStyle pSp model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Generator output resolution (power of two)
    pub output_size: usize,
    /// Use the StyleGAN2-ADA generator instead of StyleGAN2
    pub generator_ada: bool,
    /// Encoder architecture name
    pub encoder_type: String,
    /// Joint encoder/decoder checkpoint produced by this model
    pub checkpoint_path: Option<PathBuf>,
    /// Pretrained generator weights, required without `checkpoint_path`
    pub stylegan_weights: Option<PathBuf>,
    /// Standalone encoder weights; skipped with a warning when absent on disk
    pub encoder_weights: Option<PathBuf>,
    /// Compute device
    pub device: DeviceType,
    /// Encoder input channels (6 for image + previous reconstruction)
    pub input_nc: usize,
    /// Width of every latent code
    pub latent_dim: usize,
    /// Mapping network depth
    pub n_mlp: usize,
    /// StyleGAN2 channel multiplier for resolutions above 32
    pub channel_multiplier: usize,
    /// Maximum generator feature width
    pub generator_channels: usize,
    /// Base encoder feature width
    pub encoder_width: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            output_size: 1024,
            generator_ada: false,
            encoder_type: "BackboneEncoder".to_string(),
            checkpoint_path: None,
            stylegan_weights: None,
            encoder_weights: Some(PathBuf::from(DEFAULT_ENCODER_WEIGHTS)),
            device: DeviceType::Cpu,
            input_nc: 6,
            latent_dim: 512,
            n_mlp: 8,
            channel_multiplier: 2,
            generator_channels: 512,
            encoder_width: 64,
        }
    }
}

impl Options {
    /// Load options from a file, with `RESTYLE_*` environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("RESTYLE").try_parsing(true))
            .build()?;

        let options: Self = settings.try_deserialize()?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from `RESTYLE_*` environment variables only.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("RESTYLE").try_parsing(true))
            .build()?;

        let options: Self = settings.try_deserialize()?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_size < 4 || !self.output_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "output_size must be a power of two >= 4, got {}",
                self.output_size
            )));
        }
        for (name, value) in [
            ("input_nc", self.input_nc),
            ("latent_dim", self.latent_dim),
            ("generator_channels", self.generator_channels),
            ("encoder_width", self.encoder_width),
            ("channel_multiplier", self.channel_multiplier),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// log2 of the output resolution.
    pub fn log_size(&self) -> usize {
        self.output_size.trailing_zeros() as usize
    }

    /// Number of per-layer style codes the encoder must produce.
    pub fn n_styles(&self) -> usize {
        n_styles(self.output_size, self.generator_ada)
    }
}

/// `2*log2(output_size) - 2`, plus the two extra slots of the ADA layout.
pub fn n_styles(output_size: usize, generator_ada: bool) -> usize {
    let log_size = output_size.trailing_zeros() as usize;
    let n = (log_size * 2).saturating_sub(2);
    if generator_ada {
        n + 2
    } else {
        n
    }
}
