//! Image-to-latent style encoders.
//!
//! Each encoder maps an image batch `[batch, input_nc, h, w]` to per-layer
//! latent codes `[batch, n_styles, latent_dim]`. Six variants combine two
//! bodies (IR-SE, ResNet-34) with two kinds of style heads:
//! - gradual: a feature pyramid where coarse styles read the deepest map and
//!   fine styles read progressively shallower, laterally merged maps
//! - backbone: every style reads the deepest map

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder, VarMap};
use restyle_core::{Error, Options, CANONICAL_RESOLUTION};

use crate::backbone::{BodyFeatures, IrSeBody, ResNetBody};
use crate::layers::EqualLinear;
use crate::state_dict::ParameterModule;

/// Capability set of an encoder collaborator.
pub trait LatentEncoder: ParameterModule {
    /// Encode an image batch into `[batch, n_styles, latent_dim]` codes.
    fn encode(&self, x: &Tensor) -> Result<Tensor>;

    fn n_styles(&self) -> usize;

    fn latent_dim(&self) -> usize;

    /// Channels the first layer expects.
    fn input_channels(&self) -> usize;
}

/// Supported encoder architectures, keyed by their configuration name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    GradualStyle,
    ResNetGradualStyle,
    Backbone,
    Backbone34,
    Backbone100,
    ResNetBackbone,
}

impl EncoderKind {
    pub const ALL: [EncoderKind; 6] = [
        EncoderKind::GradualStyle,
        EncoderKind::ResNetGradualStyle,
        EncoderKind::Backbone,
        EncoderKind::Backbone34,
        EncoderKind::Backbone100,
        EncoderKind::ResNetBackbone,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EncoderKind::GradualStyle => "GradualStyleEncoder",
            EncoderKind::ResNetGradualStyle => "ResNetGradualStyleEncoder",
            EncoderKind::Backbone => "BackboneEncoder",
            EncoderKind::Backbone34 => "BackboneEncoder34",
            EncoderKind::Backbone100 => "BackboneEncoder100",
            EncoderKind::ResNetBackbone => "ResNetBackboneEncoder",
        }
    }

    /// IR-SE depth, or `None` for the ResNet-34 body.
    pub fn ir_se_layers(self) -> Option<usize> {
        match self {
            EncoderKind::GradualStyle | EncoderKind::Backbone => Some(50),
            EncoderKind::Backbone34 => Some(34),
            EncoderKind::Backbone100 => Some(100),
            EncoderKind::ResNetGradualStyle | EncoderKind::ResNetBackbone => None,
        }
    }

    pub fn is_gradual(self) -> bool {
        matches!(self, EncoderKind::GradualStyle | EncoderKind::ResNetGradualStyle)
    }
}

impl FromStr for EncoderKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Error> {
        EncoderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidEncoder(s.to_string()))
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder hyper-parameters
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Input channels (3 for images, 6 for image + previous output)
    pub input_nc: usize,
    /// Base body width (64 for the pretrained backbones)
    pub width: usize,
    /// Width of each latent code
    pub latent_dim: usize,
    /// Number of style codes to produce
    pub n_styles: usize,
    /// Resolution the heads are sized for
    pub input_size: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            input_nc: 6,
            width: 64,
            latent_dim: 512,
            n_styles: 18,
            input_size: CANONICAL_RESOLUTION,
        }
    }
}

impl EncoderConfig {
    pub fn from_options(opts: &Options) -> Self {
        Self {
            input_nc: opts.input_nc,
            width: opts.encoder_width,
            latent_dim: opts.latent_dim,
            n_styles: opts.n_styles(),
            input_size: CANONICAL_RESOLUTION,
        }
    }
}

/// Strided convolutions down to 1x1 followed by an equalized linear.
pub struct GradualStyleBlock {
    convs: Vec<Conv2d>,
    linear: EqualLinear,
    out_channels: usize,
}

impl GradualStyleBlock {
    pub fn new(in_channels: usize, out_channels: usize, spatial: usize, vb: VarBuilder) -> Result<Self> {
        let num_pools = (spatial.max(2) as f64).log2().floor() as usize;
        let config = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };

        let mut convs = Vec::with_capacity(num_pools);
        for i in 0..num_pools {
            let in_c = if i == 0 { in_channels } else { out_channels };
            // LeakyReLU modules sit at the odd indices
            convs.push(conv2d(in_c, out_channels, 3, config, vb.pp("convs").pp((2 * i).to_string()))?);
        }
        let linear = EqualLinear::new(out_channels, out_channels, 0.0, 1.0, false, vb.pp("linear"))?;

        Ok(Self {
            convs,
            linear,
            out_channels,
        })
    }

    /// `[batch, in, s, s]` to `[batch, out]`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for conv in &self.convs {
            x = candle_nn::ops::leaky_relu(&conv.forward(&x)?, 0.01)?;
        }
        let (batch, _, h, w) = x.dims4()?;
        if h != 1 || w != 1 {
            candle_core::bail!(
                "style head reduced input to {}x{}, expected 1x1; input larger than the encoder resolution",
                h,
                w
            )
        }
        let x = x.reshape((batch, self.out_channels))?;
        self.linear.forward(&x)
    }
}

enum Body {
    IrSe(IrSeBody),
    ResNet(ResNetBody),
}

impl Body {
    fn forward(&self, x: &Tensor) -> Result<BodyFeatures> {
        match self {
            Body::IrSe(body) => body.forward(x),
            Body::ResNet(body) => body.forward(x),
        }
    }
}

/// Feature-pyramid heads: styles `[0, 3)` from `c3`, `[3, 7)` from `c2`, rest from `c1`.
struct GradualHeads {
    styles: Vec<GradualStyleBlock>,
    latlayer1: Conv2d,
    latlayer2: Conv2d,
    coarse_ind: usize,
    middle_ind: usize,
}

impl GradualHeads {
    const COARSE_IND: usize = 3;
    const MIDDLE_IND: usize = 7;

    fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let w = config.width;
        let coarse_ind = Self::COARSE_IND.min(config.n_styles);
        let middle_ind = Self::MIDDLE_IND.min(config.n_styles);

        let mut styles = Vec::with_capacity(config.n_styles);
        for i in 0..config.n_styles {
            let spatial = if i < coarse_ind {
                config.input_size / 16
            } else if i < middle_ind {
                config.input_size / 8
            } else {
                config.input_size / 4
            };
            styles.push(GradualStyleBlock::new(
                w * 8,
                config.latent_dim,
                spatial,
                vb.pp("styles").pp(i.to_string()),
            )?);
        }

        let lateral = Conv2dConfig::default();
        let latlayer1 = conv2d(w * 4, w * 8, 1, lateral, vb.pp("latlayer1"))?;
        let latlayer2 = conv2d(w * 2, w * 8, 1, lateral, vb.pp("latlayer2"))?;

        Ok(Self {
            styles,
            latlayer1,
            latlayer2,
            coarse_ind,
            middle_ind,
        })
    }

    fn forward(&self, features: &BodyFeatures) -> Result<Vec<Tensor>> {
        let mut latents = Vec::with_capacity(self.styles.len());
        for style in &self.styles[..self.coarse_ind] {
            latents.push(style.forward(&features.c3)?);
        }

        let p2 = upsample_add(&features.c3, &self.latlayer1.forward(&features.c2)?)?;
        for style in &self.styles[self.coarse_ind..self.middle_ind] {
            latents.push(style.forward(&p2)?);
        }

        let p1 = upsample_add(&p2, &self.latlayer2.forward(&features.c1)?)?;
        for style in &self.styles[self.middle_ind..] {
            latents.push(style.forward(&p1)?);
        }
        Ok(latents)
    }
}

/// Resize `x` to the spatial size of `y` and add.
fn upsample_add(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = y.dims4()?;
    x.upsample_nearest2d(h, w)? + y
}

enum Heads {
    Gradual(GradualHeads),
    Backbone(Vec<GradualStyleBlock>),
}

/// A body plus style heads, with its own parameter store.
pub struct StyleEncoder {
    kind: EncoderKind,
    body: Body,
    heads: Heads,
    varmap: VarMap,
    config: EncoderConfig,
}

impl StyleEncoder {
    pub fn new(kind: EncoderKind, config: EncoderConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let body = match kind.ir_se_layers() {
            Some(num_layers) => Body::IrSe(IrSeBody::new(num_layers, config.input_nc, config.width, vb.clone())?),
            None => Body::ResNet(ResNetBody::new(config.input_nc, config.width, vb.clone())?),
        };

        let heads = if kind.is_gradual() {
            Heads::Gradual(GradualHeads::new(&config, vb)?)
        } else {
            let mut styles = Vec::with_capacity(config.n_styles);
            for i in 0..config.n_styles {
                styles.push(GradualStyleBlock::new(
                    config.width * 8,
                    config.latent_dim,
                    config.input_size / 16,
                    vb.pp("styles").pp(i.to_string()),
                )?);
            }
            Heads::Backbone(styles)
        };

        Ok(Self {
            kind,
            body,
            heads,
            varmap,
            config,
        })
    }

    pub fn kind(&self) -> EncoderKind {
        self.kind
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }
}

impl ParameterModule for StyleEncoder {
    fn module_name(&self) -> &str {
        "encoder"
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

impl LatentEncoder for StyleEncoder {
    fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let features = self.body.forward(x)?;
        let latents = match &self.heads {
            Heads::Gradual(heads) => heads.forward(&features)?,
            Heads::Backbone(styles) => styles
                .iter()
                .map(|style| style.forward(&features.c3))
                .collect::<Result<Vec<_>>>()?,
        };
        Tensor::stack(&latents, 1)
    }

    fn n_styles(&self) -> usize {
        self.config.n_styles
    }

    fn latent_dim(&self) -> usize {
        self.config.latent_dim
    }

    fn input_channels(&self) -> usize {
        self.config.input_nc
    }
}

/// Build the encoder named by `opts.encoder_type`, failing on unknown names.
pub fn build_encoder(opts: &Options, device: &Device) -> restyle_core::Result<StyleEncoder> {
    let kind: EncoderKind = opts.encoder_type.parse()?;
    Ok(StyleEncoder::new(kind, EncoderConfig::from_options(opts), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(n_styles: usize) -> EncoderConfig {
        EncoderConfig {
            input_nc: 6,
            width: 2,
            latent_dim: 8,
            n_styles,
            input_size: 32,
        }
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in EncoderKind::ALL {
            assert_eq!(kind.as_str().parse::<EncoderKind>().unwrap(), kind);
        }
        let err = "VitEncoder".parse::<EncoderKind>().unwrap_err();
        assert!(matches!(err, Error::InvalidEncoder(name) if name == "VitEncoder"));
    }

    #[test]
    fn test_every_kind_produces_codes() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1., (2, 6, 32, 32), &device)?;
        for kind in EncoderKind::ALL {
            let encoder = StyleEncoder::new(kind, small_config(10), &device)?;
            let codes = encoder.encode(&x)?;
            assert_eq!(codes.dims(), &[2, 10, 8], "{}", kind);
        }
        Ok(())
    }

    #[test]
    fn test_gradual_heads_with_few_styles() -> Result<()> {
        let device = Device::Cpu;
        let encoder = StyleEncoder::new(EncoderKind::GradualStyle, small_config(2), &device)?;
        let x = Tensor::randn(0f32, 1., (1, 6, 32, 32), &device)?;
        assert_eq!(encoder.encode(&x)?.dims(), &[1, 2, 8]);
        Ok(())
    }

    #[test]
    fn test_oversized_input_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let encoder = StyleEncoder::new(EncoderKind::Backbone34, small_config(4), &device)?;
        let x = Tensor::randn(0f32, 1., (1, 6, 64, 64), &device)?;
        assert!(encoder.encode(&x).is_err());
        Ok(())
    }

    #[test]
    fn test_style_block_names() -> Result<()> {
        let device = Device::Cpu;
        let encoder = StyleEncoder::new(EncoderKind::GradualStyle, small_config(8), &device)?;
        let data = encoder.varmap().data().lock().unwrap();
        assert!(data.contains_key("styles.0.convs.0.weight"));
        assert!(data.contains_key("styles.7.convs.2.bias"));
        assert!(data.contains_key("styles.7.linear.weight"));
        assert!(data.contains_key("latlayer1.weight"));
        assert!(data.contains_key("input_layer.0.weight"));
        Ok(())
    }

    #[test]
    fn test_build_encoder_rejects_unknown_type() {
        let opts = Options {
            encoder_type: "Nope".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            build_encoder(&opts, &Device::Cpu),
            Err(Error::InvalidEncoder(_))
        ));
    }
}
