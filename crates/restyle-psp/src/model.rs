//! The pSp orchestrator: encoder, generator and the residual refinement protocol.

use std::path::Path;

use candle_core::{Device, Module, Tensor};
use restyle_core::{Error, Options, Result, CANONICAL_RESOLUTION};

use crate::checkpoint::{
    validate_latent_avg, CheckpointSource, DECODER_PREFIX, ENCODER_PREFIX, LATENT_AVG_KEY,
};
use crate::encoder::{build_encoder, LatentEncoder};
use crate::generator::{build_generator, ImageGenerator, SynthesisFlags};
use crate::layers::AdaptiveAvgPool2d;
use crate::state_dict::StateDict;

/// Which refinement step a forward call performs.
#[derive(Debug, Clone, Copy)]
pub enum IterationPhase<'a> {
    /// First pass: codes are predicted relative to the latent average
    Initial,
    /// Later passes: codes are a correction to the previous iteration's codes
    Refinement { previous: &'a Tensor },
}

impl<'a> IterationPhase<'a> {
    /// Infer the phase from the input layout: a 6-channel input together with
    /// a previous latent is a refinement step.
    ///
    /// Prefer passing the phase explicitly; any 6-channel first-iteration input
    /// accompanied by a stale latent is misclassified by this rule.
    pub fn from_input(x: &Tensor, latent: Option<&'a Tensor>) -> Result<Self> {
        let channels = x.dim(1)?;
        Ok(match latent {
            Some(previous) if channels == 6 => IterationPhase::Refinement { previous },
            _ => IterationPhase::Initial,
        })
    }
}

/// Per-call forward switches.
#[derive(Debug, Clone, Copy)]
pub struct ForwardOptions<'a> {
    pub phase: IterationPhase<'a>,
    /// Pool the output to 256x256
    pub resize: bool,
    /// Style indices to inject into or zero, in order
    pub latent_mask: Option<&'a [usize]>,
    /// `x` is already a code tensor; skip the encoder
    pub input_code: bool,
    pub randomize_noise: bool,
    /// Codes written into the masked indices
    pub inject_latent: Option<&'a Tensor>,
    pub return_latents: bool,
    /// Blend factor for injection; hard overwrite when absent
    pub alpha: Option<f64>,
    /// The code is an average already in W space
    pub average_code: bool,
    /// The supplied code is a full W+ code
    pub input_is_full: bool,
}

impl Default for ForwardOptions<'_> {
    fn default() -> Self {
        Self {
            phase: IterationPhase::Initial,
            resize: true,
            latent_mask: None,
            input_code: false,
            randomize_noise: true,
            inject_latent: None,
            return_latents: false,
            alpha: None,
            average_code: false,
            input_is_full: false,
        }
    }
}

impl ForwardOptions<'_> {
    /// Whether the generator should skip its mapping network.
    pub fn input_is_latent(&self) -> bool {
        self.average_code || !self.input_code || self.input_is_full
    }
}

/// Generated images and, when requested, the latents the generator used.
#[derive(Debug, Clone)]
pub struct PspOutput {
    pub images: Tensor,
    pub latents: Option<Tensor>,
}

/// Encoder plus generator with a shared latent average.
pub struct Psp {
    encoder: Box<dyn LatentEncoder>,
    decoder: Box<dyn ImageGenerator>,
    latent_avg: Option<Tensor>,
    face_pool: AdaptiveAvgPool2d,
    n_styles: usize,
    device: Device,
    opts: Options,
}

impl Psp {
    /// Build the networks named by `opts` and load their weights.
    pub fn new(opts: &Options) -> Result<Self> {
        opts.validate()?;
        let device = opts.device.device()?;

        let decoder = build_generator(opts, &device)?;
        let encoder: Box<dyn LatentEncoder> = Box::new(build_encoder(opts, &device)?);

        let weights = CheckpointSource::from_options(opts)?.load(opts, &device)?;
        weights.install(encoder.as_ref(), decoder.as_ref())?;

        tracing::info!(
            "pSp ready: {} encoder, {} styles, {}px output on {}",
            opts.encoder_type,
            opts.n_styles(),
            opts.output_size,
            opts.device
        );
        Self::from_parts(opts.clone(), encoder, decoder, weights.latent_avg)
    }

    /// Assemble from already-built collaborators.
    pub fn from_parts(
        opts: Options,
        encoder: Box<dyn LatentEncoder>,
        decoder: Box<dyn ImageGenerator>,
        latent_avg: Option<Tensor>,
    ) -> Result<Self> {
        opts.validate()?;
        let n_styles = opts.n_styles();
        if encoder.n_styles() != n_styles {
            return Err(Error::Config(format!(
                "encoder produces {} styles, output size {} needs {}",
                encoder.n_styles(),
                opts.output_size,
                n_styles
            )));
        }
        if decoder.n_latent() > n_styles {
            return Err(Error::Config(format!(
                "generator consumes {} styles but only {} are produced",
                decoder.n_latent(),
                n_styles
            )));
        }

        let device = opts.device.device()?;
        let latent_avg = match latent_avg {
            Some(avg) => {
                validate_latent_avg(&avg, n_styles, opts.latent_dim)?;
                Some(avg.to_device(&device)?)
            }
            None => None,
        };

        Ok(Self {
            encoder,
            decoder,
            latent_avg,
            face_pool: AdaptiveAvgPool2d::new(CANONICAL_RESOLUTION, CANONICAL_RESOLUTION),
            n_styles,
            device,
            opts,
        })
    }

    /// Run one refinement step.
    ///
    /// # Arguments
    /// * `x` - Image batch `[batch, input_nc, h, w]`, or codes
    ///   `[batch, n_styles, latent_dim]` when `opts.input_code` is set
    pub fn forward(&self, x: &Tensor, opts: &ForwardOptions) -> Result<PspOutput> {
        let codes = if opts.input_code {
            x.clone()
        } else {
            self.compose_codes(x, opts.phase)?
        };

        let codes = match opts.latent_mask {
            Some(mask) => apply_latent_mask(&codes, mask, opts.inject_latent, opts.alpha)?,
            None => codes,
        };

        let flags = SynthesisFlags {
            input_is_latent: opts.input_is_latent(),
            randomize_noise: opts.randomize_noise,
            return_latents: opts.return_latents,
        };
        let (images, latents) = self.decoder.synthesize(&[codes], flags)?;

        let images = if opts.resize {
            self.face_pool.forward(&images)?
        } else {
            images
        };

        Ok(PspOutput {
            images,
            latents: if opts.return_latents { latents } else { None },
        })
    }

    /// Encode `x` and add the reference the encoder predicted a residual against.
    pub fn compose_codes(&self, x: &Tensor, phase: IterationPhase) -> Result<Tensor> {
        let codes = self.encoder.encode(x)?;
        match phase {
            IterationPhase::Refinement { previous } => {
                if previous.dims() != codes.dims() {
                    return Err(Error::InvalidInput(format!(
                        "previous latent has shape {:?}, encoder produced {:?}",
                        previous.dims(),
                        codes.dims()
                    )));
                }
                Ok((codes + previous.to_device(x.device())?)?)
            }
            IterationPhase::Initial => {
                let latent_avg = self.latent_avg.as_ref().ok_or(Error::MissingLatentAverage)?;
                Ok(codes.broadcast_add(&latent_avg.to_device(codes.device())?)?)
            }
        }
    }

    /// Write a joint checkpoint that [`Psp::new`] can load back.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.state_dict()?.save(path.as_ref())?;
        tracing::info!("saved checkpoint to {}", path.as_ref().display());
        Ok(())
    }

    /// Full parameter state in the joint checkpoint layout.
    pub fn state_dict(&self) -> Result<StateDict> {
        let mut state = self.encoder.state_dict()?.with_prefix(ENCODER_PREFIX);
        state.extend(self.decoder.state_dict()?.with_prefix(DECODER_PREFIX));
        if let Some(latent_avg) = &self.latent_avg {
            state.insert(LATENT_AVG_KEY, latent_avg.clone());
        }
        Ok(state)
    }

    pub fn latent_avg(&self) -> Option<&Tensor> {
        self.latent_avg.as_ref()
    }

    pub fn n_styles(&self) -> usize {
        self.n_styles
    }

    pub fn encoder(&self) -> &dyn LatentEncoder {
        self.encoder.as_ref()
    }

    pub fn decoder(&self) -> &dyn ImageGenerator {
        self.decoder.as_ref()
    }

    pub fn face_pool(&self) -> &AdaptiveAvgPool2d {
        &self.face_pool
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }
}

/// Overwrite, blend or zero the masked style rows of `codes`.
///
/// With `inject`, row `i` becomes `alpha * inject[:, i] + (1 - alpha) * codes[:, i]`,
/// or `inject[:, i]` when `alpha` is absent. Without `inject`, row `i` is zeroed.
pub fn apply_latent_mask(
    codes: &Tensor,
    mask: &[usize],
    inject: Option<&Tensor>,
    alpha: Option<f64>,
) -> Result<Tensor> {
    let (batch, n_styles, dim) = codes.dims3()?;
    let mut codes = codes.clone();
    for &i in mask {
        if i >= n_styles {
            return Err(Error::InvalidInput(format!(
                "latent mask index {} out of range for {} styles",
                i, n_styles
            )));
        }
        let row = match inject {
            Some(inject) => {
                let injected = inject
                    .narrow(1, i, 1)?
                    .broadcast_as((batch, 1, dim))?
                    .to_dtype(codes.dtype())?;
                match alpha {
                    Some(alpha) => {
                        let current = codes.narrow(1, i, 1)?;
                        ((injected * alpha)? + (current * (1.0 - alpha))?)?
                    }
                    None => injected,
                }
            }
            None => Tensor::zeros((batch, 1, dim), codes.dtype(), codes.device())?,
        };
        codes = codes.slice_assign(&[0..batch, i..i + 1, 0..dim], &row.contiguous()?)?;
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::path::PathBuf;
    use std::rc::Rc;

    use candle_core::{DType, IndexOp};
    use candle_nn::VarMap;

    use crate::encoder::{EncoderConfig, EncoderKind, StyleEncoder};
    use crate::generator::{assemble_latent, StyleGan2Config, StyleGan2Generator};
    use crate::generator_ada::{AdaGeneratorConfig, StyleGan2AdaGenerator};
    use crate::state_dict::ParameterModule;

    const DIM: usize = 4;

    /// Returns a fixed code tensor per batch item, whatever the input.
    struct FixedEncoder {
        codes: Tensor,
        varmap: VarMap,
    }

    impl ParameterModule for FixedEncoder {
        fn module_name(&self) -> &str {
            "encoder"
        }
        fn varmap(&self) -> &VarMap {
            &self.varmap
        }
    }

    impl LatentEncoder for FixedEncoder {
        fn encode(&self, x: &Tensor) -> candle_core::Result<Tensor> {
            let batch = x.dim(0)?;
            let (n, d) = self.codes.dims2()?;
            self.codes.unsqueeze(0)?.broadcast_as((batch, n, d))?.contiguous()
        }
        fn n_styles(&self) -> usize {
            self.codes.dim(0).unwrap()
        }
        fn latent_dim(&self) -> usize {
            DIM
        }
        fn input_channels(&self) -> usize {
            6
        }
    }

    /// Echoes the codes as latents and records the flags of the last call.
    struct EchoGenerator {
        size: usize,
        n_latent: usize,
        last_flags: Rc<Cell<Option<SynthesisFlags>>>,
        varmap: VarMap,
    }

    impl ParameterModule for EchoGenerator {
        fn module_name(&self) -> &str {
            "decoder"
        }
        fn varmap(&self) -> &VarMap {
            &self.varmap
        }
    }

    impl ImageGenerator for EchoGenerator {
        fn synthesize(
            &self,
            styles: &[Tensor],
            flags: SynthesisFlags,
        ) -> candle_core::Result<(Tensor, Option<Tensor>)> {
            self.last_flags.set(Some(flags));
            let latent = assemble_latent(styles, self.n_latent)?;
            let batch = latent.dim(0)?;
            let level = latent.mean_keepdim(2)?.mean_keepdim(1)?.unsqueeze(3)?;
            let image = level.broadcast_as((batch, 3, self.size, self.size))?.contiguous()?;
            Ok((image, flags.return_latents.then_some(latent)))
        }
        fn n_latent(&self) -> usize {
            self.n_latent
        }
        fn latent_dim(&self) -> usize {
            DIM
        }
        fn resolution(&self) -> usize {
            self.size
        }
    }

    fn mock_options(output_size: usize) -> Options {
        Options {
            output_size,
            latent_dim: DIM,
            ..Default::default()
        }
    }

    type FlagProbe = Rc<Cell<Option<SynthesisFlags>>>;

    fn mock_psp(output_size: usize, latent_avg: Option<Tensor>) -> Psp {
        mock_psp_with_probe(output_size, latent_avg).0
    }

    fn mock_psp_with_probe(output_size: usize, latent_avg: Option<Tensor>) -> (Psp, FlagProbe) {
        let opts = mock_options(output_size);
        let n = opts.n_styles();
        let device = Device::Cpu;
        let codes = Tensor::arange(0f32, (n * DIM) as f32, &device)
            .unwrap()
            .reshape((n, DIM))
            .unwrap();
        let encoder = FixedEncoder {
            codes,
            varmap: VarMap::new(),
        };
        let probe = FlagProbe::default();
        let decoder = EchoGenerator {
            size: output_size,
            n_latent: n,
            last_flags: probe.clone(),
            varmap: VarMap::new(),
        };
        let psp = Psp::from_parts(opts, Box::new(encoder), Box::new(decoder), latent_avg).unwrap();
        (psp, probe)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_first_iteration_adds_latent_avg() -> Result<()> {
        let device = Device::Cpu;
        let latent_avg = Tensor::ones((18, DIM), DType::F32, &device)?;
        let (psp, probe) = mock_psp_with_probe(1024, Some(latent_avg));

        let x = Tensor::zeros((1, 3, 256, 256), DType::F32, &device)?;
        let encoded = psp.encoder().encode(&x)?;
        let out = psp.forward(
            &x,
            &ForwardOptions {
                return_latents: true,
                resize: false,
                ..Default::default()
            },
        )?;

        assert_eq!(out.images.dims(), &[1, 3, 1024, 1024]);
        let expected = (encoded + 1.0)?;
        assert_eq!(max_abs_diff(out.latents.as_ref().unwrap(), &expected), 0.0);
        assert!(probe.get().unwrap().input_is_latent);

        let resized = psp.forward(&x, &ForwardOptions::default())?;
        assert_eq!(resized.images.dims(), &[1, 3, 256, 256]);
        assert!(resized.latents.is_none());
        Ok(())
    }

    #[test]
    fn test_refinement_adds_previous_latent() -> Result<()> {
        let device = Device::Cpu;
        let latent_avg = Tensor::ones((18, DIM), DType::F32, &device)?;
        let psp = mock_psp(1024, Some(latent_avg));

        let x = Tensor::zeros((1, 6, 256, 256), DType::F32, &device)?;
        let previous = Tensor::full(5f32, (1, 18, DIM), &device)?;
        let out = psp.forward(
            &x,
            &ForwardOptions {
                phase: IterationPhase::Refinement {
                    previous: &previous,
                },
                return_latents: true,
                ..Default::default()
            },
        )?;

        let expected = (psp.encoder().encode(&x)? + 5.0)?;
        assert_eq!(max_abs_diff(out.latents.as_ref().unwrap(), &expected), 0.0);
        assert_eq!(out.images.dims(), &[1, 3, 256, 256]);
        Ok(())
    }

    #[test]
    fn test_refinement_rejects_mismatched_previous() -> Result<()> {
        let device = Device::Cpu;
        let psp = mock_psp(16, None);
        let x = Tensor::zeros((1, 6, 8, 8), DType::F32, &device)?;
        let previous = Tensor::zeros((1, 5, DIM), DType::F32, &device)?;
        let opts = ForwardOptions {
            phase: IterationPhase::Refinement {
                previous: &previous,
            },
            ..Default::default()
        };
        assert!(matches!(psp.forward(&x, &opts), Err(Error::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn test_phase_inference_from_input() -> Result<()> {
        let device = Device::Cpu;
        let latent = Tensor::zeros((1, 6, DIM), DType::F32, &device)?;
        let six = Tensor::zeros((1, 6, 8, 8), DType::F32, &device)?;
        let three = Tensor::zeros((1, 3, 8, 8), DType::F32, &device)?;

        assert!(matches!(
            IterationPhase::from_input(&six, Some(&latent))?,
            IterationPhase::Refinement { .. }
        ));
        assert!(matches!(
            IterationPhase::from_input(&six, None)?,
            IterationPhase::Initial
        ));
        assert!(matches!(
            IterationPhase::from_input(&three, Some(&latent))?,
            IterationPhase::Initial
        ));
        Ok(())
    }

    #[test]
    fn test_missing_latent_avg_fails_fast() -> Result<()> {
        let psp = mock_psp(16, None);
        let x = Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            psp.forward(&x, &ForwardOptions::default()),
            Err(Error::MissingLatentAverage)
        ));
        Ok(())
    }

    #[test]
    fn test_input_code_matches_encoded_path() -> Result<()> {
        let device = Device::Cpu;
        let latent_avg = Tensor::randn(0f32, 1., (6, DIM), &device)?;
        let psp = mock_psp(16, Some(latent_avg));

        let x = Tensor::zeros((2, 3, 8, 8), DType::F32, &device)?;
        let encoded = psp.forward(&x, &ForwardOptions::default())?;
        let codes = psp.compose_codes(&x, IterationPhase::Initial)?;
        let direct = psp.forward(
            &codes,
            &ForwardOptions {
                input_code: true,
                input_is_full: true,
                ..Default::default()
            },
        )?;
        assert_eq!(max_abs_diff(&encoded.images, &direct.images), 0.0);
        Ok(())
    }

    #[test]
    fn test_input_is_latent_rules() {
        let cases = [
            (false, false, false, true),
            (true, false, false, false),
            (true, true, false, true),
            (true, false, true, true),
            (false, true, false, true),
        ];
        for (input_code, average_code, input_is_full, expected) in cases {
            let opts = ForwardOptions {
                input_code,
                average_code,
                input_is_full,
                ..Default::default()
            };
            assert_eq!(opts.input_is_latent(), expected);
        }
    }

    #[test]
    fn test_raw_codes_go_through_mapping() -> Result<()> {
        let (psp, probe) = mock_psp_with_probe(16, None);
        let codes = Tensor::zeros((1, 6, DIM), DType::F32, &Device::Cpu)?;
        psp.forward(
            &codes,
            &ForwardOptions {
                input_code: true,
                randomize_noise: false,
                ..Default::default()
            },
        )?;
        let flags = probe.get().unwrap();
        assert!(!flags.input_is_latent);
        assert!(!flags.randomize_noise);
        Ok(())
    }

    #[test]
    fn test_mask_blend_endpoints() -> Result<()> {
        let device = Device::Cpu;
        let codes = Tensor::randn(0f32, 1., (2, 6, DIM), &device)?;
        let inject = Tensor::randn(0f32, 1., (2, 6, DIM), &device)?;
        let mask = [2usize];

        let hard = apply_latent_mask(&codes, &mask, Some(&inject), None)?;
        let full = apply_latent_mask(&codes, &mask, Some(&inject), Some(1.0))?;
        assert!(max_abs_diff(&hard, &full) < 1e-6);
        assert_eq!(max_abs_diff(&hard.i((.., 2))?, &inject.i((.., 2))?), 0.0);

        let none = apply_latent_mask(&codes, &mask, Some(&inject), Some(0.0))?;
        assert!(max_abs_diff(&none, &codes) < 1e-6);

        let half = apply_latent_mask(&codes, &mask, Some(&inject), Some(0.5))?;
        let expected = ((inject.i((.., 2))? + codes.i((.., 2))?)? * 0.5)?;
        assert!(max_abs_diff(&half.i((.., 2))?, &expected) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_mask_zero_ablation() -> Result<()> {
        let device = Device::Cpu;
        let codes = Tensor::randn(0f32, 1., (2, 6, DIM), &device)?;
        let ablated = apply_latent_mask(&codes, &[4, 1], None, None)?;

        for i in 0..6 {
            let row = ablated.i((.., i))?;
            if i == 4 || i == 1 {
                assert_eq!(row.abs()?.max_all()?.to_scalar::<f32>()?, 0.0);
            } else {
                assert_eq!(max_abs_diff(&row, &codes.i((.., i))?), 0.0);
            }
        }
        assert!(matches!(
            apply_latent_mask(&codes, &[6], None, None),
            Err(Error::InvalidInput(_))
        ));
        Ok(())
    }

    #[test]
    fn test_forward_applies_mask() -> Result<()> {
        let device = Device::Cpu;
        let latent_avg = Tensor::zeros((6, DIM), DType::F32, &device)?;
        let psp = mock_psp(16, Some(latent_avg));
        let x = Tensor::zeros((1, 3, 8, 8), DType::F32, &device)?;
        let inject = Tensor::full(-1f32, (1, 6, DIM), &device)?;
        let mask = [2usize];

        let masked = psp.forward(
            &x,
            &ForwardOptions {
                latent_mask: Some(&mask),
                inject_latent: Some(&inject),
                alpha: Some(0.0),
                return_latents: true,
                ..Default::default()
            },
        )?;
        let plain = psp.forward(
            &x,
            &ForwardOptions {
                return_latents: true,
                ..Default::default()
            },
        )?;
        assert!(max_abs_diff(&masked.images, &plain.images) < 1e-6);

        let overwritten = psp.forward(
            &x,
            &ForwardOptions {
                latent_mask: Some(&mask),
                inject_latent: Some(&inject),
                return_latents: true,
                ..Default::default()
            },
        )?;
        let row = overwritten.latents.unwrap().i((0, 2))?.to_vec1::<f32>()?;
        assert_eq!(row, vec![-1.0; DIM]);
        Ok(())
    }

    #[test]
    fn test_from_parts_checks_style_counts() -> Result<()> {
        let opts = mock_options(16);
        let encoder = FixedEncoder {
            codes: Tensor::zeros((5, DIM), DType::F32, &Device::Cpu)?,
            varmap: VarMap::new(),
        };
        let decoder = EchoGenerator {
            size: 16,
            n_latent: 6,
            last_flags: FlagProbe::default(),
            varmap: VarMap::new(),
        };
        let result = Psp::from_parts(opts, Box::new(encoder), Box::new(decoder), None);
        assert!(matches!(result, Err(Error::Config(_))));
        Ok(())
    }

    fn small_options(generator_ada: bool) -> Options {
        Options {
            output_size: 16,
            generator_ada,
            encoder_type: "BackboneEncoder34".to_string(),
            encoder_weights: None,
            input_nc: 6,
            latent_dim: 8,
            n_mlp: 2,
            generator_channels: 8,
            encoder_width: 2,
            ..Default::default()
        }
    }

    fn small_psp(opts: &Options) -> Result<Psp> {
        let device = Device::Cpu;
        let encoder = StyleEncoder::new(
            EncoderKind::Backbone34,
            EncoderConfig::from_options(opts),
            &device,
        )?;
        let decoder: Box<dyn ImageGenerator> = if opts.generator_ada {
            Box::new(StyleGan2AdaGenerator::new(
                AdaGeneratorConfig::from_options(opts),
                &device,
            )?)
        } else {
            Box::new(StyleGan2Generator::new(
                StyleGan2Config::from_options(opts),
                &device,
            )?)
        };
        let latent_avg = Tensor::randn(0f32, 1., (opts.n_styles(), opts.latent_dim), &device)?;
        Psp::from_parts(opts.clone(), Box::new(encoder), decoder, Some(latent_avg))
    }

    fn deterministic() -> ForwardOptions<'static> {
        ForwardOptions {
            randomize_noise: false,
            resize: false,
            return_latents: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_joint_checkpoint_round_trip() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restyle.safetensors");

        let opts = small_options(false);
        let source = small_psp(&opts)?;
        source.save_checkpoint(&path)?;

        let loaded = Psp::new(&Options {
            checkpoint_path: Some(path),
            ..opts
        })?;

        let x = Tensor::randn(0f32, 1., (1, 6, 32, 32), &Device::Cpu)?;
        let a = source.forward(&x, &deterministic())?;
        let b = loaded.forward(&x, &deterministic())?;
        assert_eq!(a.images.dims(), &[1, 3, 16, 16]);
        assert!(max_abs_diff(&a.images, &b.images) < 1e-5);
        assert!(max_abs_diff(a.latents.as_ref().unwrap(), b.latents.as_ref().unwrap()) < 1e-5);
        Ok(())
    }

    #[test]
    fn test_joint_checkpoint_requires_every_decoder_key() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.safetensors");

        let opts = small_options(false);
        let source = small_psp(&opts)?;
        let state: StateDict = source
            .state_dict()?
            .iter()
            .filter(|(k, _)| *k != "decoder.input.input")
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        state.save(&path)?;

        let result = Psp::new(&Options {
            checkpoint_path: Some(path),
            ..opts
        });
        match result {
            Err(Error::StateDictMismatch { missing, .. }) => {
                assert_eq!(missing, vec!["input.input".to_string()]);
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("strict decoder load accepted a partial checkpoint"),
        }
        Ok(())
    }

    #[test]
    fn test_split_sources_with_stylegan2_weights() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ffhq.safetensors");

        let opts = small_options(false);
        let device = Device::Cpu;
        let generator = StyleGan2Generator::new(StyleGan2Config::from_options(&opts), &device)?;
        let mut ckpt = generator.state_dict()?.with_prefix("g_ema");
        ckpt.insert("latent_avg", Tensor::randn(0f32, 1., 8, &device)?);
        ckpt.insert("discriminator.extra", Tensor::zeros(1, DType::F32, &device)?);
        ckpt.save(&path)?;

        let psp = Psp::new(&Options {
            stylegan_weights: Some(path),
            encoder_weights: Some(PathBuf::from("missing/model_ir_se50.safetensors")),
            ..opts
        })?;
        assert_eq!(psp.latent_avg().unwrap().dims(), &[6, 8]);

        let codes = Tensor::randn(0f32, 1., (1, 6, 8), &device)?;
        let flags = SynthesisFlags {
            input_is_latent: true,
            randomize_noise: false,
            return_latents: false,
        };
        let (expected, _) = generator.synthesize(&[codes.clone()], flags)?;
        let out = psp.forward(
            &codes,
            &ForwardOptions {
                input_code: true,
                input_is_full: true,
                randomize_noise: false,
                resize: false,
                ..Default::default()
            },
        )?;
        assert!(max_abs_diff(&expected, &out.images) < 1e-5);
        Ok(())
    }

    #[test]
    fn test_split_sources_reject_generator_file_without_g_ema() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latent_only.safetensors");
        let mut ckpt = StateDict::new();
        ckpt.insert("latent_avg", Tensor::randn(0f32, 1., 8, &Device::Cpu)?);
        ckpt.save(&path)?;

        let result = Psp::new(&Options {
            stylegan_weights: Some(path.clone()),
            ..small_options(false)
        });
        match result {
            Err(Error::MissingWeights { path: missing, prefix }) => {
                assert_eq!(missing, path);
                assert_eq!(prefix, "g_ema");
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("generator without g_ema weights was accepted"),
        }
        Ok(())
    }

    #[test]
    fn test_joint_checkpoint_without_decoder_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoder_only.safetensors");
        let opts = small_options(false);
        let source = small_psp(&opts)?;
        source
            .state_dict()?
            .get_keys(ENCODER_PREFIX)
            .with_prefix(ENCODER_PREFIX)
            .save(&path)?;

        let result = Psp::new(&Options {
            checkpoint_path: Some(path),
            ..opts
        });
        assert!(matches!(result, Err(Error::MissingWeights { .. })));
        Ok(())
    }

    #[test]
    fn test_split_sources_widen_standalone_encoder() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let encoder_path = dir.path().join("model_ir_se34.safetensors");
        let generator_path = dir.path().join("ffhq.safetensors");
        let device = Device::Cpu;

        let opts = small_options(false);
        let rgb_encoder = StyleEncoder::new(
            EncoderKind::Backbone34,
            EncoderConfig {
                input_nc: 3,
                ..EncoderConfig::from_options(&opts)
            },
            &device,
        )?;
        let pretrained = rgb_encoder.state_dict()?;
        pretrained.save(&encoder_path)?;

        let generator = StyleGan2Generator::new(StyleGan2Config::from_options(&opts), &device)?;
        let mut ckpt = generator.state_dict()?.with_prefix("g_ema");
        ckpt.insert("latent_avg", Tensor::randn(0f32, 1., 8, &device)?);
        ckpt.save(&generator_path)?;

        let psp = Psp::new(&Options {
            encoder_weights: Some(encoder_path),
            stylegan_weights: Some(generator_path),
            input_nc: 6,
            ..opts
        })?;

        let loaded = psp.encoder().state_dict()?;
        let input_layer = loaded.get("input_layer.0.weight").unwrap();
        let saved = pretrained.get("input_layer.0.weight").unwrap();
        assert_eq!(input_layer.dim(1)?, 6);
        assert_eq!(saved.dim(1)?, 3);
        assert_eq!(max_abs_diff(&input_layer.narrow(1, 0, 3)?, saved), 0.0);

        let body = "body.0.res_layer.1.weight";
        assert_eq!(
            max_abs_diff(loaded.get(body).unwrap(), pretrained.get(body).unwrap()),
            0.0
        );
        Ok(())
    }

    #[test]
    fn test_split_sources_with_ada_weights() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ada.safetensors");

        let opts = small_options(true);
        assert_eq!(opts.n_styles(), 8);
        let device = Device::Cpu;
        let generator = StyleGan2AdaGenerator::new(AdaGeneratorConfig::from_options(&opts), &device)?;
        let mut ckpt = generator.state_dict()?.with_prefix("G").with_prefix("state_dict");
        ckpt.insert("latent_avg", Tensor::randn(0f32, 1., (1, 8), &device)?);
        ckpt.save(&path)?;

        let psp = Psp::new(&Options {
            stylegan_weights: Some(path),
            ..opts
        })?;
        assert_eq!(psp.latent_avg().unwrap().dims(), &[8, 8]);

        let x = Tensor::randn(0f32, 1., (2, 6, 32, 32), &device)?;
        let out = psp.forward(&x, &deterministic())?;
        assert_eq!(out.images.dims(), &[2, 3, 16, 16]);
        assert_eq!(out.latents.unwrap().dims(), &[2, 6, 8]);
        Ok(())
    }

    #[test]
    fn test_unknown_encoder_fails_before_loading() {
        let opts = Options {
            encoder_type: "TransformerEncoder".to_string(),
            checkpoint_path: Some(PathBuf::from("never/read.safetensors")),
            ..small_options(false)
        };
        assert!(matches!(Psp::new(&opts), Err(Error::InvalidEncoder(_))));
    }
}
