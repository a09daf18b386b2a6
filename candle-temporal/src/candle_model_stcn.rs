use std::collections::BTreeMap;

use candle_core::{bail, DType, Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

use crate::candle_aux_layers::{feed_forward_stack, InputLayerConfig, InputProjection, StackLayers};
use crate::candle_latent_layers::{LatentLayer, LatentLayerConfig};
use crate::candle_model_traits::{
    split_targets, total_from_losses, Mode, ReduceLoss, SequenceBatch, SequenceModelT, StepOutputs,
};
use crate::candle_output_layers::{
    build_loss_terms, sample_outputs, LossSpec, OutputHeads, OutputLayerConfig, OutputLayerType,
};
use crate::candle_tcn::{TcnConfig, TemporalBlock, TemporalConvStack};

/// Stochastic temporal convolutional model: a causal convolution encoder
/// feeds a hierarchical (or flat) latent layer whose samples drive the
/// decoder and output heads.
#[derive(Debug, Clone)]
pub struct StcnConfig {
    pub input_size: usize,
    pub target_dims: Vec<usize>,
    /// Shared filter/gating/residual settings; encoder and decoder stacks
    /// are always zero padded so output length tracks input length.
    pub cnn: TcnConfig,
    pub num_encoder_layers: usize,
    /// 0 skips the decoder stack; the latent sample (plus the configured
    /// context) goes straight into the output layer.
    pub num_decoder_layers: usize,
    /// Kernel size of the decoder stack; 0 falls back to the encoder's.
    pub decoder_filter_size: usize,
    pub latent: LatentLayerConfig,
    pub decoder_use_enc_skip: bool,
    pub decoder_use_enc_last: bool,
    pub decoder_use_raw_inputs: bool,
    pub input_layer: InputLayerConfig,
    pub output_layer: OutputLayerConfig,
    pub loss: Vec<LossSpec>,
    pub reduce_loss: ReduceLoss,
    pub sigma_threshold: f64,
}

impl StcnConfig {
    pub fn new(input_size: usize, target_dims: Vec<usize>, loss: Vec<LossSpec>) -> Self {
        let cnn = TcnConfig::default();
        Self {
            input_size,
            target_dims,
            num_encoder_layers: cnn.num_layers,
            num_decoder_layers: 0,
            decoder_filter_size: 0,
            cnn,
            latent: LatentLayerConfig::default(),
            decoder_use_enc_skip: false,
            decoder_use_enc_last: false,
            decoder_use_raw_inputs: false,
            input_layer: InputLayerConfig::default(),
            output_layer: OutputLayerConfig::default(),
            loss,
            reduce_loss: ReduceLoss::MeanSequence,
            sigma_threshold: 50.0,
        }
    }
}

enum OutHidden {
    Conv1(StackLayers<Linear>),
    Tcn(Vec<TemporalBlock>),
}

impl OutHidden {
    fn forward(&self, x_ntd: &Tensor) -> Result<Tensor> {
        match self {
            Self::Conv1(stack) => stack.forward(x_ntd),
            Self::Tcn(blocks) => {
                let mut x = x_ntd.clone();
                for block in blocks.iter() {
                    let (out, _skip) = block.forward(&x)?;
                    x = out;
                }
                Ok(x)
            }
        }
    }
}

pub struct StochasticTcn {
    input_proj: InputProjection,
    encoder: TemporalConvStack,
    latent: LatentLayer,
    decoder: Option<TemporalConvStack>,
    out_hidden: OutHidden,
    heads: OutputHeads,
    specs: Vec<LossSpec>,
    target_dims: Vec<usize>,
    reduce: ReduceLoss,
    activation: Activation,
    dynamic_prior: bool,
    use_enc_skip: bool,
    use_enc_last: bool,
    use_raw_inputs: bool,
    receptive_field: usize,
}

impl StochasticTcn {
    pub fn new(cfg: StcnConfig, vs: VarBuilder) -> Result<Self> {
        if cfg.num_encoder_layers == 0 {
            bail!("the encoder needs at least one temporal block");
        }
        let mut enc_cfg = cfg.cnn.clone();
        enc_cfg.zero_padding = true;
        enc_cfg.num_layers = cfg.num_encoder_layers;
        enc_cfg.validate()?;

        let input_proj =
            InputProjection::new(cfg.input_size, &cfg.input_layer, vs.pp("input_layer"))?;
        let encoder = TemporalConvStack::new(
            input_proj.out_dim(),
            cfg.num_encoder_layers,
            enc_cfg.filter_size,
            &enc_cfg,
            vs.pp("encoder"),
        )?;

        let dynamic_prior = cfg.latent.dynamic_prior;
        let latent = LatentLayer::new(
            cfg.latent,
            cfg.num_encoder_layers,
            enc_cfg.num_filters,
            vs.pp("latent"),
        )?;

        let mut dec_in_dim = latent.output_dim();
        if cfg.decoder_use_enc_skip {
            dec_in_dim += enc_cfg.num_filters;
        }
        if cfg.decoder_use_enc_last {
            dec_in_dim += enc_cfg.num_filters;
        }
        if cfg.decoder_use_raw_inputs {
            dec_in_dim += input_proj.out_dim();
        }

        let decoder = if cfg.num_decoder_layers > 0 {
            let kernel = if cfg.decoder_filter_size == 0 {
                enc_cfg.filter_size
            } else {
                cfg.decoder_filter_size
            };
            let mut dec_cfg = enc_cfg.clone();
            dec_cfg.num_layers = cfg.num_decoder_layers;
            dec_cfg.validate()?;
            Some(TemporalConvStack::new(
                dec_in_dim,
                cfg.num_decoder_layers,
                kernel,
                &dec_cfg,
                vs.pp("decoder"),
            )?)
        } else {
            None
        };

        let core_dim = if decoder.is_some() {
            enc_cfg.num_filters
        } else {
            dec_in_dim
        };
        let out_units = if cfg.output_layer.num_units == 0 {
            enc_cfg.num_filters
        } else {
            cfg.output_layer.num_units
        };
        let out_hidden = match cfg.output_layer.layer_type {
            OutputLayerType::Conv1 => OutHidden::Conv1(feed_forward_stack(
                core_dim,
                cfg.output_layer.num_layers,
                out_units,
                enc_cfg.activation,
                vs.pp("output_layer_hidden"),
            )?),
            OutputLayerType::Tcn => {
                let kernel = if cfg.output_layer.filter_size == 0 {
                    enc_cfg.filter_size
                } else {
                    cfg.output_layer.filter_size
                };
                let mut blocks = Vec::with_capacity(cfg.output_layer.num_layers);
                let mut prev_dim = core_dim;
                for idx in 0..cfg.output_layer.num_layers {
                    blocks.push(TemporalBlock::new(
                        prev_dim,
                        out_units,
                        kernel,
                        1,
                        Some(enc_cfg.activation),
                        enc_cfg.use_gating,
                        enc_cfg.use_residual,
                        true,
                        vs.pp(format!("out_temporal_block_{}", idx + 1)),
                    )?);
                    prev_dim = out_units;
                }
                OutHidden::Tcn(blocks)
            }
        };
        let head_in = if cfg.output_layer.num_layers == 0 {
            core_dim
        } else {
            out_units
        };
        let heads = OutputHeads::new(
            head_in,
            &cfg.loss,
            &cfg.target_dims,
            cfg.sigma_threshold,
            vs.pp("output_layer"),
        )?;

        Ok(Self {
            input_proj,
            receptive_field: encoder.receptive_field(),
            encoder,
            latent,
            decoder,
            out_hidden,
            heads,
            specs: cfg.loss,
            target_dims: cfg.target_dims,
            reduce: cfg.reduce_loss,
            activation: enc_cfg.activation,
            dynamic_prior,
            use_enc_skip: cfg.decoder_use_enc_skip,
            use_enc_last: cfg.decoder_use_enc_last,
            use_raw_inputs: cfg.decoder_use_raw_inputs,
        })
    }

    pub fn receptive_field(&self) -> usize {
        self.receptive_field
    }
}

impl SequenceModelT for StochasticTcn {
    fn forward(&self, batch: &SequenceBatch, mode: Mode, step: usize) -> Result<StepOutputs> {
        let t = batch.seq_len()?;

        // Shift the inputs one step right so position s only sees strictly
        // earlier ground truth; the task becomes next-step prediction.
        let shifted = batch.inputs.pad_with_zeros(1, 1, 0)?;
        let hidden = self.input_proj.forward(&shifted, mode.is_training())?;

        let (enc_outs, enc_skips) = self.encoder.forward(&hidden)?;

        let p_input = enc_outs
            .iter()
            .map(|layer| layer.narrow(1, 0, t))
            .collect::<Result<Vec<_>>>()?;
        // With a dynamic prior the posterior may see the current step.
        let q_input = if self.dynamic_prior {
            enc_outs
                .iter()
                .map(|layer| layer.narrow(1, 1, t))
                .collect::<Result<Vec<_>>>()?
        } else {
            p_input.clone()
        };

        let (latent_sample, pass) = self.latent.build(&q_input, &p_input, mode)?;

        let mut dec_inputs = vec![latent_sample];
        if self.use_enc_skip {
            let mut total = enc_skips[0].clone();
            for skip in enc_skips.iter().skip(1) {
                total = total.add(skip)?;
            }
            dec_inputs.push(self.activation.forward(&total.narrow(1, 0, t)?)?);
        }
        if self.use_enc_last {
            dec_inputs.push(enc_outs[enc_outs.len() - 1].narrow(1, 0, t)?);
        }
        if self.use_raw_inputs {
            dec_inputs.push(hidden.narrow(1, 0, t)?);
        }
        let refs: Vec<&Tensor> = dec_inputs.iter().collect();
        let dec_in = Tensor::cat(&refs, 2)?;

        let core = match &self.decoder {
            Some(decoder) => {
                let (dec_outs, _) = decoder.forward(&dec_in)?;
                dec_outs[dec_outs.len() - 1].clone()
            }
            None => dec_in,
        };

        let out_h = self.out_hidden.forward(&core)?;
        let mut outputs = self.heads.forward(&out_h)?;
        if let LatentLayer::Gaussian(_) = &self.latent {
            outputs.insert("p_mu".to_string(), pass.p[0].mu.clone());
            outputs.insert("p_sigma".to_string(), pass.p[0].sigma.clone());
            outputs.insert("q_mu".to_string(), pass.q[0].mu.clone());
            outputs.insert("q_sigma".to_string(), pass.q[0].sigma.clone());
        }
        let sample = sample_outputs(&self.specs, &outputs, &self.target_dims, mode)?;

        let mask = batch.mask()?;
        let (losses, total_loss) = match &batch.targets {
            Some(targets) if !mode.is_sampling() => {
                let pieces = split_targets(targets, &self.target_dims)?;
                let mut losses =
                    build_loss_terms(&self.specs, &outputs, &pieces, &mask, &self.reduce)?;
                losses.extend(self.latent.build_loss(&pass, &mask, &self.reduce, step, mode)?);
                let total = total_from_losses(&losses)?;
                (losses, total)
            }
            _ => (BTreeMap::new(), None),
        };

        Ok(StepOutputs {
            outputs,
            losses,
            total_loss,
            sample,
            latent: Some(pass),
        })
    }

    /// Step-by-step generation from the prior. Every step re-feeds the
    /// growing history (clipped to the receptive field) through the full
    /// causal stack; a trailing zero step queries the next-step prediction.
    fn sample(&self, seed: &Tensor, sample_length: usize) -> Result<Tensor> {
        let (n, _seed_len, f) = seed.dims3()?;
        if self.target_dims.iter().sum::<usize>() != f {
            bail!(
                "generated steps ({} features) cannot be fed back as inputs ({} features)",
                self.target_dims.iter().sum::<usize>(),
                f
            );
        }

        let dummy = Tensor::zeros((n, 1, f), DType::F32, seed.device())?;
        let mut sequence = seed.clone();
        for _ in 0..sample_length {
            let with_dummy = Tensor::cat(&[&sequence, &dummy], 1)?;
            let current = with_dummy.dim(1)?;
            let window = self.receptive_field.min(current);
            let model_input = with_dummy.narrow(1, current - window, window)?;
            let batch = SequenceBatch::dense(model_input, None)?;
            let step_out = self.forward(&batch, Mode::Sample, 0)?;
            let width = step_out.sample.dim(1)?;
            let next = step_out.sample.narrow(1, width - 1, 1)?;
            sequence = Tensor::cat(&[&sequence, &next], 1)?;
        }
        let total = sequence.dim(1)?;
        sequence.narrow(1, total - sample_length, sample_length)
    }
}
