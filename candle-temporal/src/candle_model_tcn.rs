use std::collections::BTreeMap;

use candle_core::{bail, Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

use crate::candle_aux_layers::{feed_forward_stack, InputLayerConfig, InputProjection, StackLayers};
use crate::candle_model_traits::{
    split_targets, total_from_losses, Mode, ReduceLoss, SequenceBatch, SequenceModelT, StepOutputs,
};
use crate::candle_output_layers::{
    build_loss_terms, sample_outputs, LossSpec, OutputHeads, OutputLayerConfig,
};
use crate::candle_tcn::{receptive_field_size, CausalConv1d, TcnConfig, TemporalConvStack};

/// Autoregressive model over a causal convolution stack. Targets are the
/// inputs shifted by one step (handled by the dataset); the output at step
/// t therefore predicts step t+1.
#[derive(Debug, Clone)]
pub struct TcnModelConfig {
    pub input_size: usize,
    pub target_dims: Vec<usize>,
    pub cnn: TcnConfig,
    pub input_layer: InputLayerConfig,
    pub output_layer: OutputLayerConfig,
    /// Block outputs concatenated for the output path when skip aggregation
    /// is off; empty selects the topmost block.
    pub tcn_output_layer_idx: Vec<usize>,
    pub loss: Vec<LossSpec>,
    pub reduce_loss: ReduceLoss,
    pub sigma_threshold: f64,
}

impl TcnModelConfig {
    pub fn new(input_size: usize, target_dims: Vec<usize>, loss: Vec<LossSpec>) -> Self {
        Self {
            input_size,
            target_dims,
            cnn: TcnConfig::default(),
            input_layer: InputLayerConfig::default(),
            output_layer: OutputLayerConfig::default(),
            tcn_output_layer_idx: Vec::new(),
            loss,
            reduce_loss: ReduceLoss::MeanSequence,
            sigma_threshold: 50.0,
        }
    }
}

pub struct Tcn {
    input_proj: InputProjection,
    conv0: CausalConv1d,
    stack: TemporalConvStack,
    out_hidden: StackLayers<Linear>,
    heads: OutputHeads,
    specs: Vec<LossSpec>,
    target_dims: Vec<usize>,
    reduce: ReduceLoss,
    activation: Activation,
    use_skip: bool,
    zero_padding: bool,
    output_layer_idx: Vec<usize>,
    receptive_field: usize,
}

impl Tcn {
    pub fn new(cfg: TcnModelConfig, vs: VarBuilder) -> Result<Self> {
        cfg.cnn.validate()?;
        if cfg
            .tcn_output_layer_idx
            .iter()
            .any(|&idx| idx >= cfg.cnn.num_layers)
        {
            bail!(
                "tcn_output_layer_idx out of range for {} blocks",
                cfg.cnn.num_layers
            );
        }

        let input_proj = InputProjection::new(cfg.input_size, &cfg.input_layer, vs.pp("input_layer"))?;
        // The initial projection into filter space is always zero padded so
        // the stack's own dilations fully determine the receptive field.
        let conv0 = CausalConv1d::new(
            input_proj.out_dim(),
            cfg.cnn.num_filters,
            cfg.cnn.filter_size,
            1,
            true,
            None,
            vs.pp("causal_conv_layer_0"),
        )?;
        let stack = TemporalConvStack::new(
            cfg.cnn.num_filters,
            cfg.cnn.num_layers,
            cfg.cnn.filter_size,
            &cfg.cnn,
            vs.pp("tcn"),
        )?;

        let output_layer_idx = if cfg.tcn_output_layer_idx.is_empty() {
            vec![cfg.cnn.num_layers - 1]
        } else {
            cfg.tcn_output_layer_idx.clone()
        };
        let core_dim = if cfg.cnn.use_skip {
            cfg.cnn.num_filters
        } else {
            cfg.cnn.num_filters * output_layer_idx.len()
        };
        let out_units = if cfg.output_layer.num_units == 0 {
            cfg.cnn.num_filters
        } else {
            cfg.output_layer.num_units
        };
        let out_hidden = feed_forward_stack(
            core_dim,
            cfg.output_layer.num_layers,
            out_units,
            cfg.cnn.activation,
            vs.pp("output_layer_hidden"),
        )?;
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
            conv0,
            stack,
            out_hidden,
            heads,
            specs: cfg.loss,
            target_dims: cfg.target_dims,
            reduce: cfg.reduce_loss,
            activation: cfg.cnn.activation,
            use_skip: cfg.cnn.use_skip,
            zero_padding: cfg.cnn.zero_padding,
            output_layer_idx,
            receptive_field: receptive_field_size(
                cfg.cnn.filter_size,
                &cfg.cnn.dilation_size[..cfg.cnn.num_layers],
            ),
        })
    }

    pub fn receptive_field(&self) -> usize {
        self.receptive_field
    }
}

impl SequenceModelT for Tcn {
    fn forward(&self, batch: &SequenceBatch, mode: Mode, _step: usize) -> Result<StepOutputs> {
        let t = batch.seq_len()?;
        if !self.zero_padding && t < self.receptive_field {
            bail!(
                "input sequence should have at least {} steps (receptive field), got {}",
                self.receptive_field,
                t
            );
        }

        let x = self.input_proj.forward(&batch.inputs, mode.is_training())?;
        let h = self.conv0.forward(&x)?;
        let (outs, skips) = self.stack.forward(&h)?;

        // Without zero padding earlier blocks are longer than the topmost
        // one; right-align everything on the final output width.
        let final_len = outs[outs.len() - 1].dim(1)?;
        let align = |layer: &Tensor| -> Result<Tensor> {
            let len = layer.dim(1)?;
            layer.narrow(1, len - final_len, final_len)
        };
        let core = if self.use_skip {
            let mut total = align(&skips[0])?;
            for skip in skips.iter().skip(1) {
                total = total.add(&align(skip)?)?;
            }
            self.activation.forward(&total)?
        } else {
            let selected = self
                .output_layer_idx
                .iter()
                .map(|&i| align(&outs[i]))
                .collect::<Result<Vec<_>>>()?;
            let refs: Vec<&Tensor> = selected.iter().collect();
            self.activation.forward(&Tensor::cat(&refs, 2)?)?
        };

        let out_h = self.out_hidden.forward(&core)?;
        let outputs = self.heads.forward(&out_h)?;
        let sample = sample_outputs(&self.specs, &outputs, &self.target_dims, mode)?;

        // Trim the initial steps consumed by the receptive field.
        let output_width = core.dim(1)?;
        let mask = batch.mask()?.narrow(1, t - output_width, output_width)?;

        let (losses, total_loss) = match &batch.targets {
            Some(targets) if !mode.is_sampling() => {
                let pieces = split_targets(targets, &self.target_dims)?
                    .into_iter()
                    .map(|piece| piece.narrow(1, t - output_width, output_width))
                    .collect::<Result<Vec<_>>>()?;
                let losses = build_loss_terms(&self.specs, &outputs, &pieces, &mask, &self.reduce)?;
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
            latent: None,
        })
    }

    fn sample(&self, seed: &Tensor, sample_length: usize) -> Result<Tensor> {
        let (_n, seed_len, f) = seed.dims3()?;
        if !self.zero_padding && seed_len < self.receptive_field {
            bail!(
                "seed sequence should have at least {} steps (receptive field), got {}",
                self.receptive_field,
                seed_len
            );
        }
        if self.target_dims.iter().sum::<usize>() != f {
            bail!("generated steps ({} features) cannot be fed back as inputs ({} features)",
                self.target_dims.iter().sum::<usize>(), f);
        }

        let mut sequence = seed.clone();
        for _ in 0..sample_length {
            let current = sequence.dim(1)?;
            let window = self.receptive_field.min(current);
            let model_input = sequence.narrow(1, current - window, window)?;
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
