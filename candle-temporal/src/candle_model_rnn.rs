use std::collections::BTreeMap;

use candle_core::{bail, Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder, LSTM, RNN};

use crate::candle_aux_layers::{feed_forward_stack, InputLayerConfig, InputProjection, StackLayers};
use crate::candle_model_traits::{
    split_targets, total_from_losses, Mode, ReduceLoss, SequenceBatch, SequenceModelT, StepOutputs,
};
use crate::candle_output_layers::{
    build_loss_terms, sample_outputs, LossSpec, OutputHeads, OutputLayerConfig,
};

/// Auto-regressive recurrent model: the output at step t parametrizes the
/// distribution of step t+1 (targets are the inputs shifted by one step).
#[derive(Debug, Clone)]
pub struct RnnConfig {
    pub input_size: usize,
    pub target_dims: Vec<usize>,
    pub cell_size: usize,
    pub activation: Activation,
    pub input_layer: InputLayerConfig,
    pub output_layer: OutputLayerConfig,
    pub loss: Vec<LossSpec>,
    pub reduce_loss: ReduceLoss,
    pub sigma_threshold: f64,
}

impl RnnConfig {
    pub fn new(input_size: usize, target_dims: Vec<usize>, loss: Vec<LossSpec>) -> Self {
        Self {
            input_size,
            target_dims,
            cell_size: 64,
            activation: Activation::Relu,
            input_layer: InputLayerConfig::default(),
            output_layer: OutputLayerConfig::default(),
            loss,
            reduce_loss: ReduceLoss::MeanSequence,
            sigma_threshold: 50.0,
        }
    }
}

pub struct RnnAutoregressive {
    input_proj: InputProjection,
    lstm: LSTM,
    out_hidden: StackLayers<Linear>,
    heads: OutputHeads,
    specs: Vec<LossSpec>,
    target_dims: Vec<usize>,
    reduce: ReduceLoss,
}

impl RnnAutoregressive {
    pub fn new(cfg: RnnConfig, vs: VarBuilder) -> Result<Self> {
        let input_proj =
            InputProjection::new(cfg.input_size, &cfg.input_layer, vs.pp("input_layer"))?;
        let lstm = candle_nn::lstm(
            input_proj.out_dim(),
            cfg.cell_size,
            Default::default(),
            vs.pp("rnn_cell"),
        )?;

        let out_units = if cfg.output_layer.num_units == 0 {
            cfg.cell_size
        } else {
            cfg.output_layer.num_units
        };
        let out_hidden = feed_forward_stack(
            cfg.cell_size,
            cfg.output_layer.num_layers,
            out_units,
            cfg.activation,
            vs.pp("output_layer_hidden"),
        )?;
        let head_in = if cfg.output_layer.num_layers == 0 {
            cfg.cell_size
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
            lstm,
            out_hidden,
            heads,
            specs: cfg.loss,
            target_dims: cfg.target_dims,
            reduce: cfg.reduce_loss,
        })
    }

    fn predict_from_hidden(&self, h_ntd: &Tensor, mode: Mode) -> Result<(BTreeMap<String, Tensor>, Tensor)> {
        let out_h = self.out_hidden.forward(h_ntd)?;
        let outputs = self.heads.forward(&out_h)?;
        let sample = sample_outputs(&self.specs, &outputs, &self.target_dims, mode)?;
        Ok((outputs, sample))
    }
}

impl SequenceModelT for RnnAutoregressive {
    fn forward(&self, batch: &SequenceBatch, mode: Mode, _step: usize) -> Result<StepOutputs> {
        let x = self.input_proj.forward(&batch.inputs, mode.is_training())?;
        let states = self.lstm.seq(&x)?;
        let h = self.lstm.states_to_tensor(&states)?;

        let (outputs, sample) = self.predict_from_hidden(&h, mode)?;

        let mask = batch.mask()?;
        let (losses, total_loss) = match &batch.targets {
            Some(targets) if !mode.is_sampling() => {
                let pieces = split_targets(targets, &self.target_dims)?;
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

    /// Feeds the seed through the recurrent cell, then generates step by
    /// step, feeding each drawn output and the carried state back in.
    fn sample(&self, seed: &Tensor, sample_length: usize) -> Result<Tensor> {
        let (n, seed_len, f) = seed.dims3()?;
        if self.target_dims.iter().sum::<usize>() != f {
            bail!(
                "generated steps ({} features) cannot be fed back as inputs ({} features)",
                self.target_dims.iter().sum::<usize>(),
                f
            );
        }

        let x = self.input_proj.forward(seed, false)?;
        let mut state = self.lstm.zero_state(n)?;
        for s in 0..seed_len {
            let x_s = x.narrow(1, s, 1)?.squeeze(1)?;
            state = self.lstm.step(&x_s, &state)?;
        }

        let mut generated = Vec::with_capacity(sample_length);
        for _ in 0..sample_length {
            let h = state.h().unsqueeze(1)?;
            let (_outputs, next) = self.predict_from_hidden(&h, Mode::Sample)?;
            generated.push(next.clone());
            let x_s = self.input_proj.forward(&next, false)?.squeeze(1)?;
            state = self.lstm.step(&x_s, &state)?;
        }
        let refs: Vec<&Tensor> = generated.iter().collect();
        Tensor::cat(&refs, 1)
    }
}
