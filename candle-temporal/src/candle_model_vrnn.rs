use std::collections::BTreeMap;

use candle_core::{bail, DType, Result, Tensor};
use candle_nn::rnn::LSTMState;
use candle_nn::{Activation, Linear, Module, VarBuilder, LSTM, RNN};

use crate::candle_annealing::DecaySchedule;
use crate::candle_aux_layers::{feed_forward_stack, InputLayerConfig, InputProjection, StackLayers};
use crate::candle_latent_layers::{LatentPass, Normal};
use crate::candle_loss_functions::{kld_normal_isotropic, softplus};
use crate::candle_model_traits::{
    split_targets, total_from_losses, Mode, ReduceLoss, SequenceBatch, SequenceModelT, StepOutputs,
};
use crate::candle_output_layers::{
    build_loss_terms, sample_outputs, LossSpec, OutputHeads,
};

#[derive(Debug, Clone)]
pub struct VrnnConfig {
    pub input_size: usize,
    pub target_dims: Vec<usize>,
    pub latent_size: usize,
    pub cell_size: usize,
    /// Depth/width of the per-step feature extractors and distribution nets.
    pub num_hidden_layers: usize,
    pub num_hidden_units: usize,
    pub hidden_activation: Activation,
    pub kld_weight: DecaySchedule,
    pub input_layer: InputLayerConfig,
    pub loss: Vec<LossSpec>,
    pub reduce_loss: ReduceLoss,
    pub sigma_threshold: f64,
}

impl VrnnConfig {
    pub fn new(input_size: usize, target_dims: Vec<usize>, loss: Vec<LossSpec>) -> Self {
        Self {
            input_size,
            target_dims,
            latent_size: 16,
            cell_size: 64,
            num_hidden_layers: 1,
            num_hidden_units: 64,
            hidden_activation: Activation::Relu,
            kld_weight: DecaySchedule::Constant(1.0),
            input_layer: InputLayerConfig::default(),
            loss,
            reduce_loss: ReduceLoss::MeanSequence,
            sigma_threshold: 50.0,
        }
    }
}

/// Gaussian parametrized by a shared hidden stack with separate mean and
/// clamped-softplus sigma heads.
struct GaussHeads {
    hidden: StackLayers<Linear>,
    mu: Linear,
    sigma: Linear,
    sigma_threshold: f64,
}

impl GaussHeads {
    fn new(
        in_dim: usize,
        out_dim: usize,
        cfg: &VrnnConfig,
        vs: VarBuilder,
    ) -> Result<Self> {
        let hidden = feed_forward_stack(
            in_dim,
            cfg.num_hidden_layers,
            cfg.num_hidden_units,
            cfg.hidden_activation,
            vs.clone(),
        )?;
        let head_in = if cfg.num_hidden_layers == 0 {
            in_dim
        } else {
            cfg.num_hidden_units
        };
        Ok(Self {
            hidden,
            mu: candle_nn::linear(head_in, out_dim, vs.pp("mu"))?,
            sigma: candle_nn::linear(head_in, out_dim, vs.pp("sigma"))?,
            sigma_threshold: cfg.sigma_threshold,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Normal> {
        let h = self.hidden.forward(x)?;
        let mu = self.mu.forward(&h)?;
        let sigma = softplus(&self.sigma.forward(&h)?)?.clamp(1e-3, self.sigma_threshold)?;
        Ok(Normal { mu, sigma })
    }
}

struct VrnnStepOutput {
    q: Normal,
    p: Normal,
    z: Tensor,
    outputs: BTreeMap<String, Tensor>,
    sample: Tensor,
    state: LSTMState,
}

/// Fused per-step cell: one call parametrizes the prior and approximate
/// posterior, draws the latent sample, produces the declared output heads
/// and advances the recurrent state. The sequence driver treats it as
/// opaque and collects the same output set every step.
struct VrnnCell {
    phi_x: StackLayers<Linear>,
    phi_z: StackLayers<Linear>,
    prior: GaussHeads,
    posterior: GaussHeads,
    dec_hidden: StackLayers<Linear>,
    heads: OutputHeads,
    lstm: LSTM,
    specs: Vec<LossSpec>,
    target_dims: Vec<usize>,
}

impl VrnnCell {
    fn new(cfg: &VrnnConfig, in_dim: usize, vs: VarBuilder) -> Result<Self> {
        let units = cfg.num_hidden_units;
        let phi_x = feed_forward_stack(
            in_dim,
            1,
            units,
            cfg.hidden_activation,
            vs.pp("phi_x"),
        )?;
        let phi_z = feed_forward_stack(
            cfg.latent_size,
            1,
            units,
            cfg.hidden_activation,
            vs.pp("phi_z"),
        )?;
        let prior = GaussHeads::new(cfg.cell_size, cfg.latent_size, cfg, vs.pp("prior"))?;
        let posterior = GaussHeads::new(
            units + cfg.cell_size,
            cfg.latent_size,
            cfg,
            vs.pp("approximate_posterior"),
        )?;
        let dec_hidden = feed_forward_stack(
            units + cfg.cell_size,
            cfg.num_hidden_layers,
            units,
            cfg.hidden_activation,
            vs.pp("decoder"),
        )?;
        let head_in = if cfg.num_hidden_layers == 0 {
            units + cfg.cell_size
        } else {
            units
        };
        let heads = OutputHeads::new(
            head_in,
            &cfg.loss,
            &cfg.target_dims,
            cfg.sigma_threshold,
            vs.pp("output_layer"),
        )?;
        let lstm = candle_nn::lstm(2 * units, cfg.cell_size, Default::default(), vs.pp("rnn_cell"))?;
        Ok(Self {
            phi_x,
            phi_z,
            prior,
            posterior,
            dec_hidden,
            heads,
            lstm,
            specs: cfg.loss.clone(),
            target_dims: cfg.target_dims.clone(),
        })
    }

    /// One time step over (n x 1 x d) slices. In sampling mode the latent
    /// comes from the prior and the cell's own drawn output feeds the
    /// recurrence in place of ground truth.
    fn step(&self, x_n1d: &Tensor, state: &LSTMState, mode: Mode) -> Result<VrnnStepOutput> {
        let h_n1 = state.h().unsqueeze(1)?;

        let p = self.prior.forward(&h_n1)?;
        let x_phi = self.phi_x.forward(x_n1d)?;
        let q = self
            .posterior
            .forward(&Tensor::cat(&[&x_phi, &h_n1], 2)?)?;

        let z = if mode.is_sampling() {
            p.sample()?
        } else {
            q.sample()?
        };
        let z_phi = self.phi_z.forward(&z)?;

        let dec_h = self.dec_hidden.forward(&Tensor::cat(&[&z_phi, &h_n1], 2)?)?;
        let outputs = self.heads.forward(&dec_h)?;
        let sample = sample_outputs(&self.specs, &outputs, &self.target_dims, mode)?;

        let x_phi = if mode.is_sampling() {
            self.phi_x.forward(&sample)?
        } else {
            x_phi
        };
        let rnn_in = Tensor::cat(&[&x_phi, &z_phi], 2)?.squeeze(1)?;
        let state = self.lstm.step(&rnn_in, state)?;

        Ok(VrnnStepOutput {
            q,
            p,
            z,
            outputs,
            sample,
            state,
        })
    }
}

/// Variational recurrent model driving the fused cell across time.
pub struct Vrnn {
    cell: VrnnCell,
    input_proj: InputProjection,
    kld_weight: DecaySchedule,
    specs: Vec<LossSpec>,
    target_dims: Vec<usize>,
    reduce: ReduceLoss,
    input_size: usize,
}

impl Vrnn {
    pub fn new(cfg: VrnnConfig, vs: VarBuilder) -> Result<Self> {
        cfg.kld_weight.validate()?;
        if cfg.latent_size == 0 {
            bail!("latent_size must be positive");
        }
        if cfg.input_layer.num_layers > 0 {
            bail!("the fused cell consumes raw inputs; phi_x plays the projection role");
        }
        let input_proj =
            InputProjection::new(cfg.input_size, &cfg.input_layer, vs.pp("input_layer"))?;
        let cell = VrnnCell::new(&cfg, cfg.input_size, vs.pp("vrnn_cell"))?;
        Ok(Self {
            cell,
            input_proj,
            kld_weight: cfg.kld_weight.clone(),
            specs: cfg.loss,
            target_dims: cfg.target_dims,
            reduce: cfg.reduce_loss,
            input_size: cfg.input_size,
        })
    }

    fn drive(
        &self,
        x_ntd: &Tensor,
        mode: Mode,
    ) -> Result<(BTreeMap<String, Tensor>, Tensor, LatentPass)> {
        let t = x_ntd.dim(1)?;
        let mut state = self.cell.lstm.zero_state(x_ntd.dim(0)?)?;

        let mut per_key: BTreeMap<String, Vec<Tensor>> = BTreeMap::new();
        let mut q_mu = Vec::with_capacity(t);
        let mut q_sigma = Vec::with_capacity(t);
        let mut p_mu = Vec::with_capacity(t);
        let mut p_sigma = Vec::with_capacity(t);
        let mut z_steps = Vec::with_capacity(t);
        let mut samples = Vec::with_capacity(t);

        for s in 0..t {
            let x_s = x_ntd.narrow(1, s, 1)?;
            let step_out = self.cell.step(&x_s, &state, mode)?;
            state = step_out.state;
            for (key, value) in step_out.outputs.into_iter() {
                per_key.entry(key).or_default().push(value);
            }
            q_mu.push(step_out.q.mu);
            q_sigma.push(step_out.q.sigma);
            p_mu.push(step_out.p.mu);
            p_sigma.push(step_out.p.sigma);
            z_steps.push(step_out.z);
            samples.push(step_out.sample);
        }

        let cat_steps = |steps: &[Tensor]| -> Result<Tensor> {
            let refs: Vec<&Tensor> = steps.iter().collect();
            Tensor::cat(&refs, 1)
        };

        let mut outputs = BTreeMap::new();
        for (key, steps) in per_key.iter() {
            outputs.insert(key.clone(), cat_steps(steps)?);
        }
        let q = Normal {
            mu: cat_steps(&q_mu)?,
            sigma: cat_steps(&q_sigma)?,
        };
        let p = Normal {
            mu: cat_steps(&p_mu)?,
            sigma: cat_steps(&p_sigma)?,
        };
        outputs.insert("q_mu".to_string(), q.mu.clone());
        outputs.insert("q_sigma".to_string(), q.sigma.clone());
        outputs.insert("p_mu".to_string(), p.mu.clone());
        outputs.insert("p_sigma".to_string(), p.sigma.clone());

        let sample = cat_steps(&samples)?;
        let pass = LatentPass {
            p: vec![p],
            q: vec![q],
            samples: vec![cat_steps(&z_steps)?],
        };
        Ok((outputs, sample, pass))
    }
}

impl SequenceModelT for Vrnn {
    fn forward(&self, batch: &SequenceBatch, mode: Mode, step: usize) -> Result<StepOutputs> {
        let x = self.input_proj.forward(&batch.inputs, mode.is_training())?;
        let (outputs, sample, pass) = self.drive(&x, mode)?;

        let mask = batch.mask()?;
        let (losses, total_loss) = match &batch.targets {
            Some(targets) if !mode.is_sampling() => {
                let pieces = split_targets(targets, &self.target_dims)?;
                let mut losses =
                    build_loss_terms(&self.specs, &outputs, &pieces, &mask, &self.reduce)?;

                let kld_weight = if mode.is_training() {
                    self.kld_weight.at(step)
                } else {
                    1.0
                };
                let (q, p) = (&pass.q[0], &pass.p[0]);
                let kld = kld_normal_isotropic(&q.mu, &q.sigma, &p.mu, &p.sigma, false)?
                    .broadcast_mul(&mask)?;
                let term = (self.reduce.apply(&kld, &mask)? * kld_weight)?;
                losses.insert("loss_kld".to_string(), term);

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

    /// Warms the recurrent state up on the seed, then generates with the
    /// prior, feeding each drawn output back through the cell.
    fn sample(&self, seed: &Tensor, sample_length: usize) -> Result<Tensor> {
        let (n, seed_len, f) = seed.dims3()?;
        if self.target_dims.iter().sum::<usize>() != self.input_size || f != self.input_size {
            bail!(
                "generated steps ({} features) cannot be fed back as inputs ({} features)",
                self.target_dims.iter().sum::<usize>(),
                self.input_size
            );
        }

        let x = self.input_proj.forward(seed, false)?;
        let mut state = self.cell.lstm.zero_state(n)?;
        for s in 0..seed_len {
            let step_out = self.cell.step(&x.narrow(1, s, 1)?, &state, Mode::Eval)?;
            state = step_out.state;
        }

        let dummy = Tensor::zeros((n, 1, self.input_size), DType::F32, seed.device())?;
        let mut generated = Vec::with_capacity(sample_length);
        for _ in 0..sample_length {
            let step_out = self.cell.step(&dummy, &state, Mode::Sample)?;
            state = step_out.state;
            generated.push(step_out.sample);
        }
        let refs: Vec<&Tensor> = generated.iter().collect();
        Tensor::cat(&refs, 1)
    }
}
