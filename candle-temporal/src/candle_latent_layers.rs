use std::collections::BTreeMap;

use candle_core::{bail, Device, Error, Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

use crate::candle_annealing::DecaySchedule;
use crate::candle_aux_layers::{feed_forward_stack, StackLayers};
use crate::candle_loss_functions::{kld_normal_isotropic, softplus};
use crate::candle_model_traits::{Mode, ReduceLoss};
use crate::candle_tcn::GatedCausalConv;

/// A diagonal Gaussian given by its mean and standard deviation, both
/// shaped (n x t x k).
#[derive(Clone)]
pub struct Normal {
    pub mu: Tensor,
    pub sigma: Tensor,
}

impl Normal {
    pub fn standard(n: usize, t: usize, k: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            mu: Tensor::zeros((n, t, k), candle_core::DType::F32, device)?,
            sigma: Tensor::ones((n, t, k), candle_core::DType::F32, device)?,
        })
    }

    /// Reparameterized draw: `mu + sigma * eps` with `eps ~ N(0, I)`.
    pub fn sample(&self) -> Result<Tensor> {
        let eps = Tensor::randn_like(&self.mu, 0.0, 1.0)?;
        self.mu.add(&self.sigma.mul(&eps)?)
    }
}

/// Precision-weighted combination of two Gaussians.
///
/// Each distribution is weighted by its inverse variance; the combined
/// variance is `1 / (sigma1^-2 + sigma2^-2)` and the returned sigma is its
/// square root, so combining two identical `N(mu, sigma)` yields
/// `(mu, sigma / sqrt(2))`.
pub fn combine_normal_dist(dist1: &Normal, dist2: &Normal) -> Result<Normal> {
    let precision1 = dist1.sigma.powf(-2.0)?;
    let precision2 = dist2.sigma.powf(-2.0)?;
    let total = precision1.add(&precision2)?;

    let mu = dist1
        .mu
        .mul(&precision1)?
        .add(&dist2.mu.mul(&precision2)?)?
        .div(&total)?;
    let sigma = total.recip()?.sqrt()?;
    Ok(Normal { mu, sigma })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatentLayerKind {
    Gaussian,
    Ladder,
}

/// Network family parametrizing the latent Gaussians.
#[derive(Debug, Clone)]
pub enum LatentStructure {
    /// Per-step 1x1 projections.
    Conv1,
    /// Causal convolutions over a temporal context.
    Tcn { kernel_size: usize, dilation: usize },
}

/// Scalar size shared by all stochastic layers, or one size per layer.
#[derive(Debug, Clone)]
pub enum LatentSize {
    Uniform(usize),
    PerLayer(Vec<usize>),
}

impl LatentSize {
    fn resolve(&self, num_layers: usize) -> Result<Vec<usize>> {
        let sizes = match self {
            Self::Uniform(k) => vec![*k; num_layers],
            Self::PerLayer(v) => {
                if v.len() != num_layers {
                    bail!(
                        "latent_size lists {} entries for {} stochastic layers",
                        v.len(),
                        num_layers
                    );
                }
                v.clone()
            }
        };
        if sizes.iter().any(|&k| k == 0) {
            bail!("latent sizes must be positive");
        }
        Ok(sizes)
    }
}

#[derive(Debug, Clone)]
pub struct LatentLayerConfig {
    pub kind: LatentLayerKind,
    pub layer_structure: LatentStructure,
    pub latent_size: LatentSize,
    pub num_hidden_layers: usize,
    pub num_hidden_units: usize,
    pub hidden_activation: Activation,
    /// KL-divergence weight, possibly annealed over training steps. Forced
    /// to 1 outside training so reported bounds stay faithful.
    pub kld_weight: DecaySchedule,
    pub use_temporal_kld: bool,
    pub tkld_weight: f64,
    /// Number of deterministic layers consumed per stochastic layer.
    pub vertical_dilation: usize,
    /// Priors conditioned on deterministic representations (and the
    /// adjacent layer's sample) instead of being fixed per layer.
    pub dynamic_prior: bool,
    /// Standard-normal prior for the outermost layer even when dynamic.
    pub use_fixed_pz1: bool,
    pub precision_weighted_update: bool,
    /// Lower posterior layers are conditioned on upper posterior samples.
    pub recursive_q: bool,
    pub top_down_latents: bool,
    /// Concatenate the samples of all stochastic layers as the output.
    pub dense_z: bool,
    /// Reuse one drawn sample for every downstream conditioning within a
    /// hierarchy pass instead of redrawing.
    pub use_same_q_sample: bool,
    /// When positive, sigmas are clamped to [1e-3, threshold].
    pub latent_sigma_threshold: f64,
}

impl Default for LatentLayerConfig {
    fn default() -> Self {
        Self {
            kind: LatentLayerKind::Ladder,
            layer_structure: LatentStructure::Conv1,
            latent_size: LatentSize::Uniform(16),
            num_hidden_layers: 1,
            num_hidden_units: 64,
            hidden_activation: Activation::Relu,
            kld_weight: DecaySchedule::Constant(1.0),
            use_temporal_kld: false,
            tkld_weight: 0.1,
            vertical_dilation: 1,
            dynamic_prior: true,
            use_fixed_pz1: false,
            precision_weighted_update: true,
            recursive_q: true,
            top_down_latents: true,
            dense_z: false,
            use_same_q_sample: false,
            latent_sigma_threshold: 0.0,
        }
    }
}

enum ParamNet {
    Conv1 {
        hidden: StackLayers<Linear>,
        head: Linear,
    },
    Tcn {
        hidden: Vec<GatedCausalConv>,
        head: Linear,
    },
}

impl ParamNet {
    fn new(in_dim: usize, out_dim: usize, cfg: &LatentLayerConfig, vs: VarBuilder) -> Result<Self> {
        let head_in = if cfg.num_hidden_layers == 0 {
            in_dim
        } else {
            cfg.num_hidden_units
        };
        match cfg.layer_structure {
            LatentStructure::Conv1 => {
                let hidden = feed_forward_stack(
                    in_dim,
                    cfg.num_hidden_layers,
                    cfg.num_hidden_units,
                    cfg.hidden_activation,
                    vs.clone(),
                )?;
                let head = candle_nn::linear(head_in, out_dim, vs.pp("out"))?;
                Ok(Self::Conv1 { hidden, head })
            }
            LatentStructure::Tcn {
                kernel_size,
                dilation,
            } => {
                let mut hidden = Vec::with_capacity(cfg.num_hidden_layers);
                let mut prev_dim = in_dim;
                for j in 0..cfg.num_hidden_layers {
                    hidden.push(GatedCausalConv::new(
                        prev_dim,
                        cfg.num_hidden_units,
                        kernel_size,
                        dilation,
                        true,
                        vs.pp(format!("tcn.{}", j)),
                    )?);
                    prev_dim = cfg.num_hidden_units;
                }
                let head = candle_nn::linear(prev_dim, out_dim, vs.pp("out"))?;
                Ok(Self::Tcn { hidden, head })
            }
        }
    }

    fn forward(&self, x_ntd: &Tensor) -> Result<Tensor> {
        match self {
            Self::Conv1 { hidden, head } => head.forward(&hidden.forward(x_ntd)?),
            Self::Tcn { hidden, head } => {
                let mut x = x_ntd.clone();
                for layer in hidden.iter() {
                    x = layer.forward(&x)?;
                }
                head.forward(&x)
            }
        }
    }
}

/// Separate mu and sigma networks parametrizing one Gaussian. The sigma
/// head goes through a softplus and an optional clamp so standard
/// deviations stay in [1e-3, threshold].
struct NormalParamNet {
    mu_net: ParamNet,
    sigma_net: ParamNet,
    sigma_threshold: f64,
}

impl NormalParamNet {
    fn new(in_dim: usize, out_dim: usize, cfg: &LatentLayerConfig, vs: VarBuilder) -> Result<Self> {
        Ok(Self {
            mu_net: ParamNet::new(in_dim, out_dim, cfg, vs.pp("mu"))?,
            sigma_net: ParamNet::new(in_dim, out_dim, cfg, vs.pp("sigma"))?,
            sigma_threshold: cfg.latent_sigma_threshold,
        })
    }

    fn forward(&self, x_ntd: &Tensor) -> Result<Normal> {
        let mu = self.mu_net.forward(x_ntd)?;
        let sigma = softplus(&self.sigma_net.forward(x_ntd)?)?;
        let sigma = if self.sigma_threshold > 0.0 {
            sigma.clamp(1e-3, self.sigma_threshold)?
        } else {
            sigma
        };
        Ok(Normal { mu, sigma })
    }
}

/// Per-layer prior/posterior record of one hierarchy pass, indexed by
/// stochastic layer `0..num_stochastic_layers`. Built once per forward and
/// never mutated afterwards.
pub struct LatentPass {
    pub p: Vec<Normal>,
    pub q: Vec<Normal>,
    pub samples: Vec<Tensor>,
}

/// Flat per-step Gaussian latent variable.
///
/// The prior is estimated from causal input only; the approximate posterior
/// may see future context. In sampling mode the sample is drawn from the
/// prior.
pub struct GaussianLatentLayer {
    cfg: LatentLayerConfig,
    p_net: NormalParamNet,
    q_net: NormalParamNet,
    latent_size: usize,
}

impl GaussianLatentLayer {
    pub fn new(
        cfg: LatentLayerConfig,
        q_input_dim: usize,
        p_input_dim: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        cfg.kld_weight.validate()?;
        let latent_size = cfg.latent_size.resolve(1)?[0];
        Ok(Self {
            p_net: NormalParamNet::new(p_input_dim, latent_size, &cfg, vs.pp("prior"))?,
            q_net: NormalParamNet::new(
                q_input_dim,
                latent_size,
                &cfg,
                vs.pp("approximate_posterior"),
            )?,
            cfg,
            latent_size,
        })
    }

    pub fn build(&self, q_input: &Tensor, p_input: &Tensor, mode: Mode) -> Result<(Tensor, LatentPass)> {
        let p_dist = self.p_net.forward(p_input)?;
        let q_dist = self.q_net.forward(q_input)?;

        let sample = if mode.is_sampling() {
            p_dist.sample()?
        } else {
            q_dist.sample()?
        };
        let pass = LatentPass {
            p: vec![p_dist],
            q: vec![q_dist],
            samples: vec![sample.clone()],
        };
        Ok((sample, pass))
    }

    pub fn build_loss(
        &self,
        pass: &LatentPass,
        mask: &Tensor,
        reduce: &ReduceLoss,
        step: usize,
        mode: Mode,
    ) -> Result<BTreeMap<String, Tensor>> {
        let mut ops_loss = BTreeMap::new();
        if mode.is_sampling() {
            return Ok(ops_loss);
        }
        let kld_weight = if mode.is_training() {
            self.cfg.kld_weight.at(step)
        } else {
            1.0
        };

        let (q, p) = (&pass.q[0], &pass.p[0]);
        let kld = kld_normal_isotropic(&q.mu, &q.sigma, &p.mu, &p.sigma, false)?;
        let term = (reduce.apply(&kld.broadcast_mul(mask)?, mask)? * kld_weight)?;
        ops_loss.insert("loss_kld".to_string(), term);

        // KL between consecutive posterior steps, with the time-shifted
        // prior detached from the gradient graph. Training only.
        if mode.is_training() && self.cfg.use_temporal_kld {
            let (n, t, k) = q.mu.dims3()?;
            let device = q.mu.device();
            let head_mu = Tensor::zeros((n, 1, k), candle_core::DType::F32, device)?;
            let head_sigma = Tensor::ones((n, 1, k), candle_core::DType::F32, device)?;
            let (shift_mu, shift_sigma) = if t > 1 {
                (
                    Tensor::cat(&[&head_mu, &q.mu.narrow(1, 0, t - 1)?], 1)?,
                    Tensor::cat(&[&head_sigma, &q.sigma.narrow(1, 0, t - 1)?], 1)?,
                )
            } else {
                (head_mu, head_sigma)
            };
            let tkld = kld_normal_isotropic(
                &q.mu,
                &q.sigma,
                &shift_mu.detach(),
                &shift_sigma.detach(),
                false,
            )?;
            let term = (reduce.apply(&tkld.broadcast_mul(mask)?, mask)? * self.cfg.tkld_weight)?;
            ops_loss.insert("loss_temporal_kld".to_string(), term);
        }
        Ok(ops_loss)
    }
}

struct LadderLayerNets {
    /// Absent for the outermost layer when its prior is fixed N(0, I).
    p_net: Option<NormalParamNet>,
    q_net: NormalParamNet,
}

/// Hierarchy of stochastic layers attached to a stack of deterministic
/// layers at stride `vertical_dilation`.
///
/// The pass starts at the outermost layer (top or bottom per
/// `top_down_latents`), estimates its prior and approximate posterior,
/// optionally corrects the posterior by precision-weighted combination with
/// the prior, draws a sample and conditions the next layer on it.
pub struct LadderLatentLayer {
    cfg: LatentLayerConfig,
    layers: Vec<LadderLayerNets>,
    /// Stochastic layer indices in processing order.
    order: Vec<usize>,
    sizes: Vec<usize>,
    num_d_layers: usize,
    num_s_layers: usize,
    vertical_dilation: usize,
}

impl LadderLatentLayer {
    pub fn new(
        cfg: LatentLayerConfig,
        num_d_layers: usize,
        det_dim: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        cfg.kld_weight.validate()?;
        if cfg.vertical_dilation == 0 {
            bail!("vertical_dilation must be positive");
        }
        if num_d_layers == 0 || num_d_layers % cfg.vertical_dilation != 0 {
            bail!(
                "{} deterministic layers not divisible by vertical dilation {}",
                num_d_layers,
                cfg.vertical_dilation
            );
        }
        let num_s_layers = num_d_layers / cfg.vertical_dilation;
        let sizes = cfg.latent_size.resolve(num_s_layers)?;

        let order: Vec<usize> = if cfg.top_down_latents {
            (0..num_s_layers).rev().collect()
        } else {
            (0..num_s_layers).collect()
        };

        let mut layers = Vec::with_capacity(num_s_layers);
        for (pos, &sl) in order.iter().enumerate() {
            let p_net = if pos == 0 {
                if cfg.dynamic_prior && !cfg.use_fixed_pz1 {
                    Some(NormalParamNet::new(
                        det_dim,
                        sizes[sl],
                        &cfg,
                        vs.pp(format!("p_{}", sl + 1)),
                    )?)
                } else {
                    None
                }
            } else {
                let prev_sl = order[pos - 1];
                let p_in_dim = if cfg.dynamic_prior {
                    det_dim + sizes[prev_sl]
                } else {
                    sizes[prev_sl]
                };
                Some(NormalParamNet::new(
                    p_in_dim,
                    sizes[sl],
                    &cfg,
                    vs.pp(format!("p_{}", sl + 1)),
                )?)
            };

            let q_in_dim = if cfg.recursive_q && pos > 0 {
                det_dim + sizes[order[pos - 1]]
            } else {
                det_dim
            };
            let q_net =
                NormalParamNet::new(q_in_dim, sizes[sl], &cfg, vs.pp(format!("q_{}", sl + 1)))?;
            layers.push(LadderLayerNets { p_net, q_net });
        }

        Ok(Self {
            vertical_dilation: cfg.vertical_dilation,
            cfg,
            layers,
            order,
            sizes,
            num_d_layers,
            num_s_layers,
        })
    }

    pub fn num_stochastic_layers(&self) -> usize {
        self.num_s_layers
    }

    /// Feature size of the latent sample handed to the decoder.
    pub fn output_dim(&self) -> usize {
        if self.cfg.dense_z {
            self.sizes.iter().sum()
        } else {
            self.sizes[self.order[self.order.len() - 1]]
        }
    }

    /// Runs one hierarchy pass over the deterministic representations.
    ///
    /// `q_input` and `p_input` list the deterministic layers bottom to top;
    /// every `vertical_dilation`-th layer feeds a stochastic variable. In
    /// sampling mode with a dynamic prior the posterior networks are not
    /// evaluated and the prior takes their place.
    pub fn build(
        &self,
        q_input: &[Tensor],
        p_input: &[Tensor],
        mode: Mode,
    ) -> Result<(Tensor, LatentPass)> {
        if q_input.len() != self.num_d_layers || p_input.len() != self.num_d_layers {
            bail!(
                "expected {} deterministic layers, got q: {} / p: {}",
                self.num_d_layers,
                q_input.len(),
                p_input.len()
            );
        }

        let n = self.num_s_layers;
        let mut p_dists: Vec<Option<Normal>> = (0..n).map(|_| None).collect();
        let mut q_dists: Vec<Option<Normal>> = (0..n).map(|_| None).collect();
        let mut all_samples = Vec::with_capacity(n);

        // Outermost layer.
        let sl = self.order[0];
        let dl = (sl + 1) * self.vertical_dilation - 1;
        let mut p_dist = match &self.layers[0].p_net {
            Some(net) => net.forward(&p_input[dl])?,
            None => {
                let (b, t, _) = p_input[0].dims3()?;
                Normal::standard(b, t, self.sizes[sl], p_input[0].device())?
            }
        };
        p_dists[sl] = Some(p_dist.clone());

        let mut posterior = if mode.is_sampling() && self.cfg.dynamic_prior {
            p_dist.clone()
        } else {
            let q_approx = self.layers[0].q_net.forward(&q_input[dl])?;
            if self.cfg.precision_weighted_update {
                combine_normal_dist(&q_approx, &p_dist)?
            } else {
                q_approx
            }
        };
        q_dists[sl] = Some(posterior.clone());
        let mut posterior_sample = posterior.sample()?;
        all_samples.push(posterior_sample.clone());

        // Remaining layers, conditioned on the adjacent layer's sample.
        for (pos, &sl) in self.order.iter().enumerate().skip(1) {
            let dl = (sl + 1) * self.vertical_dilation - 1;

            if !self.cfg.use_same_q_sample {
                posterior_sample = posterior.sample()?;
            }
            let p_in = if self.cfg.dynamic_prior {
                Tensor::cat(&[&p_input[dl], &posterior_sample], 2)?
            } else {
                posterior_sample.clone()
            };
            let Some(p_net) = &self.layers[pos].p_net else {
                bail!("prior network missing for stochastic layer {}", sl);
            };
            p_dist = p_net.forward(&p_in)?;
            p_dists[sl] = Some(p_dist.clone());

            if mode.is_sampling() && self.cfg.dynamic_prior {
                posterior = p_dist.clone();
            } else {
                let q_in = if self.cfg.recursive_q {
                    if !self.cfg.use_same_q_sample {
                        posterior_sample = posterior.sample()?;
                    }
                    Tensor::cat(&[&q_input[dl], &posterior_sample], 2)?
                } else {
                    q_input[dl].clone()
                };
                let q_approx = self.layers[pos].q_net.forward(&q_in)?;
                posterior = if self.cfg.precision_weighted_update {
                    combine_normal_dist(&q_approx, &p_dist)?
                } else {
                    q_approx
                };
            }
            q_dists[sl] = Some(posterior.clone());
            posterior_sample = posterior.sample()?;
            all_samples.push(posterior_sample.clone());
        }

        let latent_sample = if self.cfg.dense_z {
            let refs: Vec<&Tensor> = all_samples.iter().collect();
            Tensor::cat(&refs, 2)?
        } else {
            posterior.sample()?
        };

        let unwrap_all = |dists: Vec<Option<Normal>>| -> Result<Vec<Normal>> {
            dists
                .into_iter()
                .map(|d| d.ok_or_else(|| Error::Msg("stochastic layer left unbuilt".to_string())))
                .collect()
        };
        let pass = LatentPass {
            p: unwrap_all(p_dists)?,
            q: unwrap_all(q_dists)?,
            samples: all_samples,
        };
        Ok((latent_sample, pass))
    }

    /// Sum of per-layer KL terms, each masked, reduced and weighted. The
    /// per-layer values are exposed as `KL{sl}` diagnostics outside
    /// training.
    pub fn build_loss(
        &self,
        pass: &LatentPass,
        mask: &Tensor,
        reduce: &ReduceLoss,
        step: usize,
        mode: Mode,
    ) -> Result<BTreeMap<String, Tensor>> {
        let mut ops_loss = BTreeMap::new();
        if mode.is_sampling() {
            return Ok(ops_loss);
        }
        let kld_weight = if mode.is_training() {
            self.cfg.kld_weight.at(step)
        } else {
            1.0
        };

        let mut kld_loss: Option<Tensor> = None;
        for sl in (0..self.num_s_layers).rev() {
            let (q, p) = (&pass.q[sl], &pass.p[sl]);
            let seq_kld = kld_normal_isotropic(&q.mu, &q.sigma, &p.mu, &p.sigma, false)?
                .broadcast_mul(mask)?;
            let term = (reduce.apply(&seq_kld, mask)? * kld_weight)?;
            if !mode.is_training() {
                ops_loss.insert(format!("KL{}", sl), term.detach());
            }
            kld_loss = Some(match kld_loss {
                Some(total) => total.add(&term)?,
                None => term,
            });
        }
        let total = kld_loss.ok_or_else(|| Error::Msg("no stochastic layers".to_string()))?;
        ops_loss.insert("loss_kld".to_string(), total);
        Ok(ops_loss)
    }
}

/// Tagged dispatch over the latent layer variants.
pub enum LatentLayer {
    Gaussian(GaussianLatentLayer),
    Ladder(LadderLatentLayer),
}

impl LatentLayer {
    /// Builds the latent layer declared by `cfg`, attached to
    /// `num_d_layers` deterministic layers of width `det_dim`.
    pub fn new(
        cfg: LatentLayerConfig,
        num_d_layers: usize,
        det_dim: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        match cfg.kind {
            LatentLayerKind::Gaussian => Ok(Self::Gaussian(GaussianLatentLayer::new(
                cfg,
                det_dim,
                det_dim,
                vs,
            )?)),
            LatentLayerKind::Ladder => Ok(Self::Ladder(LadderLatentLayer::new(
                cfg,
                num_d_layers,
                det_dim,
                vs,
            )?)),
        }
    }

    pub fn output_dim(&self) -> usize {
        match self {
            Self::Gaussian(layer) => layer.latent_size,
            Self::Ladder(layer) => layer.output_dim(),
        }
    }

    /// Builds the prior/posterior pair per stochastic layer and draws the
    /// latent sample (from the prior in sampling mode).
    pub fn build(
        &self,
        q_input: &[Tensor],
        p_input: &[Tensor],
        mode: Mode,
    ) -> Result<(Tensor, LatentPass)> {
        match self {
            Self::Gaussian(layer) => {
                let q_in = q_input
                    .last()
                    .ok_or_else(|| Error::Msg("empty posterior input".to_string()))?;
                let p_in = p_input
                    .last()
                    .ok_or_else(|| Error::Msg("empty prior input".to_string()))?;
                layer.build(q_in, p_in, mode)
            }
            Self::Ladder(layer) => layer.build(q_input, p_input, mode),
        }
    }

    /// KL terms between posterior and prior, masked and reduced. Entries
    /// named `loss*` take part in the optimization objective.
    pub fn build_loss(
        &self,
        pass: &LatentPass,
        mask: &Tensor,
        reduce: &ReduceLoss,
        step: usize,
        mode: Mode,
    ) -> Result<BTreeMap<String, Tensor>> {
        match self {
            Self::Gaussian(layer) => layer.build_loss(pass, mask, reduce, step, mode),
            Self::Ladder(layer) => layer.build_loss(pass, mask, reduce, step, mode),
        }
    }
}
