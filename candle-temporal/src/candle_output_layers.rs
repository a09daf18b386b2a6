use std::collections::{BTreeMap, BTreeSet};

use candle_core::{bail, DType, Error, Result, Tensor, D};
use candle_nn::{ops, Linear, Module, VarBuilder};

use crate::candle_loss_functions::{
    logli_bernoulli, logli_bernoulli_logits, logli_categorical, logli_gmm_logsumexp, logli_mse,
    logli_normal_bivariate, logli_normal_isotropic, softplus,
};
use crate::candle_model_traits::{Mode, ReduceLoss};

/// Output distribution / loss family of one declared loss term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    /// Isotropic Gaussian negative log-likelihood.
    Normal,
    /// Correlated bivariate Gaussian; the target slice must be 2-D.
    Binormal,
    /// Gaussian mixture with `num_components` components.
    Gmm,
    /// Bernoulli likelihood on probabilities.
    Bernoulli,
    /// Categorical cross-entropy from logits.
    CrossEntropy,
    /// Per-element binary cross-entropy from logits.
    BinaryCrossEntropy,
    /// Squared error as a pseudo likelihood.
    Mse,
}

/// One named loss term of the declarative loss configuration. Output heads
/// are grown from these entries.
#[derive(Debug, Clone)]
pub struct LossSpec {
    pub name: String,
    pub kind: LossKind,
    pub out_key: String,
    pub target_idx: usize,
    pub weight: f64,
    pub num_components: usize,
}

impl LossSpec {
    pub fn new(name: &str, kind: LossKind, out_key: &str, target_idx: usize) -> Self {
        Self {
            name: name.to_string(),
            kind,
            out_key: out_key.to_string(),
            target_idx,
            weight: 1.0,
            num_components: 1,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_components(mut self, num_components: usize) -> Self {
        self.num_components = num_components;
        self
    }
}

/// Hidden-layer family placed between the temporal core and the heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayerType {
    /// Per-step 1x1 projections.
    Conv1,
    /// Zero-padded causal convolution blocks.
    Tcn,
}

#[derive(Debug, Clone)]
pub struct OutputLayerConfig {
    pub layer_type: OutputLayerType,
    pub num_layers: usize,
    /// Width of the hidden layers; 0 falls back to the core's filter count.
    pub num_units: usize,
    /// Kernel size for the `Tcn` type; 0 falls back to the core's.
    pub filter_size: usize,
}

impl Default for OutputLayerConfig {
    fn default() -> Self {
        Self {
            layer_type: OutputLayerType::Conv1,
            num_layers: 1,
            num_units: 0,
            filter_size: 0,
        }
    }
}

enum HeadAct {
    Linear,
    Sigma,
    Tanh,
    Sigmoid,
    Softmax,
}

struct OutputHead {
    key: String,
    proj: Linear,
    act: HeadAct,
}

/// Linear prediction heads grown from the loss configuration: a Gaussian
/// term contributes a mean head and a positive-sigma head, a GMM term adds
/// K-times-wider mean/sigma heads plus softmax mixture coefficients, and so
/// on. Head keys are `<out_key><suffix>`.
pub struct OutputHeads {
    heads: Vec<OutputHead>,
    sigma_threshold: f64,
}

impl OutputHeads {
    pub fn new(
        in_dim: usize,
        specs: &[LossSpec],
        target_dims: &[usize],
        sigma_threshold: f64,
        vs: VarBuilder,
    ) -> Result<Self> {
        if specs.is_empty() {
            bail!("at least one loss term must be configured");
        }
        let mut heads: Vec<OutputHead> = Vec::new();
        let mut seen = BTreeSet::new();

        let push = |key: String, dim: usize, act: HeadAct, seen: &mut BTreeSet<String>| -> Result<OutputHead> {
            if !seen.insert(key.clone()) {
                bail!("duplicate output key: {}", key);
            }
            let proj = candle_nn::linear(in_dim, dim, vs.pp(format!("out_{}", key)))?;
            Ok(OutputHead { key, proj, act })
        };

        for spec in specs {
            let Some(&dim) = target_dims.get(spec.target_idx) else {
                bail!(
                    "loss term '{}' targets slice {} but only {} target slices exist",
                    spec.name,
                    spec.target_idx,
                    target_dims.len()
                );
            };
            match spec.kind {
                LossKind::Normal => {
                    heads.push(push(format!("{}_mu", spec.out_key), dim, HeadAct::Linear, &mut seen)?);
                    heads.push(push(format!("{}_sigma", spec.out_key), dim, HeadAct::Sigma, &mut seen)?);
                }
                LossKind::Binormal => {
                    if dim != 2 {
                        bail!("bivariate loss term '{}' needs a 2-d target slice", spec.name);
                    }
                    heads.push(push(format!("{}_mu", spec.out_key), dim, HeadAct::Linear, &mut seen)?);
                    heads.push(push(format!("{}_sigma", spec.out_key), dim, HeadAct::Sigma, &mut seen)?);
                    heads.push(push(format!("{}_rho", spec.out_key), 1, HeadAct::Tanh, &mut seen)?);
                }
                LossKind::Gmm => {
                    if spec.num_components == 0 {
                        bail!("mixture loss term '{}' needs at least one component", spec.name);
                    }
                    let k = spec.num_components;
                    heads.push(push(format!("{}_mu", spec.out_key), dim * k, HeadAct::Linear, &mut seen)?);
                    heads.push(push(format!("{}_sigma", spec.out_key), dim * k, HeadAct::Sigma, &mut seen)?);
                    heads.push(push(
                        format!("{}_coefficient", spec.out_key),
                        k,
                        HeadAct::Softmax,
                        &mut seen,
                    )?);
                }
                LossKind::Bernoulli => {
                    heads.push(push(format!("{}_binary", spec.out_key), dim, HeadAct::Sigmoid, &mut seen)?);
                }
                LossKind::CrossEntropy | LossKind::BinaryCrossEntropy | LossKind::Mse => {
                    heads.push(push(format!("{}_mu", spec.out_key), dim, HeadAct::Linear, &mut seen)?);
                }
            }
        }
        Ok(Self {
            heads,
            sigma_threshold,
        })
    }

    /// Applies every head to the shared hidden representation.
    pub fn forward(&self, h_ntd: &Tensor) -> Result<BTreeMap<String, Tensor>> {
        let mut outputs = BTreeMap::new();
        for head in self.heads.iter() {
            let y = head.proj.forward(h_ntd)?;
            let y = match head.act {
                HeadAct::Linear => y,
                HeadAct::Sigma => softplus(&y)?.clamp(1e-3, self.sigma_threshold)?,
                HeadAct::Tanh => y.tanh()?,
                HeadAct::Sigmoid => ops::sigmoid(&y)?,
                HeadAct::Softmax => ops::softmax(&y, D::Minus1)?,
            };
            outputs.insert(head.key.clone(), y);
        }
        Ok(outputs)
    }
}

fn fetch<'a>(
    outputs: &'a BTreeMap<String, Tensor>,
    out_key: &str,
    suffix: &str,
) -> Result<&'a Tensor> {
    outputs
        .get(&format!("{}{}", out_key, suffix))
        .ok_or_else(|| Error::Msg(format!("missing model output {}{}", out_key, suffix)))
}

/// Per-term negative log-likelihood losses, each masked, reduced and
/// weighted. Keys are `loss_<name>` so every entry takes part in the
/// optimization objective.
pub fn build_loss_terms(
    specs: &[LossSpec],
    outputs: &BTreeMap<String, Tensor>,
    target_pieces: &[Tensor],
    mask: &Tensor,
    reduce: &ReduceLoss,
) -> Result<BTreeMap<String, Tensor>> {
    let mut ops_loss = BTreeMap::new();
    for spec in specs {
        let target = target_pieces.get(spec.target_idx).ok_or_else(|| {
            Error::Msg(format!("loss term '{}' has no target slice", spec.name))
        })?;
        let logli = match spec.kind {
            LossKind::Normal => logli_normal_isotropic(
                target,
                fetch(outputs, &spec.out_key, "_mu")?,
                fetch(outputs, &spec.out_key, "_sigma")?,
                false,
            )?,
            LossKind::Binormal => logli_normal_bivariate(
                target,
                fetch(outputs, &spec.out_key, "_mu")?,
                fetch(outputs, &spec.out_key, "_sigma")?,
                fetch(outputs, &spec.out_key, "_rho")?,
                false,
            )?,
            LossKind::Gmm => logli_gmm_logsumexp(
                target,
                fetch(outputs, &spec.out_key, "_mu")?,
                fetch(outputs, &spec.out_key, "_sigma")?,
                fetch(outputs, &spec.out_key, "_coefficient")?,
            )?,
            LossKind::Bernoulli => {
                logli_bernoulli(target, fetch(outputs, &spec.out_key, "_binary")?, false)?
            }
            LossKind::CrossEntropy => {
                logli_categorical(target, fetch(outputs, &spec.out_key, "_mu")?)?
            }
            LossKind::BinaryCrossEntropy => {
                logli_bernoulli_logits(target, fetch(outputs, &spec.out_key, "_mu")?, false)?
            }
            LossKind::Mse => logli_mse(target, fetch(outputs, &spec.out_key, "_mu")?)?,
        };
        let masked = logli.broadcast_mul(mask)?;
        let term = (reduce.apply(&masked, mask)? * (-spec.weight))?;
        ops_loss.insert(format!("loss_{}", spec.name), term);
    }
    Ok(ops_loss)
}

/// Assemble an output sequence from the predicted distribution parameters,
/// ordered by target slice. Outside sampling mode the prediction is the
/// distribution mean (mixtures use the coefficient-weighted mean); sampling
/// mode draws reparameterized Gaussians and thresholds Bernoulli draws.
pub fn sample_outputs(
    specs: &[LossSpec],
    outputs: &BTreeMap<String, Tensor>,
    target_dims: &[usize],
    mode: Mode,
) -> Result<Tensor> {
    let mut ordered: Vec<&LossSpec> = specs.iter().collect();
    ordered.sort_by_key(|spec| spec.target_idx);

    let mut pieces = Vec::with_capacity(ordered.len());
    for spec in ordered {
        let piece = match spec.kind {
            LossKind::Normal | LossKind::Binormal => {
                let mu = fetch(outputs, &spec.out_key, "_mu")?;
                if mode.is_sampling() {
                    let sigma = fetch(outputs, &spec.out_key, "_sigma")?;
                    let eps = Tensor::randn_like(mu, 0.0, 1.0)?;
                    mu.add(&sigma.mul(&eps)?)?
                } else {
                    mu.clone()
                }
            }
            LossKind::Mse => fetch(outputs, &spec.out_key, "_mu")?.clone(),
            LossKind::Gmm => {
                let mu = fetch(outputs, &spec.out_key, "_mu")?;
                let coeff = fetch(outputs, &spec.out_key, "_coefficient")?;
                let (n, t, _) = mu.dims3()?;
                let k = spec.num_components;
                let d = target_dims[spec.target_idx];
                let mu = mu.reshape((n, t, k, d))?;
                let coeff = coeff.reshape((n, t, k, 1))?;
                mu.broadcast_mul(&coeff)?.sum(2)?
            }
            LossKind::Bernoulli => {
                let prob = fetch(outputs, &spec.out_key, "_binary")?;
                bernoulli_draw(prob, mode)?
            }
            LossKind::CrossEntropy => {
                ops::softmax(fetch(outputs, &spec.out_key, "_mu")?, D::Minus1)?
            }
            LossKind::BinaryCrossEntropy => {
                let prob = ops::sigmoid(fetch(outputs, &spec.out_key, "_mu")?)?;
                bernoulli_draw(&prob, mode)?
            }
        };
        pieces.push(piece);
    }
    let refs: Vec<&Tensor> = pieces.iter().collect();
    Tensor::cat(&refs, 2)
}

fn bernoulli_draw(prob: &Tensor, mode: Mode) -> Result<Tensor> {
    if mode.is_sampling() {
        let u = prob.rand_like(0.0, 1.0)?;
        prob.ge(&u)?.to_dtype(DType::F32)
    } else {
        Ok(prob.clone())
    }
}
