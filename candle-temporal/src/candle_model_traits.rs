use std::collections::BTreeMap;

use candle_core::{bail, Result, Tensor};

use crate::candle_aux_layers::sequence_mask;
use crate::candle_latent_layers::LatentPass;

/// Graph mode. Each mode drives a structurally different forward pass over
/// one shared parameter set: training uses the posterior path plus
/// training-only regularizers, validation/evaluation force the KL weight to
/// 1 and drop stochastic training terms, sampling never touches ground
/// truth and draws from the prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Valid,
    Eval,
    Sample,
}

impl Mode {
    pub fn is_training(self) -> bool {
        self == Mode::Train
    }

    pub fn is_validation(self) -> bool {
        matches!(self, Mode::Valid | Mode::Eval)
    }

    pub fn is_eval(self) -> bool {
        self == Mode::Eval
    }

    pub fn is_sampling(self) -> bool {
        self == Mode::Sample
    }
}

/// One mini-batch of variable-length sequences, shaped (n x t x d) with
/// per-sample true lengths.
pub struct SequenceBatch {
    pub inputs: Tensor,
    pub targets: Option<Tensor>,
    pub lengths: Vec<usize>,
}

impl SequenceBatch {
    pub fn new(inputs: Tensor, targets: Option<Tensor>, lengths: Vec<usize>) -> Result<Self> {
        let (n, t, _d) = inputs.dims3()?;
        if lengths.len() != n {
            bail!("{} lengths for a batch of {}", lengths.len(), n);
        }
        if lengths.iter().any(|&len| len > t) {
            bail!("sequence length exceeds the padded time axis {}", t);
        }
        if let Some(targets) = &targets {
            let (tn, tt, _) = targets.dims3()?;
            if tn != n || tt != t {
                bail!("targets shaped {:?} do not match inputs", targets.dims());
            }
        }
        Ok(Self {
            inputs,
            targets,
            lengths,
        })
    }

    /// Batch where every sample uses the full time axis.
    pub fn dense(inputs: Tensor, targets: Option<Tensor>) -> Result<Self> {
        let (n, t, _d) = inputs.dims3()?;
        Self::new(inputs, targets, vec![t; n])
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn seq_len(&self) -> Result<usize> {
        self.inputs.dim(1)
    }

    /// (n x t x 1) loss mask derived from the per-sample lengths.
    pub fn mask(&self) -> Result<Tensor> {
        sequence_mask(&self.lengths, self.seq_len()?, self.inputs.device())
    }
}

/// Slice the target tensor into the per-loss-term pieces declared by
/// `target_dims`.
pub fn split_targets(targets: &Tensor, target_dims: &[usize]) -> Result<Vec<Tensor>> {
    let total: usize = target_dims.iter().sum();
    if targets.dim(2)? != total {
        bail!(
            "targets have {} features but target_dims sums to {}",
            targets.dim(2)?,
            total
        );
    }
    let mut pieces = Vec::with_capacity(target_dims.len());
    let mut offset = 0;
    for &dim in target_dims {
        pieces.push(targets.narrow(2, offset, dim)?);
        offset += dim;
    }
    Ok(pieces)
}

/// Final reduction of a masked per-step loss tensor into a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceLoss {
    /// Per-sample sum over steps and features, averaged over the batch.
    MeanSequence,
    /// Per-sample sum normalized by the true sequence length, averaged over
    /// the batch.
    MeanStep,
    /// Plain sum over everything.
    Sum,
}

impl ReduceLoss {
    /// `masked` is a (n x t x d) or (n x t x 1) tensor already multiplied by
    /// the sequence mask; `mask` supplies the per-sample step counts.
    pub fn apply(&self, masked: &Tensor, mask: &Tensor) -> Result<Tensor> {
        match self {
            Self::MeanSequence => masked.sum((1, 2))?.mean_all(),
            Self::MeanStep => {
                let per_seq = masked.sum((1, 2))?;
                let steps = mask.sum((1, 2))?;
                per_seq.div(&steps)?.mean_all()
            }
            Self::Sum => masked.sum_all(),
        }
    }
}

/// Result of one mode-specific forward pass.
///
/// `outputs` holds distribution parameters keyed like `<name>_mu`;
/// `losses` maps term names to scalars, where only names starting with
/// `loss` contribute to `total_loss` and the rest are diagnostics.
pub struct StepOutputs {
    pub outputs: BTreeMap<String, Tensor>,
    pub losses: BTreeMap<String, Tensor>,
    pub total_loss: Option<Tensor>,
    pub sample: Tensor,
    pub latent: Option<LatentPass>,
}

/// Sum the optimized subset of the loss registry.
pub fn total_from_losses(losses: &BTreeMap<String, Tensor>) -> Result<Option<Tensor>> {
    let mut total: Option<Tensor> = None;
    for (key, op) in losses.iter() {
        if key.starts_with("loss") {
            total = Some(match total {
                Some(acc) => acc.add(op)?,
                None => op.clone(),
            });
        }
    }
    Ok(total)
}

/// A trainable sequence model exposing the mode-dependent forward pass and
/// autoregressive generation.
pub trait SequenceModelT {
    /// Builds distribution parameters, the output sample and (when targets
    /// are present and the mode is not sampling) the loss registry.
    fn forward(&self, batch: &SequenceBatch, mode: Mode, step: usize) -> Result<StepOutputs>;

    /// Generates `sample_length` new steps following `seed`
    /// (n x seed_len x d), returning (n x sample_length x d).
    fn sample(&self, seed: &Tensor, sample_length: usize) -> Result<Tensor>;
}
