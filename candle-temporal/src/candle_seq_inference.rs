use std::collections::BTreeMap;

use anyhow::anyhow;
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

use crate::candle_model_traits::{Mode, SequenceBatch, SequenceModelT, StepOutputs};

pub struct TrainConfig {
    pub learning_rate: f64,
    pub num_epochs: usize,
    pub print_every_step: usize,
    pub device: Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            num_epochs: 1,
            print_every_step: 100,
            device: Device::Cpu,
            verbose: false,
            show_progress: true,
        }
    }
}

fn loss_scalars(step_outputs: &StepOutputs) -> anyhow::Result<BTreeMap<String, f32>> {
    let mut scalars = BTreeMap::new();
    for (key, op) in step_outputs.losses.iter() {
        scalars.insert(key.clone(), op.to_scalar::<f32>()?);
    }
    if let Some(total) = &step_outputs.total_loss {
        scalars.insert("total_loss".to_string(), total.to_scalar::<f32>()?);
    }
    Ok(scalars)
}

/// One optimization step: evaluates the training-mode graph on the batch
/// and updates the parameters through the optimizer.
///
/// A non-finite objective is fatal and never retried; the parameter state
/// after a NaN is unrecoverable.
pub fn training_step<M>(
    model: &M,
    optimizer: &mut AdamW,
    batch: &SequenceBatch,
    step: usize,
) -> anyhow::Result<BTreeMap<String, f32>>
where
    M: SequenceModelT,
{
    let step_outputs = model.forward(batch, Mode::Train, step)?;
    let total = step_outputs
        .total_loss
        .as_ref()
        .ok_or_else(|| anyhow!("training requires target sequences"))?;

    let scalars = loss_scalars(&step_outputs)?;
    let total_value = scalars
        .get("total_loss")
        .copied()
        .ok_or_else(|| anyhow!("total loss missing from the loss registry"))?;
    if !total_value.is_finite() {
        anyhow::bail!(
            "total loss is {} at step {}; aborting the run",
            total_value,
            step
        );
    }

    optimizer.backward_step(total)?;
    Ok(scalars)
}

/// Epoch loop over pre-batched training data.
///
/// * `model` - the sequence model to train
/// * `variable_map` - parameter registry backing the model
/// * `batches` - mini-batches; dataset iteration happens outside
/// * `train_config` - training configuration
///
/// Returns the per-epoch average total loss.
pub fn run_training<M>(
    model: &M,
    variable_map: &VarMap,
    batches: &[SequenceBatch],
    train_config: &TrainConfig,
) -> anyhow::Result<Vec<f32>>
where
    M: SequenceModelT,
{
    let mut adam = AdamW::new_lr(variable_map.all_vars(), train_config.learning_rate)?;

    let pb = ProgressBar::new(train_config.num_epochs as u64);
    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut loss_trace = Vec::with_capacity(train_config.num_epochs);
    let mut step = 0usize;
    for epoch in 0..train_config.num_epochs {
        let mut epoch_total = 0f32;
        for batch in batches.iter() {
            let losses = training_step(model, &mut adam, batch, step)?;
            epoch_total += losses
                .get("total_loss")
                .copied()
                .ok_or_else(|| anyhow!("total loss missing"))?;
            if train_config.verbose && step % train_config.print_every_step == 0 {
                log_loss(&losses, step, epoch, "training: ");
            }
            step += 1;
        }
        pb.inc(1);
        loss_trace.push(epoch_total / batches.len().max(1) as f32);
    }
    pb.finish_and_clear();
    Ok(loss_trace)
}

/// Accumulates per-batch losses weighted by batch size so a full
/// validation sweep reports `sum(loss_i * n_i) / sum(n_i)` rather than the
/// unweighted mean of batch averages.
#[derive(Default)]
pub struct ValidationAccumulator {
    container_loss: BTreeMap<String, f64>,
    num_samples: usize,
}

impl ValidationAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, batch_size: usize, losses: &BTreeMap<String, f32>) {
        self.num_samples += batch_size;
        for (key, value) in losses.iter() {
            *self.container_loss.entry(key.clone()).or_insert(0.0) +=
                f64::from(*value) * batch_size as f64;
        }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn average(&self) -> BTreeMap<String, f32> {
        self.container_loss
            .iter()
            .map(|(key, total)| (key.clone(), (total / self.num_samples.max(1) as f64) as f32))
            .collect()
    }

    pub fn reset(&mut self) {
        self.num_samples = 0;
        self.container_loss.clear();
    }
}

/// Evaluates the whole validation/test set and reports batch-size-weighted
/// average losses. Parameters are read, never updated.
pub fn evaluation_step<M>(
    model: &M,
    batches: &[SequenceBatch],
    mode: Mode,
    step: usize,
) -> anyhow::Result<BTreeMap<String, f32>>
where
    M: SequenceModelT,
{
    if !mode.is_validation() {
        anyhow::bail!("evaluation_step expects validation or evaluation mode");
    }
    let mut accumulator = ValidationAccumulator::new();
    for batch in batches.iter() {
        let step_outputs = model.forward(batch, mode, step)?;
        let scalars = loss_scalars(&step_outputs)?;
        accumulator.update(batch.batch_size(), &scalars);
    }
    Ok(accumulator.average())
}

pub struct Reconstruction {
    pub sample: Tensor,
    pub losses: Option<BTreeMap<String, f32>>,
}

/// Predicts the next steps from ground-truth history. When a target
/// sequence is given the loss breakdown is reported as well.
pub fn reconstruct<M>(
    model: &M,
    input_sequence: &Tensor,
    target_sequence: Option<&Tensor>,
) -> anyhow::Result<Reconstruction>
where
    M: SequenceModelT,
{
    let batch = SequenceBatch::dense(input_sequence.clone(), target_sequence.cloned())?;
    let step_outputs = model.forward(&batch, Mode::Eval, 0)?;
    let losses = if target_sequence.is_some() {
        Some(loss_scalars(&step_outputs)?)
    } else {
        None
    };
    Ok(Reconstruction {
        sample: step_outputs.sample,
        losses,
    })
}

/// One log line per loss registry, total first, remaining terms sorted.
pub fn log_loss(eval_loss: &BTreeMap<String, f32>, step: usize, epoch: usize, prefix: &str) {
    let total = eval_loss.get("total_loss").copied().unwrap_or(f32::NAN);
    let mut line = format!("{}{}/{} \t Total: {:.4}", prefix, step, epoch, total);
    for (key, value) in eval_loss.iter() {
        if key != "total_loss" {
            line.push_str(&format!(" \t {}: {:.4}", key, value));
        }
    }
    info!("{}", line);
}
