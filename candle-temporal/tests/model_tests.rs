use std::collections::BTreeMap;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{AdamW, VarBuilder, VarMap};
use candle_temporal::candle_latent_layers::{LatentSize, LatentStructure};
use candle_temporal::candle_model_rnn::{RnnAutoregressive, RnnConfig};
use candle_temporal::candle_model_stcn::{StcnConfig, StochasticTcn};
use candle_temporal::candle_model_tcn::{Tcn, TcnModelConfig};
use candle_temporal::candle_model_traits::{Mode, SequenceBatch, SequenceModelT};
use candle_temporal::candle_model_vrnn::{Vrnn, VrnnConfig};
use candle_temporal::candle_output_layers::{LossKind, LossSpec};
use candle_temporal::candle_seq_inference::{
    evaluation_step, reconstruct, run_training, training_step, TrainConfig, ValidationAccumulator,
};

fn builder(varmap: &VarMap) -> VarBuilder {
    let _ = env_logger::builder().is_test(true).try_init();
    VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
}

fn gaussian_loss() -> Vec<LossSpec> {
    vec![LossSpec::new("nll", LossKind::Normal, "out", 0)]
}

fn mse_loss() -> Vec<LossSpec> {
    vec![LossSpec::new("mse", LossKind::Mse, "out", 0)]
}

fn small_tcn_config(loss: Vec<LossSpec>, zero_padding: bool) -> TcnModelConfig {
    let mut cfg = TcnModelConfig::new(3, vec![3], loss);
    cfg.cnn.num_layers = 2;
    cfg.cnn.num_filters = 8;
    cfg.cnn.filter_size = 2;
    cfg.cnn.dilation_size = vec![1, 2];
    cfg.cnn.zero_padding = zero_padding;
    cfg
}

fn small_stcn_config(loss: Vec<LossSpec>) -> StcnConfig {
    let mut cfg = StcnConfig::new(3, vec![3], loss);
    cfg.cnn.num_filters = 8;
    cfg.cnn.filter_size = 2;
    cfg.cnn.dilation_size = vec![1, 2];
    cfg.num_encoder_layers = 2;
    cfg.latent.latent_size = LatentSize::Uniform(4);
    cfg.latent.num_hidden_layers = 1;
    cfg.latent.num_hidden_units = 8;
    cfg.latent.layer_structure = LatentStructure::Conv1;
    cfg
}

fn randn(shape: (usize, usize, usize)) -> Result<Tensor> {
    Tensor::randn(0f32, 1f32, shape, &Device::Cpu)
}

#[test]
fn tcn_reconstruction_returns_matching_shape_and_finite_loss() -> Result<()> {
    let varmap = VarMap::new();
    let model = Tcn::new(small_tcn_config(gaussian_loss(), true), builder(&varmap))?;

    let inputs = randn((2, 10, 3))?;
    let targets = randn((2, 10, 3))?;
    let recon = reconstruct(&model, &inputs, Some(&targets)).unwrap();

    assert_eq!(recon.sample.dims3()?, (2, 10, 3));
    let losses = recon.losses.unwrap();
    let total = losses["total_loss"];
    assert!(total.is_finite());
    assert!(losses.contains_key("loss_nll"));
    Ok(())
}

#[test]
fn tcn_generation_depends_only_on_the_receptive_window() -> Result<()> {
    let varmap = VarMap::new();
    let model = Tcn::new(small_tcn_config(mse_loss(), false), builder(&varmap))?;
    assert_eq!(model.receptive_field(), 4);

    let seed = randn((1, 4, 3))?;
    let generated = model.sample(&seed, 5)?;
    assert_eq!(generated.dims3()?, (1, 5, 3));

    // Prepending extra history beyond the receptive field must not change
    // the generated steps.
    let prefix = randn((1, 3, 3))?;
    let longer_seed = Tensor::cat(&[&prefix, &seed], 1)?;
    let generated_long = model.sample(&longer_seed, 5)?;

    let diff = generated
        .sub(&generated_long)?
        .abs()?
        .max_all()?
        .to_scalar::<f32>()?;
    assert!(diff < 1e-6);
    Ok(())
}

#[test]
fn tcn_rejects_seeds_shorter_than_the_receptive_field() -> Result<()> {
    let varmap = VarMap::new();
    let model = Tcn::new(small_tcn_config(mse_loss(), false), builder(&varmap))?;
    let short_seed = randn((1, 3, 3))?;
    assert!(model.sample(&short_seed, 2).is_err());

    let short_batch = SequenceBatch::dense(randn((1, 2, 3))?, None)?;
    assert!(model.forward(&short_batch, Mode::Eval, 0).is_err());
    Ok(())
}

#[test]
fn stcn_trains_with_ladder_kl_and_reconstruction_terms() -> Result<()> {
    let varmap = VarMap::new();
    let model = StochasticTcn::new(small_stcn_config(gaussian_loss()), builder(&varmap))?;

    let batch = SequenceBatch::dense(randn((2, 10, 3))?, Some(randn((2, 10, 3))?))?;
    let out = model.forward(&batch, Mode::Train, 0)?;

    assert_eq!(out.sample.dims3()?, (2, 10, 3));
    assert!(out.losses.contains_key("loss_nll"));
    assert!(out.losses.contains_key("loss_kld"));
    let total = out.total_loss.unwrap().to_scalar::<f32>()?;
    assert!(total.is_finite());

    // Per-layer KL diagnostics only show up outside training.
    let eval_out = model.forward(&batch, Mode::Eval, 0)?;
    assert!(eval_out.losses.contains_key("KL0"));
    Ok(())
}

#[test]
fn stcn_generates_the_requested_number_of_steps() -> Result<()> {
    let varmap = VarMap::new();
    let model = StochasticTcn::new(small_stcn_config(gaussian_loss()), builder(&varmap))?;
    let seed = randn((1, 4, 3))?;
    let generated = model.sample(&seed, 6)?;
    assert_eq!(generated.dims3()?, (1, 6, 3));
    Ok(())
}

#[test]
fn vrnn_exposes_latent_statistics_and_samples() -> Result<()> {
    let varmap = VarMap::new();
    let mut cfg = VrnnConfig::new(3, vec![3], gaussian_loss());
    cfg.latent_size = 4;
    cfg.cell_size = 16;
    cfg.num_hidden_units = 8;
    let model = Vrnn::new(cfg, builder(&varmap))?;

    let batch = SequenceBatch::dense(randn((2, 5, 3))?, Some(randn((2, 5, 3))?))?;
    let out = model.forward(&batch, Mode::Train, 0)?;
    for key in ["q_mu", "q_sigma", "p_mu", "p_sigma"] {
        assert_eq!(out.outputs[key].dims3()?, (2, 5, 4));
    }
    assert!(out.losses.contains_key("loss_kld"));
    assert!(out.total_loss.unwrap().to_scalar::<f32>()?.is_finite());

    let generated = model.sample(&randn((2, 4, 3))?, 5)?;
    assert_eq!(generated.dims3()?, (2, 5, 3));
    Ok(())
}

#[test]
fn rnn_autoregressive_predicts_and_generates() -> Result<()> {
    let varmap = VarMap::new();
    let mut cfg = RnnConfig::new(3, vec![3], gaussian_loss());
    cfg.cell_size = 16;
    let model = RnnAutoregressive::new(cfg, builder(&varmap))?;

    let batch = SequenceBatch::dense(randn((2, 6, 3))?, Some(randn((2, 6, 3))?))?;
    let out = model.forward(&batch, Mode::Train, 0)?;
    assert_eq!(out.sample.dims3()?, (2, 6, 3));
    assert!(out.total_loss.unwrap().to_scalar::<f32>()?.is_finite());

    let generated = model.sample(&randn((2, 3, 3))?, 4)?;
    assert_eq!(generated.dims3()?, (2, 4, 3));
    Ok(())
}

#[test]
fn training_aborts_on_a_non_finite_objective() -> Result<()> {
    let varmap = VarMap::new();
    let model = Tcn::new(small_tcn_config(gaussian_loss(), true), builder(&varmap))?;
    let mut adam = AdamW::new_lr(varmap.all_vars(), 1e-3)?;

    let poisoned = Tensor::from_vec(vec![f32::NAN; 2 * 4 * 3], (2, 4, 3), &Device::Cpu)?;
    let batch = SequenceBatch::dense(poisoned, Some(randn((2, 4, 3))?))?;

    let err = training_step(&model, &mut adam, &batch, 0).unwrap_err();
    assert!(err.to_string().contains("aborting"));
    Ok(())
}

#[test]
fn run_training_reports_one_average_per_epoch() -> Result<()> {
    let varmap = VarMap::new();
    let mut cfg = RnnConfig::new(3, vec![3], gaussian_loss());
    cfg.cell_size = 8;
    let model = RnnAutoregressive::new(cfg, builder(&varmap))?;

    let batches = vec![
        SequenceBatch::dense(randn((2, 6, 3))?, Some(randn((2, 6, 3))?))?,
        SequenceBatch::dense(randn((2, 6, 3))?, Some(randn((2, 6, 3))?))?,
    ];
    let train_config = TrainConfig {
        num_epochs: 2,
        show_progress: false,
        ..Default::default()
    };
    let trace = run_training(&model, &varmap, &batches, &train_config).unwrap();
    assert_eq!(trace.len(), 2);
    assert!(trace.iter().all(|loss| loss.is_finite()));
    Ok(())
}

#[test]
fn validation_average_is_weighted_by_batch_size() -> Result<()> {
    let mut accumulator = ValidationAccumulator::new();
    let mut first = BTreeMap::new();
    first.insert("total_loss".to_string(), 1.0f32);
    let mut second = BTreeMap::new();
    second.insert("total_loss".to_string(), 2.0f32);

    accumulator.update(2, &first);
    accumulator.update(3, &second);

    let average = accumulator.average();
    let expected = (1.0 * 2.0 + 2.0 * 3.0) / 5.0;
    assert!((average["total_loss"] - expected as f32).abs() < 1e-6);
    Ok(())
}

#[test]
fn evaluation_sweep_matches_the_weighted_mean_of_batches() -> Result<()> {
    let varmap = VarMap::new();
    let model = Tcn::new(small_tcn_config(mse_loss(), true), builder(&varmap))?;

    let small = SequenceBatch::dense(randn((1, 6, 3))?, Some(randn((1, 6, 3))?))?;
    let large = SequenceBatch::dense(randn((3, 6, 3))?, Some(randn((3, 6, 3))?))?;

    let loss_small = model
        .forward(&small, Mode::Valid, 0)?
        .total_loss
        .unwrap()
        .to_scalar::<f32>()?;
    let loss_large = model
        .forward(&large, Mode::Valid, 0)?
        .total_loss
        .unwrap()
        .to_scalar::<f32>()?;

    let batches = vec![small, large];
    let report = evaluation_step(&model, &batches, Mode::Valid, 0).unwrap();
    let expected = (loss_small * 1.0 + loss_large * 3.0) / 4.0;
    assert!((report["total_loss"] - expected).abs() < 1e-5);
    Ok(())
}

#[test]
fn padded_steps_beyond_the_sequence_length_do_not_leak_into_the_loss() -> Result<()> {
    let varmap = VarMap::new();
    let model = Tcn::new(small_tcn_config(mse_loss(), true), builder(&varmap))?;

    let t = 6;
    let clean = randn((1, t, 3))?;
    let targets = randn((1, t, 3))?;
    // Replace everything past the true length with junk.
    let junk = Tensor::full(9.0f32, (1, 2, 3), &Device::Cpu)?;
    let poisoned = Tensor::cat(&[&clean.narrow(1, 0, t - 2)?, &junk], 1)?;

    let batch_clean = SequenceBatch::new(clean, Some(targets.clone()), vec![t - 2])?;
    let batch_poisoned = SequenceBatch::new(poisoned, Some(targets), vec![t - 2])?;

    let loss_clean = model
        .forward(&batch_clean, Mode::Valid, 0)?
        .total_loss
        .unwrap()
        .to_scalar::<f32>()?;
    let loss_poisoned = model
        .forward(&batch_poisoned, Mode::Valid, 0)?
        .total_loss
        .unwrap()
        .to_scalar::<f32>()?;
    assert!((loss_clean - loss_poisoned).abs() < 1e-5);
    Ok(())
}
