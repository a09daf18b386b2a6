use approx::assert_relative_eq;
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_temporal::candle_latent_layers::*;
use candle_temporal::candle_model_traits::{Mode, ReduceLoss};

fn builder(varmap: &VarMap) -> VarBuilder {
    VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
}

fn det_layers(num: usize, n: usize, t: usize, d: usize) -> Result<Vec<Tensor>> {
    (0..num)
        .map(|_| Tensor::randn(0f32, 1f32, (n, t, d), &Device::Cpu))
        .collect()
}

fn ones_mask(n: usize, t: usize) -> Result<Tensor> {
    Tensor::ones((n, t, 1), DType::F32, &Device::Cpu)
}

#[test]
fn precision_weighted_combination_of_identical_gaussians() -> Result<()> {
    let mu = Tensor::full(0.7f32, (1, 2, 3), &Device::Cpu)?;
    let sigma = Tensor::full(2.0f32, (1, 2, 3), &Device::Cpu)?;
    let dist = Normal {
        mu: mu.clone(),
        sigma: sigma.clone(),
    };

    let combined = combine_normal_dist(&dist, &dist)?;
    let got_mu = combined.mu.flatten_all()?.to_vec1::<f32>()?;
    let got_sigma = combined.sigma.flatten_all()?.to_vec1::<f32>()?;
    for v in got_mu {
        assert_relative_eq!(v, 0.7, max_relative = 1e-5);
    }
    let expected = 2.0 / 2f32.sqrt();
    for v in got_sigma {
        assert_relative_eq!(v, expected, max_relative = 1e-5);
    }
    Ok(())
}

#[test]
fn ladder_rejects_unaligned_hierarchy() {
    let varmap = VarMap::new();
    let cfg = LatentLayerConfig {
        vertical_dilation: 2,
        ..Default::default()
    };
    // 5 deterministic layers cannot be split into blocks of 2.
    let result = LadderLatentLayer::new(cfg, 5, 8, builder(&varmap));
    assert!(result.is_err());
}

#[test]
fn latent_size_list_must_match_the_layer_count() {
    let varmap = VarMap::new();
    let cfg = LatentLayerConfig {
        latent_size: LatentSize::PerLayer(vec![3]),
        ..Default::default()
    };
    assert!(LadderLatentLayer::new(cfg, 2, 8, builder(&varmap)).is_err());
}

#[test]
fn ladder_pass_builds_every_stochastic_layer() -> Result<()> {
    let varmap = VarMap::new();
    let cfg = LatentLayerConfig {
        latent_size: LatentSize::Uniform(6),
        ..Default::default()
    };
    let ladder = LadderLatentLayer::new(cfg, 2, 8, builder(&varmap))?;
    assert_eq!(ladder.num_stochastic_layers(), 2);

    let inputs = det_layers(2, 2, 4, 8)?;
    let (sample, pass) = ladder.build(&inputs, &inputs, Mode::Train)?;
    assert_eq!(sample.dims3()?, (2, 4, 6));
    assert_eq!(pass.p.len(), 2);
    assert_eq!(pass.q.len(), 2);
    assert_eq!(pass.samples.len(), 2);
    for sl in 0..2 {
        assert_eq!(pass.q[sl].mu.dims3()?, (2, 4, 6));
        assert_eq!(pass.p[sl].sigma.dims3()?, (2, 4, 6));
    }

    let mask = ones_mask(2, 4)?;
    let losses = ladder.build_loss(&pass, &mask, &ReduceLoss::MeanSequence, 0, Mode::Train)?;
    let kld = losses["loss_kld"].to_scalar::<f32>()?;
    assert!(kld.is_finite());
    assert!(!losses.contains_key("KL0"));

    let eval_losses = ladder.build_loss(&pass, &mask, &ReduceLoss::MeanSequence, 0, Mode::Eval)?;
    assert!(eval_losses.contains_key("KL0"));
    assert!(eval_losses.contains_key("KL1"));
    Ok(())
}

#[test]
fn dense_z_concatenates_per_layer_samples() -> Result<()> {
    let varmap = VarMap::new();
    let cfg = LatentLayerConfig {
        latent_size: LatentSize::PerLayer(vec![8, 4]),
        dense_z: true,
        ..Default::default()
    };
    let ladder = LadderLatentLayer::new(cfg, 2, 8, builder(&varmap))?;
    assert_eq!(ladder.output_dim(), 12);

    let inputs = det_layers(2, 1, 3, 8)?;
    let (sample, _) = ladder.build(&inputs, &inputs, Mode::Train)?;
    assert_eq!(sample.dims3()?, (1, 3, 12));
    Ok(())
}

#[test]
fn top_down_hierarchy_hands_the_bottom_sample_to_the_decoder() -> Result<()> {
    let varmap = VarMap::new();
    let cfg = LatentLayerConfig {
        latent_size: LatentSize::PerLayer(vec![8, 4]),
        ..Default::default()
    };
    let ladder = LadderLatentLayer::new(cfg, 2, 8, builder(&varmap))?;
    // Top-down processing ends at stochastic layer 0.
    assert_eq!(ladder.output_dim(), 8);

    let inputs = det_layers(2, 1, 3, 8)?;
    let (sample, _) = ladder.build(&inputs, &inputs, Mode::Train)?;
    assert_eq!(sample.dims3()?, (1, 3, 8));
    Ok(())
}

#[test]
fn sampling_mode_substitutes_the_prior_for_the_posterior() -> Result<()> {
    let varmap = VarMap::new();
    let cfg = LatentLayerConfig {
        latent_size: LatentSize::Uniform(5),
        ..Default::default()
    };
    let ladder = LadderLatentLayer::new(cfg, 2, 8, builder(&varmap))?;

    let inputs = det_layers(2, 1, 4, 8)?;
    let (_, pass) = ladder.build(&inputs, &inputs, Mode::Sample)?;
    for sl in 0..2 {
        let diff = pass.q[sl]
            .mu
            .sub(&pass.p[sl].mu)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6);
    }

    // No loss terms are built while sampling.
    let mask = ones_mask(1, 4)?;
    let losses = ladder.build_loss(&pass, &mask, &ReduceLoss::MeanSequence, 0, Mode::Sample)?;
    assert!(losses.is_empty());
    Ok(())
}

#[test]
fn gaussian_temporal_kld_is_training_only() -> Result<()> {
    let varmap = VarMap::new();
    let cfg = LatentLayerConfig {
        kind: LatentLayerKind::Gaussian,
        latent_size: LatentSize::Uniform(4),
        use_temporal_kld: true,
        ..Default::default()
    };
    let layer = GaussianLatentLayer::new(cfg, 8, 8, builder(&varmap))?;

    let q_in = Tensor::randn(0f32, 1f32, (1, 5, 8), &Device::Cpu)?;
    let p_in = Tensor::randn(0f32, 1f32, (1, 5, 8), &Device::Cpu)?;
    let (sample, pass) = layer.build(&q_in, &p_in, Mode::Train)?;
    assert_eq!(sample.dims3()?, (1, 5, 4));

    let mask = ones_mask(1, 5)?;
    let train_losses = layer.build_loss(&pass, &mask, &ReduceLoss::MeanSequence, 0, Mode::Train)?;
    assert!(train_losses.contains_key("loss_kld"));
    assert!(train_losses.contains_key("loss_temporal_kld"));

    let eval_losses = layer.build_loss(&pass, &mask, &ReduceLoss::MeanSequence, 0, Mode::Eval)?;
    assert!(eval_losses.contains_key("loss_kld"));
    assert!(!eval_losses.contains_key("loss_temporal_kld"));
    Ok(())
}

#[test]
fn sigma_threshold_clamps_the_scale() -> Result<()> {
    let varmap = VarMap::new();
    let cfg = LatentLayerConfig {
        latent_size: LatentSize::Uniform(4),
        latent_sigma_threshold: 0.5,
        ..Default::default()
    };
    let ladder = LadderLatentLayer::new(cfg, 1, 8, builder(&varmap))?;
    let inputs = det_layers(1, 2, 3, 8)?;
    let (_, pass) = ladder.build(&inputs, &inputs, Mode::Train)?;
    for dist in pass.q.iter().chain(pass.p.iter()) {
        let max = dist.sigma.max_all()?.to_scalar::<f32>()?;
        let min = dist.sigma.min_all()?.to_scalar::<f32>()?;
        assert!(max <= 0.5 + 1e-6);
        assert!(min >= 1e-3 - 1e-9);
    }
    Ok(())
}
