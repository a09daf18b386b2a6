use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_temporal::candle_tcn::*;

fn builder(varmap: &VarMap) -> VarBuilder {
    VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
}

fn gated_config(zero_padding: bool) -> TcnConfig {
    TcnConfig {
        num_layers: 3,
        num_filters: 4,
        filter_size: 2,
        dilation_size: vec![1, 2, 4],
        use_gating: true,
        use_residual: true,
        zero_padding,
        ..Default::default()
    }
}

/// Two input sequences of shape (1 x t x d), constant except that the
/// second one is perturbed at time step `at`.
fn perturbed_pair(t: usize, d: usize, at: usize) -> Result<(Tensor, Tensor)> {
    let base = vec![0.1f32; t * d];
    let mut bumped = base.clone();
    for j in 0..d {
        bumped[at * d + j] = 5.0;
    }
    Ok((
        Tensor::from_vec(base, (1, t, d), &Device::Cpu)?,
        Tensor::from_vec(bumped, (1, t, d), &Device::Cpu)?,
    ))
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    a.sub(b)?.abs()?.max_all()?.to_scalar::<f32>()
}

#[test]
fn zero_padding_preserves_sequence_length() -> Result<()> {
    let varmap = VarMap::new();
    let cfg = gated_config(true);
    let stack = TemporalConvStack::new(3, 3, 2, &cfg, builder(&varmap))?;

    let x = Tensor::randn(0f32, 1f32, (1, 12, 3), &Device::Cpu)?;
    let (outs, skips) = stack.forward(&x)?;
    for layer in outs.iter().chain(skips.iter()) {
        assert_eq!(layer.dims3()?, (1, 12, 4));
    }
    Ok(())
}

#[test]
fn unpadded_output_shrinks_by_the_receptive_field() -> Result<()> {
    let varmap = VarMap::new();
    let cfg = gated_config(false);
    let stack = TemporalConvStack::new(3, 3, 2, &cfg, builder(&varmap))?;

    assert_eq!(receptive_field_size(2, &[1, 2, 4]), 8);
    assert_eq!(stack.receptive_field(), 8);

    let x = Tensor::randn(0f32, 1f32, (1, 12, 3), &Device::Cpu)?;
    let (outs, _) = stack.forward(&x)?;
    assert_eq!(outs[outs.len() - 1].dims3()?, (1, 12 - 8 + 1, 4));
    Ok(())
}

#[test]
fn outputs_never_see_future_steps() -> Result<()> {
    let varmap = VarMap::new();
    let cfg = gated_config(true);
    let stack = TemporalConvStack::new(3, 3, 2, &cfg, builder(&varmap))?;

    let t = 10;
    let (x_base, x_bumped) = perturbed_pair(t, 3, t - 1)?;
    let (outs_base, _) = stack.forward(&x_base)?;
    let (outs_bumped, _) = stack.forward(&x_bumped)?;

    let top_base = outs_base[outs_base.len() - 1].narrow(1, 0, t - 1)?;
    let top_bumped = outs_bumped[outs_bumped.len() - 1].narrow(1, 0, t - 1)?;
    assert!(max_abs_diff(&top_base, &top_bumped)? < 1e-6);
    Ok(())
}

#[test]
fn field_of_view_matches_the_receptive_field_formula() -> Result<()> {
    let varmap = VarMap::new();
    let cfg = gated_config(false);
    let stack = TemporalConvStack::new(3, 3, 2, &cfg, builder(&varmap))?;

    let rf = stack.receptive_field();
    let t = rf + 2;

    // Output position 0 covers input positions [0, rf). Perturbing the
    // input at position rf must leave it untouched while later output
    // positions move.
    let (x_base, x_bumped) = perturbed_pair(t, 3, rf)?;
    let (outs_base, _) = stack.forward(&x_base)?;
    let (outs_bumped, _) = stack.forward(&x_bumped)?;

    let top_base = outs_base[outs_base.len() - 1].clone();
    let top_bumped = outs_bumped[outs_bumped.len() - 1].clone();

    let first_base = top_base.narrow(1, 0, 1)?;
    let first_bumped = top_bumped.narrow(1, 0, 1)?;
    assert!(max_abs_diff(&first_base, &first_bumped)? < 1e-6);

    let second_base = top_base.narrow(1, 1, 1)?;
    let second_bumped = top_bumped.narrow(1, 1, 1)?;
    assert!(max_abs_diff(&second_base, &second_bumped)? > 1e-6);
    Ok(())
}

#[test]
fn residual_projection_aligns_channel_counts() -> Result<()> {
    let varmap = VarMap::new();
    let mut cfg = gated_config(true);
    cfg.use_gating = false;
    // First block maps 3 -> 4 channels, so its residual needs a projection.
    let stack = TemporalConvStack::new(3, 3, 2, &cfg, builder(&varmap))?;
    let x = Tensor::randn(0f32, 1f32, (2, 6, 3), &Device::Cpu)?;
    let (outs, _) = stack.forward(&x)?;
    assert_eq!(outs[0].dims3()?, (2, 6, 4));
    Ok(())
}

#[test]
fn stack_rejects_short_dilation_lists() {
    let varmap = VarMap::new();
    let cfg = TcnConfig {
        num_layers: 4,
        dilation_size: vec![1, 2],
        ..Default::default()
    };
    assert!(TemporalConvStack::new(3, 4, 2, &cfg, builder(&varmap)).is_err());
}
