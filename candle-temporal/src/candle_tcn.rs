use candle_core::{bail, Result, Tensor};
use candle_nn::{Activation, Conv1d, Conv1dConfig, Linear, Module, VarBuilder};

/// Configuration of a causal convolution stack.
#[derive(Debug, Clone)]
pub struct TcnConfig {
    pub num_layers: usize,
    pub num_filters: usize,
    pub filter_size: usize,
    /// Per-block dilation; must provide at least `num_layers` entries.
    /// The WaveNet pattern doubles it per block (1, 2, 4, 8, ...).
    pub dilation_size: Vec<usize>,
    pub activation: Activation,
    pub use_gating: bool,
    pub use_residual: bool,
    pub use_skip: bool,
    /// Left-pad every convolution so output length equals input length.
    /// Without padding the output shrinks by the receptive field minus one.
    pub zero_padding: bool,
}

impl Default for TcnConfig {
    fn default() -> Self {
        Self {
            num_layers: 5,
            num_filters: 32,
            filter_size: 2,
            dilation_size: vec![1, 2, 4, 8, 16],
            activation: Activation::Relu,
            use_gating: false,
            use_residual: true,
            use_skip: false,
            zero_padding: true,
        }
    }
}

impl TcnConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            bail!("causal convolution stack needs at least one layer");
        }
        if self.filter_size == 0 {
            bail!("filter_size must be positive");
        }
        if self.dilation_size.len() < self.num_layers {
            bail!(
                "dilation_size provides {} entries but num_layers is {}",
                self.dilation_size.len(),
                self.num_layers
            );
        }
        if self.dilation_size.iter().any(|&d| d == 0) {
            bail!("dilation factors must be positive");
        }
        Ok(())
    }
}

/// Receptive field of a stack of causal convolutions:
/// `(filter_size - 1) * sum(dilations) + 1`
pub fn receptive_field_size(filter_size: usize, dilation_size: &[usize]) -> usize {
    (filter_size - 1) * dilation_size.iter().sum::<usize>() + 1
}

/// 1D convolution restricted to current and past steps.
///
/// Operates on (n x t x d) tensors; the channel-major layout expected by
/// `Conv1d` is handled internally. With `zero_padding` the input is
/// left-padded with `(kernel_size - 1) * dilation` zeros so the output
/// length equals the input length; otherwise the output shrinks by that
/// amount.
pub struct CausalConv1d {
    conv: Conv1d,
    activation: Option<Activation>,
    pad_steps: usize,
    zero_padding: bool,
}

impl CausalConv1d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_dim: usize,
        num_filters: usize,
        kernel_size: usize,
        dilation: usize,
        zero_padding: bool,
        activation: Option<Activation>,
        vs: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv1dConfig {
            dilation,
            ..Default::default()
        };
        let conv = candle_nn::conv1d(in_dim, num_filters, kernel_size, cfg, vs)?;
        Ok(Self {
            conv,
            activation,
            pad_steps: (kernel_size - 1) * dilation,
            zero_padding,
        })
    }

    pub fn forward(&self, x_ntd: &Tensor) -> Result<Tensor> {
        let x_ndt = x_ntd.transpose(1, 2)?;
        let x_ndt = if self.zero_padding && self.pad_steps > 0 {
            x_ndt.pad_with_zeros(2, self.pad_steps, 0)?
        } else {
            x_ndt
        };
        let y_ntd = self.conv.forward(&x_ndt)?.transpose(1, 2)?;
        match self.activation {
            Some(act) => act.forward(&y_ntd),
            None => Ok(y_ntd),
        }
    }
}

/// WaveNet-style gated unit: `tanh(filter_conv(x)) * sigmoid(gate_conv(x))`
pub struct GatedCausalConv {
    filter: CausalConv1d,
    gate: CausalConv1d,
}

impl GatedCausalConv {
    pub fn new(
        in_dim: usize,
        num_filters: usize,
        kernel_size: usize,
        dilation: usize,
        zero_padding: bool,
        vs: VarBuilder,
    ) -> Result<Self> {
        let filter = CausalConv1d::new(
            in_dim,
            num_filters,
            kernel_size,
            dilation,
            zero_padding,
            None,
            vs.pp("filter_conv"),
        )?;
        let gate = CausalConv1d::new(
            in_dim,
            num_filters,
            kernel_size,
            dilation,
            zero_padding,
            None,
            vs.pp("gate_conv"),
        )?;
        Ok(Self { filter, gate })
    }

    pub fn forward(&self, x_ntd: &Tensor) -> Result<Tensor> {
        let filter = self.filter.forward(x_ntd)?.tanh()?;
        let gate = candle_nn::ops::sigmoid(&self.gate.forward(x_ntd)?)?;
        filter.mul(&gate)
    }
}

enum CausalUnit {
    Gated(GatedCausalConv),
    Plain(CausalConv1d),
}

/// One causal convolution (gated or plain) followed by a 1x1 projection.
///
/// Returns both the residual-summed output and the pre-residual skip
/// output. Without zero padding the residual input is trimmed on the left
/// so both operands have the output length.
pub struct TemporalBlock {
    unit: CausalUnit,
    out_proj: Linear,
    res_proj: Option<Linear>,
    use_residual: bool,
    zero_padding: bool,
}

impl TemporalBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_dim: usize,
        num_filters: usize,
        kernel_size: usize,
        dilation: usize,
        activation: Option<Activation>,
        use_gate: bool,
        use_residual: bool,
        zero_padding: bool,
        vs: VarBuilder,
    ) -> Result<Self> {
        let unit = if use_gate {
            CausalUnit::Gated(GatedCausalConv::new(
                in_dim,
                num_filters,
                kernel_size,
                dilation,
                zero_padding,
                vs.pp("gated_causal_layer"),
            )?)
        } else {
            CausalUnit::Plain(CausalConv1d::new(
                in_dim,
                num_filters,
                kernel_size,
                dilation,
                zero_padding,
                activation,
                vs.pp("causal_layer"),
            )?)
        };
        let out_proj = candle_nn::linear(num_filters, num_filters, vs.pp("block_output"))?;
        let res_proj = if use_residual && in_dim != num_filters {
            Some(candle_nn::linear(in_dim, num_filters, vs.pp("residual_proj"))?)
        } else {
            None
        };
        Ok(Self {
            unit,
            out_proj,
            res_proj,
            use_residual,
            zero_padding,
        })
    }

    pub fn forward(&self, x_ntd: &Tensor) -> Result<(Tensor, Tensor)> {
        let temp = match &self.unit {
            CausalUnit::Gated(gated) => gated.forward(x_ntd)?,
            CausalUnit::Plain(conv) => conv.forward(x_ntd)?,
        };
        let temp = self.out_proj.forward(&temp)?;
        let skip = temp.clone();

        if !self.use_residual {
            return Ok((temp, skip));
        }

        let res = match &self.res_proj {
            Some(proj) => proj.forward(x_ntd)?,
            None => x_ntd.clone(),
        };
        let res = if self.zero_padding {
            res
        } else {
            // Cut off the head of the input so both sides align on the right.
            let out_len = temp.dim(1)?;
            res.narrow(1, res.dim(1)? - out_len, out_len)?
        };
        Ok((temp.add(&res)?, skip))
    }
}

/// N temporal blocks with per-block dilations from the configured list.
pub struct TemporalConvStack {
    blocks: Vec<TemporalBlock>,
    receptive_field: usize,
}

impl TemporalConvStack {
    /// Builds `num_layers` blocks sharing `cfg`'s filter count and flags.
    /// `kernel_size` may differ from `cfg.filter_size` (decoder stacks use
    /// their own).
    pub fn new(
        in_dim: usize,
        num_layers: usize,
        kernel_size: usize,
        cfg: &TcnConfig,
        vs: VarBuilder,
    ) -> Result<Self> {
        if cfg.dilation_size.len() < num_layers {
            bail!(
                "dilation_size provides {} entries but the stack has {} layers",
                cfg.dilation_size.len(),
                num_layers
            );
        }
        let mut blocks = Vec::with_capacity(num_layers);
        for idx in 0..num_layers {
            let block_in = if idx == 0 { in_dim } else { cfg.num_filters };
            blocks.push(TemporalBlock::new(
                block_in,
                cfg.num_filters,
                kernel_size,
                cfg.dilation_size[idx],
                Some(cfg.activation),
                cfg.use_gating,
                cfg.use_residual,
                cfg.zero_padding,
                vs.pp(format!("temporal_block_{}", idx + 1)),
            )?);
        }
        Ok(Self {
            blocks,
            receptive_field: receptive_field_size(kernel_size, &cfg.dilation_size[..num_layers]),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn receptive_field(&self) -> usize {
        self.receptive_field
    }

    /// Runs all blocks, returning per-block residual outputs and skip
    /// outputs (both ordered bottom to top).
    pub fn forward(&self, x_ntd: &Tensor) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        let mut outs = Vec::with_capacity(self.blocks.len());
        let mut skips = Vec::with_capacity(self.blocks.len());
        let mut current = x_ntd.clone();
        for block in self.blocks.iter() {
            let (out, skip) = block.forward(&current)?;
            current = out.clone();
            outs.push(out);
            skips.push(skip);
        }
        Ok((outs, skips))
    }
}
