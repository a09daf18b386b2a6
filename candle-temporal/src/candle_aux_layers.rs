use candle_core::{Device, Result, Tensor};
use candle_nn::{Activation, Dropout, Linear, Module, VarBuilder};

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Build `num_layers` feed-forward layers of width `num_units`, each followed
/// by `activation`. Applied per time step: a linear layer over the feature
/// axis of a (n x t x d) tensor is a 1x1 convolution.
///
/// * `in_dim` - input feature size
/// * `num_layers` - number of hidden layers (0 gives an empty stack)
/// * `num_units` - width of each hidden layer
/// * `vs` - variable builder; layers live under `fc.{idx}`
pub fn feed_forward_stack(
    in_dim: usize,
    num_layers: usize,
    num_units: usize,
    activation: Activation,
    vs: VarBuilder,
) -> Result<StackLayers<Linear>> {
    let mut fc = StackLayers::<Linear>::new();
    let mut prev_dim = in_dim;
    for j in 0..num_layers {
        let name = format!("fc.{}", j);
        fc.push_with_act(candle_nn::linear(prev_dim, num_units, vs.pp(name))?, activation);
        prev_dim = num_units;
    }
    Ok(fc)
}

/// Configuration of the raw-input projection applied before the temporal
/// core.
#[derive(Debug, Clone)]
pub struct InputLayerConfig {
    pub dropout_rate: f32,
    /// Number of feed-forward projection layers; 0 feeds the raw input
    /// through (after dropout, if any).
    pub num_layers: usize,
    pub num_units: usize,
    pub activation: Activation,
}

impl Default for InputLayerConfig {
    fn default() -> Self {
        Self {
            dropout_rate: 0.0,
            num_layers: 0,
            num_units: 64,
            activation: Activation::Relu,
        }
    }
}

/// Optional dropout followed by a feed-forward projection stack. Dropout is
/// active in training mode only.
pub struct InputProjection {
    dropout: Option<Dropout>,
    fc: StackLayers<Linear>,
    out_dim: usize,
}

impl InputProjection {
    pub fn new(in_dim: usize, cfg: &InputLayerConfig, vs: VarBuilder) -> Result<Self> {
        let dropout = if cfg.dropout_rate > 0.0 {
            Some(Dropout::new(cfg.dropout_rate))
        } else {
            None
        };
        let fc = feed_forward_stack(in_dim, cfg.num_layers, cfg.num_units, cfg.activation, vs)?;
        let out_dim = if cfg.num_layers == 0 {
            in_dim
        } else {
            cfg.num_units
        };
        Ok(Self {
            dropout,
            fc,
            out_dim,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn forward(&self, x_ntd: &Tensor, train: bool) -> Result<Tensor> {
        let x = match &self.dropout {
            Some(dropout) => dropout.forward(x_ntd, train)?,
            None => x_ntd.clone(),
        };
        self.fc.forward(&x)
    }
}

/// Binary mask (n x t x 1) from per-sample sequence lengths.
///
/// Position (i, s, 0) is 1 when s < lengths[i], else 0. Multiplied into
/// every per-step loss before reduction.
pub fn sequence_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let n = lengths.len();
    let mut data = vec![0f32; n * max_len];
    for (i, &len) in lengths.iter().enumerate() {
        for s in 0..len.min(max_len) {
            data[i * max_len + s] = 1.0;
        }
    }
    Tensor::from_vec(data, (n, max_len, 1), device)
}
