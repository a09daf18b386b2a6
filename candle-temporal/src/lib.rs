pub mod candle_annealing;
pub mod candle_aux_layers;
pub mod candle_latent_layers;
pub mod candle_loss_functions;
pub mod candle_model_rnn;
pub mod candle_model_stcn;
pub mod candle_model_tcn;
pub mod candle_model_traits;
pub mod candle_model_vrnn;
pub mod candle_output_layers;
pub mod candle_seq_inference;
pub mod candle_tcn;

pub use candle_core;
pub use candle_nn;
