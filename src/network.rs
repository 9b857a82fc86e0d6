//! # Noise Prediction Networks
//!
//! The diffusion module only needs a function `eps_theta(x_t, t)` that
//! predicts the noise mixed into `x_t`. [`NoisePredictor`] is that seam;
//! [`SimpleNet`] is a small time-conditioned MLP for 2-D point clouds.
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tch::{nn, nn::Module, Kind, Tensor};

pub trait NoisePredictor {
    /// Predicts the noise of `xt` at timestep `t`. The output has the shape
    /// of `xt`; `t` holds either one timestep per sample or a single one.
    fn predict_noise(&self, xt: &Tensor, t: &Tensor) -> Tensor;

    /// Spatial resolution for image models, `None` for everything else.
    fn image_resolution(&self) -> Option<i64> {
        None
    }
}

/// A network that can be rebuilt from its configuration, which is what a
/// checkpoint needs to restore it.
pub trait BuildNetwork: NoisePredictor + Sized {
    type Config: Serialize + DeserializeOwned + Clone + std::fmt::Debug;

    fn build(vs: nn::Path, config: &Self::Config) -> Self;

    fn config(&self) -> &Self::Config;
}

const FREQUENCY_EMBEDDING_SIZE: i64 = 256;
const MAX_PERIOD: f64 = 10000.;

/// Sinusoidal embedding of (possibly fractional) timesteps, `[cos, sin]`.
fn timestep_embedding(t: &Tensor, dim: i64) -> Tensor {
    let half = dim / 2;
    let device = t.device();
    let scale = -MAX_PERIOD.ln() / half as f64;
    let freqs = (Tensor::arange(half, (Kind::Float, device)) * scale).exp();
    let args = t.to_kind(Kind::Float).unsqueeze(-1) * freqs.unsqueeze(0);
    let embedding = Tensor::cat(&[args.cos(), args.sin()], -1);
    if dim % 2 == 1 {
        let pad = embedding.zeros_like().narrow(-1, 0, 1);
        Tensor::cat(&[embedding, pad], -1)
    } else {
        embedding
    }
}

#[derive(Debug)]
struct TimeEmbedding {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
}

impl TimeEmbedding {
    fn new(vs: nn::Path, hidden_size: i64) -> Self {
        let linear_1 =
            nn::linear(&vs / "linear_1", FREQUENCY_EMBEDDING_SIZE, hidden_size, Default::default());
        let linear_2 = nn::linear(&vs / "linear_2", hidden_size, hidden_size, Default::default());
        Self { linear_1, linear_2 }
    }

    fn forward(&self, t: &Tensor) -> Tensor {
        let t = if t.dim() == 0 { t.unsqueeze(0) } else { t.shallow_clone() };
        timestep_embedding(&t, FREQUENCY_EMBEDDING_SIZE)
            .apply(&self.linear_1)
            .silu()
            .apply(&self.linear_2)
    }
}

/// A linear layer whose output is scaled elementwise by an embedding of the
/// timestep.
#[derive(Debug)]
struct TimeLinear {
    fc: nn::Linear,
    time_embedding: TimeEmbedding,
    dim_out: i64,
}

impl TimeLinear {
    fn new(vs: nn::Path, dim_in: i64, dim_out: i64) -> Self {
        let fc = nn::linear(&vs / "fc", dim_in, dim_out, Default::default());
        let time_embedding = TimeEmbedding::new(&vs / "time_embedding", dim_out);
        Self { fc, time_embedding, dim_out }
    }

    fn forward(&self, xs: &Tensor, t: &Tensor) -> Tensor {
        let xs = self.fc.forward(xs);
        let alpha = self.time_embedding.forward(t).view([-1, self.dim_out]);
        alpha * xs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleNetConfig {
    pub dim_in: i64,
    pub dim_out: i64,
    pub dim_hids: Vec<i64>,
}

impl Default for SimpleNetConfig {
    fn default() -> Self {
        Self { dim_in: 2, dim_out: 2, dim_hids: vec![128, 128, 128] }
    }
}

/// Noise predictor for low-dimensional data: `TimeLinear` layers with ReLU
/// activations in between.
#[derive(Debug)]
pub struct SimpleNet {
    layers: Vec<TimeLinear>,
    config: SimpleNetConfig,
}

impl SimpleNet {
    pub fn new(vs: nn::Path, config: SimpleNetConfig) -> Self {
        let vs = &vs / "layers";
        let mut dims = vec![config.dim_in];
        dims.extend(config.dim_hids.iter().copied());
        dims.push(config.dim_out);
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(index, w)| TimeLinear::new(&vs / index, w[0], w[1]))
            .collect();
        Self { layers, config }
    }
}

impl NoisePredictor for SimpleNet {
    fn predict_noise(&self, xt: &Tensor, t: &Tensor) -> Tensor {
        let last = self.layers.len() - 1;
        let mut xs = xt.shallow_clone();
        for (index, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs, t);
            if index < last {
                xs = xs.relu();
            }
        }
        xs
    }
}

impl BuildNetwork for SimpleNet {
    type Config = SimpleNetConfig;

    fn build(vs: nn::Path, config: &Self::Config) -> Self {
        SimpleNet::new(vs, config.clone())
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}
