//! # Variance Schedule
//!
//! The DDPM forward process adds Gaussian noise with variance `beta_t` at
//! every step. The schedule precomputes `betas`, `alphas = 1 - betas` and
//! the running product `alphas_cumprod` once, for every training timestep.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
use std::{fs, str::FromStr};

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::error::DdpmError;

pub mod types;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    Quad,
}

impl FromStr for BetaSchedule {
    type Err = DdpmError;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode {
            "linear" => Ok(BetaSchedule::Linear),
            "quad" => Ok(BetaSchedule::Quad),
            _ => Err(DdpmError::UnsupportedMode(mode.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceSchedulerConfig {
    /// Number of diffusion steps used to train the model.
    pub num_train_timesteps: usize,
    /// The value of beta at the first timestep.
    #[serde(default = "default_beta_1")]
    pub beta_1: f64,
    /// The value of beta at the last timestep.
    #[serde(default = "default_beta_t")]
    pub beta_t: f64,
    /// How beta evolves over the timesteps, `linear` or `quad`.
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_beta_1() -> f64 {
    1e-4
}

fn default_beta_t() -> f64 {
    0.02
}

fn default_mode() -> String {
    "linear".to_string()
}

impl Default for VarianceSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_1: default_beta_1(),
            beta_t: default_beta_t(),
            mode: default_mode(),
        }
    }
}

impl VarianceSchedulerConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: VarianceSchedulerConfig = toml::from_str(&file)?;
        Ok(cfg)
    }
}

/// The DDPM variance scheduler. Immutable once built.
#[derive(Debug)]
pub struct VarianceScheduler {
    timesteps: Vec<i64>,
    betas: Tensor,
    alphas: Tensor,
    alphas_cumprod: Tensor,
    config: VarianceSchedulerConfig,
}

impl VarianceScheduler {
    /// Builds the schedule on `device`. Fails when the interpolation mode is
    /// unknown or when there are no training timesteps.
    pub fn new(config: VarianceSchedulerConfig, device: Device) -> Result<Self, DdpmError> {
        let schedule = BetaSchedule::from_str(&config.mode)?;
        if config.num_train_timesteps == 0 {
            return Err(DdpmError::ZeroTimesteps);
        }
        let steps = config.num_train_timesteps as i64;
        let betas = match schedule {
            BetaSchedule::Linear => {
                Tensor::linspace(config.beta_1, config.beta_t, steps, (Kind::Double, Device::Cpu))
            }
            BetaSchedule::Quad => Tensor::linspace(
                config.beta_1.sqrt(),
                config.beta_t.sqrt(),
                steps,
                (Kind::Double, Device::Cpu),
            )
            .square(),
        };
        let alphas: Tensor = 1.0 - &betas;
        let alphas_cumprod = alphas.cumprod(0, Kind::Double);
        tracing::debug!(
            ?schedule,
            num_train_timesteps = config.num_train_timesteps,
            beta_1 = config.beta_1,
            beta_t = config.beta_t,
            "built variance schedule"
        );
        let to_buffer = |t: Tensor| t.to_kind(Kind::Float).to_device(device);
        Ok(Self {
            timesteps: (0..steps).rev().collect(),
            betas: to_buffer(betas),
            alphas: to_buffer(alphas),
            alphas_cumprod: to_buffer(alphas_cumprod),
            config,
        })
    }

    /// Rebuilds a scheduler around previously computed buffers, e.g. the ones
    /// restored from a checkpoint.
    pub(crate) fn from_buffers(
        config: VarianceSchedulerConfig,
        betas: Tensor,
        alphas: Tensor,
        alphas_cumprod: Tensor,
    ) -> Result<Self, DdpmError> {
        BetaSchedule::from_str(&config.mode)?;
        let steps = config.num_train_timesteps as i64;
        let buffers = [("betas", &betas), ("alphas", &alphas), ("alphas_cumprod", &alphas_cumprod)];
        for (name, buffer) in buffers {
            if buffer.size() != [steps] {
                return Err(DdpmError::Checkpoint(format!(
                    "buffer {name} has shape {:?}, expected [{steps}]",
                    buffer.size()
                )));
            }
        }
        Ok(Self { timesteps: (0..steps).rev().collect(), betas, alphas, alphas_cumprod, config })
    }

    pub fn config(&self) -> &VarianceSchedulerConfig {
        &self.config
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.config.num_train_timesteps
    }

    /// The reverse-process order, `T-1` down to `0`.
    pub fn timesteps(&self) -> &[i64] {
        self.timesteps.as_slice()
    }

    pub fn betas(&self) -> &Tensor {
        &self.betas
    }

    pub fn alphas(&self) -> &Tensor {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &Tensor {
        &self.alphas_cumprod
    }

    pub fn device(&self) -> Device {
        self.betas.device()
    }
}

/// Gathers `input[t]` and reshapes it to `[len(t), 1, ..., 1]` so that it
/// broadcasts against `x`, whose leading dimension is the batch.
pub fn extract(input: &Tensor, t: &Tensor, x: &Tensor) -> Tensor {
    let t = if t.dim() == 0 { t.unsqueeze(0) } else { t.shallow_clone() };
    let t = t.to_kind(Kind::Int64).to_device(input.device());
    let out = input.index_select(0, &t);
    let mut shape = vec![t.size()[0]];
    shape.resize(x.dim().max(1), 1);
    out.reshape(shape.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn values(t: &Tensor) -> Vec<f64> {
        Vec::<f64>::try_from(&t.to_kind(Kind::Double)).unwrap()
    }

    fn scheduler(num_train_timesteps: usize, mode: &str) -> VarianceScheduler {
        let config = VarianceSchedulerConfig {
            num_train_timesteps,
            mode: mode.to_string(),
            ..Default::default()
        };
        VarianceScheduler::new(config, Device::Cpu).unwrap()
    }

    #[test]
    fn test_load_default_config() {
        let cfg = VarianceSchedulerConfig::from_file("src/schedulers/config.default.toml").unwrap();
        assert_eq!(cfg.num_train_timesteps, 1000);
        assert_eq!(cfg.mode, "linear");
        assert_relative_eq!(cfg.beta_1, 1e-4);
        assert_relative_eq!(cfg.beta_t, 0.02);
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let cfg: VarianceSchedulerConfig = toml::from_str("num_train_timesteps = 50").unwrap();
        assert_eq!(cfg, VarianceSchedulerConfig { num_train_timesteps: 50, ..Default::default() });
    }

    #[test]
    fn test_linear_endpoints() {
        let s = scheduler(1000, "linear");
        let betas = values(s.betas());
        assert_eq!(betas.len(), 1000);
        assert_relative_eq!(betas[0], 1e-4, max_relative = 1e-5);
        assert_relative_eq!(betas[999], 0.02, max_relative = 1e-5);
        let cumprod = values(s.alphas_cumprod());
        assert!(cumprod.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_quad_endpoints() {
        let s = scheduler(200, "quad");
        let betas = values(s.betas());
        assert_relative_eq!(betas[0], 1e-4, max_relative = 1e-5);
        assert_relative_eq!(betas[199], 0.02, max_relative = 1e-5);
        // sqrt(beta) is linear, so the midpoint lies below the linear one.
        let linear = values(scheduler(200, "linear").betas());
        assert!(betas[100] < linear[100]);
    }

    #[test]
    fn test_monotonic_schedules() {
        for mode in ["linear", "quad"] {
            for steps in [1, 2, 10, 1000] {
                let s = scheduler(steps, mode);
                let betas = values(s.betas());
                assert!(betas.windows(2).all(|w| w[0] <= w[1]), "{mode}/{steps}");
                let cumprod = values(s.alphas_cumprod());
                assert!(cumprod.windows(2).all(|w| w[1] <= w[0]), "{mode}/{steps}");
                assert!(cumprod.iter().all(|&a| a > 0.0 && a <= 1.0), "{mode}/{steps}");
            }
        }
    }

    #[test]
    fn test_alphas_complement_betas() {
        let s = scheduler(10, "quad");
        let betas = values(s.betas());
        let alphas = values(s.alphas());
        for (a, b) in alphas.iter().zip(betas.iter()) {
            assert_relative_eq!(a + b, 1.0, epsilon = 1e-6);
        }
        let cumprod = values(s.alphas_cumprod());
        assert_relative_eq!(cumprod[1], alphas[0] * alphas[1], epsilon = 1e-6);
    }

    #[test]
    fn test_unsupported_mode() {
        let config = VarianceSchedulerConfig { mode: "cosine".to_string(), ..Default::default() };
        let err = VarianceScheduler::new(config, Device::Cpu).unwrap_err();
        assert!(matches!(err, DdpmError::UnsupportedMode(ref m) if m == "cosine"));
        assert_eq!(err.to_string(), "cosine is not implemented.");
    }

    #[test]
    fn test_zero_timesteps() {
        let config = VarianceSchedulerConfig { num_train_timesteps: 0, ..Default::default() };
        let err = VarianceScheduler::new(config, Device::Cpu).unwrap_err();
        assert!(matches!(err, DdpmError::ZeroTimesteps));
    }

    #[test]
    fn test_timesteps_descend() {
        let s = scheduler(5, "linear");
        assert_eq!(s.timesteps(), &[4, 3, 2, 1, 0]);
        assert_eq!(s.num_train_timesteps(), 5);
    }

    #[test]
    fn test_extract_broadcast_shape() {
        let s = scheduler(10, "linear");
        let x = Tensor::zeros([3, 2], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[0i64, 5, 9]);
        let out = extract(s.alphas_cumprod(), &t, &x);
        assert_eq!(out.size(), vec![3, 1]);
        let cumprod = values(s.alphas_cumprod());
        let out = values(&out.view([-1]));
        assert_relative_eq!(out[1], cumprod[5]);
        assert_relative_eq!(out[2], cumprod[9]);

        let x = Tensor::zeros([4, 3, 8, 8], (Kind::Float, Device::Cpu));
        let scalar = Tensor::from_slice(&[2i64]).squeeze();
        assert_eq!(extract(s.betas(), &scalar, &x).size(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_from_buffers_checks_length() {
        let s = scheduler(4, "linear");
        let config = VarianceSchedulerConfig { num_train_timesteps: 5, ..s.config.clone() };
        let err = VarianceScheduler::from_buffers(
            config,
            s.betas().shallow_clone(),
            s.alphas().shallow_clone(),
            s.alphas_cumprod().shallow_clone(),
        )
        .unwrap_err();
        assert!(matches!(err, DdpmError::Checkpoint(_)));
    }
}
