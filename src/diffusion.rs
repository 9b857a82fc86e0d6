//! # Denoising Diffusion Probabilistic Models
//!
//! [`DiffusionModule`] pairs a noise-predicting network with a
//! [`VarianceScheduler`] and implements the DDPM forward process
//! `q(x_t | x_0)`, the reverse step `p(x_{t-1} | x_t)`, the full sampling
//! loop and the simplified training objective.
use std::{collections::HashMap, path::Path};

use tch::{nn, Device, Kind, Reduction, TchError, Tensor};

use crate::{
    config::DiffusionConfig,
    error::DdpmError,
    network::{BuildNetwork, NoisePredictor},
    schedulers::{extract, types::Timestep, VarianceScheduler},
    utils,
};

const NETWORK_PATH: &str = "network";
const HPARAMS_KEY: &str = "hparams";
const BETAS_KEY: &str = "var_scheduler.betas";
const ALPHAS_KEY: &str = "var_scheduler.alphas";
const ALPHAS_CUMPROD_KEY: &str = "var_scheduler.alphas_cumprod";

pub struct DiffusionModule<N> {
    vs: nn::VarStore,
    pub network: N,
    pub var_scheduler: VarianceScheduler,
}

impl<N: NoisePredictor> DiffusionModule<N> {
    /// Wraps a network whose parameters live in `vs`.
    pub fn from_parts(vs: nn::VarStore, network: N, var_scheduler: VarianceScheduler) -> Self {
        Self { vs, network, var_scheduler }
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn image_resolution(&self) -> Option<i64> {
        self.network.image_resolution()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    /// Samples `x_t ~ q(x_t | x_0)`:
    /// `x_t = sqrt(alphas_cumprod[t]) * x_0 + sqrt(1 - alphas_cumprod[t]) * noise`.
    ///
    /// Standard Gaussian noise is drawn when `noise` is `None`.
    pub fn q_sample(&self, x0: &Tensor, t: impl Into<Timestep>, noise: Option<&Tensor>) -> Tensor {
        let noise = match noise {
            Some(noise) => noise.shallow_clone(),
            None => Tensor::randn_like(x0),
        };
        let t = t.into().to_tensor(x0.device());
        let alphas_prod_t = extract(self.var_scheduler.alphas_cumprod(), &t, x0);
        alphas_prod_t.sqrt() * x0 + (1.0f64 - &alphas_prod_t).sqrt() * noise
    }

    /// One reverse step `x_t -> x_{t-1}` using the DDPM posterior mean. No
    /// noise is added for samples at `t == 0`.
    pub fn p_sample(&self, xt: &Tensor, t: impl Into<Timestep>) -> Tensor {
        let _no_grad = tch::no_grad_guard();
        let t = t.into().to_tensor(xt.device());
        let scheduler = &self.var_scheduler;
        let alphas_cumprod_t = extract(scheduler.alphas_cumprod(), &t, xt);
        let alphas_t = extract(scheduler.alphas(), &t, xt);
        let betas_t = extract(scheduler.betas(), &t, xt);

        let eps_factor = (1.0f64 - &alphas_t) / (1.0f64 - &alphas_cumprod_t).sqrt();
        let eps_theta = self.network.predict_noise(xt, &t);

        let noise = Tensor::randn_like(xt);
        let mut mask_shape = vec![-1i64];
        mask_shape.resize(xt.dim().max(1), 1);
        let nonzero_mask = t.ne(0).to_kind(xt.kind()).view(mask_shape.as_slice());

        (xt - eps_factor * eps_theta) / alphas_t.sqrt() + nonzero_mask * betas_t.sqrt() * noise
    }

    /// Runs the reverse process from pure noise of the given shape, e.g.
    /// `[num_particles, 2]`, through every timestep down to zero.
    pub fn p_sample_loop(&self, shape: &[i64]) -> Tensor {
        let _no_grad = tch::no_grad_guard();
        let mut x0_pred = Tensor::randn(shape, (Kind::Float, self.device()));
        for &t in self.var_scheduler.timesteps() {
            tracing::trace!(t, "reverse step");
            x0_pred = self.p_sample(&x0_pred, t);
        }
        if utils::has_nan(&x0_pred) {
            let count = utils::count_nan(&x0_pred);
            tracing::warn!(count, "reverse process produced NaN values");
        }
        x0_pred
    }

    /// The simplified noise matching loss, equation 14 of the DDPM paper.
    /// The returned scalar is attached to the autograd graph. `x0` must have
    /// a leading batch dimension.
    pub fn compute_loss(&self, x0: &Tensor) -> Result<Tensor, DdpmError> {
        let batch_size = x0.size().first().copied().ok_or_else(|| {
            TchError::Shape("compute_loss expects a batched x0, got a scalar".to_string())
        })?;
        let num_train_timesteps = self.var_scheduler.num_train_timesteps() as i64;
        let t = Tensor::randint(num_train_timesteps, [batch_size], (Kind::Int64, x0.device()));
        let noise = Tensor::randn_like(x0);
        let xt = self.q_sample(x0, &t, Some(&noise));
        let pred_noise = self.network.predict_noise(&xt, &t);
        Ok(pred_noise.mse_loss(&noise, Reduction::Mean))
    }
}

fn take(tensors: &mut HashMap<String, Tensor>, name: &str) -> Result<Tensor, DdpmError> {
    tensors.remove(name).ok_or_else(|| DdpmError::Checkpoint(format!("missing tensor {name}")))
}

impl<N: BuildNetwork> DiffusionModule<N> {
    /// Builds a freshly initialised network and its variance schedule.
    pub fn new(config: DiffusionConfig<N::Config>, device: Device) -> Result<Self, DdpmError> {
        let var_scheduler = VarianceScheduler::new(config.var_scheduler, device)?;
        let vs = nn::VarStore::new(device);
        let network = N::build(vs.root() / NETWORK_PATH, &config.network);
        Ok(Self { vs, network, var_scheduler })
    }

    pub fn config(&self) -> DiffusionConfig<N::Config> {
        DiffusionConfig {
            network: self.network.config().clone(),
            var_scheduler: self.var_scheduler.config().clone(),
        }
    }

    /// Writes the hyper-parameters, the network weights and the schedule
    /// buffers to a single file.
    pub fn save<T: AsRef<Path>>(&self, path: T) -> anyhow::Result<()> {
        let path = path.as_ref();
        let hparams = self.config().to_toml_string()?;
        let mut named: Vec<(String, Tensor)> = self
            .vs
            .variables()
            .into_iter()
            .map(|(name, var)| (name, var.to_device(Device::Cpu)))
            .collect();
        let scheduler = &self.var_scheduler;
        named.push((BETAS_KEY.to_string(), scheduler.betas().to_device(Device::Cpu)));
        named.push((ALPHAS_KEY.to_string(), scheduler.alphas().to_device(Device::Cpu)));
        let alphas_cumprod = scheduler.alphas_cumprod().to_device(Device::Cpu);
        named.push((ALPHAS_CUMPROD_KEY.to_string(), alphas_cumprod));
        named.push((HPARAMS_KEY.to_string(), Tensor::from_slice(hparams.as_bytes())));
        Tensor::save_multi(&named, path)?;
        tracing::info!(path = %path.display(), tensors = named.len(), "saved diffusion module");
        Ok(())
    }

    /// Rebuilds a module from a file written by [`DiffusionModule::save`].
    pub fn load<T: AsRef<Path>>(path: T, device: Device) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut tensors: HashMap<String, Tensor> =
            Tensor::load_multi_with_device(path, device)?.into_iter().collect();

        let hparams = take(&mut tensors, HPARAMS_KEY)?;
        let hparams = String::from_utf8(Vec::<u8>::try_from(&hparams.to_device(Device::Cpu))?)
            .map_err(|e| DdpmError::Checkpoint(format!("hparams are not utf-8: {e}")))?;
        let config: DiffusionConfig<N::Config> = toml::from_str(&hparams)
            .map_err(|e| DdpmError::Checkpoint(format!("unreadable hparams: {e}")))?;

        let mut module = Self::new(config.clone(), device)?;
        {
            let _no_grad = tch::no_grad_guard();
            for (name, mut var) in module.vs.variables() {
                let stored = take(&mut tensors, &name)?;
                var.f_copy_(&stored)?;
            }
        }
        let betas = take(&mut tensors, BETAS_KEY)?;
        let alphas = take(&mut tensors, ALPHAS_KEY)?;
        let alphas_cumprod = take(&mut tensors, ALPHAS_CUMPROD_KEY)?;
        if !tensors.is_empty() {
            let mut unexpected: Vec<_> = tensors.into_keys().collect();
            unexpected.sort();
            return Err(DdpmError::Checkpoint(format!("unexpected tensors {unexpected:?}")).into());
        }
        module.var_scheduler =
            VarianceScheduler::from_buffers(config.var_scheduler, betas, alphas, alphas_cumprod)?;
        tracing::info!(path = %path.display(), ?device, "loaded diffusion module");
        Ok(module)
    }
}
