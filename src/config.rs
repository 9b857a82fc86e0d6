use std::fs;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::schedulers::VarianceSchedulerConfig;

/// Everything needed to rebuild a diffusion module: the network
/// hyper-parameters and the variance schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig<C> {
    pub network: C,
    pub var_scheduler: VarianceSchedulerConfig,
}

impl<C: DeserializeOwned> DiffusionConfig<C> {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: DiffusionConfig<C> = toml::from_str(&file)?;
        Ok(cfg)
    }
}

impl<C: Serialize> DiffusionConfig<C> {
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string(self)?)
    }
}
