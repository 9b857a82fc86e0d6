pub mod config;
pub mod diffusion;
pub mod error;
pub mod network;
pub mod schedulers;
pub mod utils;

pub use config::DiffusionConfig;
pub use diffusion::DiffusionModule;
pub use error::DdpmError;
pub use network::{BuildNetwork, NoisePredictor, SimpleNet, SimpleNetConfig};
pub use schedulers::{BetaSchedule, VarianceScheduler, VarianceSchedulerConfig};
