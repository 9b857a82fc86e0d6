use thiserror::Error;

/// Errors raised while building or restoring a diffusion module.
#[derive(Error, Debug)]
pub enum DdpmError {
    /// The beta interpolation mode is not one of `linear` or `quad`.
    #[error("{0} is not implemented.")]
    UnsupportedMode(String),

    #[error("a variance schedule needs at least one training timestep")]
    ZeroTimesteps,

    /// The checkpoint is missing a tensor or carries unreadable hparams.
    #[error("invalid checkpoint: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Tch(#[from] tch::TchError),
}
