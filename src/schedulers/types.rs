use tch::{Device, Kind, Tensor};

/// A diffusion timestep: a single index shared by the whole batch, or one
/// index per batch element.
#[derive(Debug)]
pub enum Timestep {
    Index(i64),
    Batch(Tensor),
}

impl Timestep {
    /// Returns the timestep as a one-dimensional `Int64` tensor. A plain
    /// index becomes a batch of size one so that it broadcasts over the
    /// samples.
    pub fn to_tensor(&self, device: Device) -> Tensor {
        match self {
            Timestep::Index(t) => Tensor::from_slice(&[*t]).to_device(device),
            Timestep::Batch(t) => {
                let t = if t.dim() == 0 { t.unsqueeze(0) } else { t.shallow_clone() };
                t.to_kind(Kind::Int64).to_device(device)
            }
        }
    }
}

impl From<i64> for Timestep {
    fn from(t: i64) -> Self {
        Timestep::Index(t)
    }
}

impl From<Tensor> for Timestep {
    fn from(t: Tensor) -> Self {
        Timestep::Batch(t)
    }
}

impl From<&Tensor> for Timestep {
    fn from(t: &Tensor) -> Self {
        Timestep::Batch(t.shallow_clone())
    }
}
