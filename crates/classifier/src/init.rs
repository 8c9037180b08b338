//! Deterministic parameter initialisation.
//!
//! Weights are sampled on the host from a seeded [`StdRng`] and then moved to
//! the target device, so replicas built from the same seed on different
//! devices start bit-identical.

use candle_core::{DType, Device, Result, Shape, Tensor, Var};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Supported initialisation policies for dense projections.
#[derive(Debug, Clone, Copy)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Kaiming/He uniform initialisation; `negative_slope = sqrt(5)` gives the
    /// `1/sqrt(fan_in)` bound used by default linear layers.
    KaimingUniform { negative_slope: f64 },
    /// Uniform in `[-bound, bound]`.
    Uniform { bound: f64 },
}

impl LinearInit {
    pub const DEFAULT_LINEAR: LinearInit = LinearInit::KaimingUniform {
        negative_slope: 2.236_067_977_499_79,
    };

    fn bound(&self, fan_in: usize, fan_out: usize) -> f64 {
        let (fan_in, fan_out) = (fan_in.max(1) as f64, fan_out.max(1) as f64);
        match *self {
            LinearInit::XavierUniform => (6.0 / (fan_in + fan_out)).sqrt(),
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0 / (1.0 + negative_slope.powi(2))).sqrt();
                3f64.sqrt() * gain / fan_in.sqrt()
            }
            LinearInit::Uniform { bound } => bound,
        }
    }
}

pub(crate) struct ParamInit {
    rng: StdRng,
    dtype: DType,
    device: Device,
}

impl ParamInit {
    pub(crate) fn new(seed: u64, dtype: DType, device: &Device) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            dtype,
            device: device.clone(),
        }
    }

    pub(crate) fn dtype(&self) -> DType {
        self.dtype
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    /// Samples an `(out_dim, in_dim)` weight matrix.
    pub(crate) fn linear(&mut self, out_dim: usize, in_dim: usize, init: LinearInit) -> Result<Var> {
        let bound = init.bound(in_dim, out_dim);
        self.uniform((out_dim, in_dim), bound)
    }

    pub(crate) fn uniform<S: Into<Shape>>(&mut self, shape: S, bound: f64) -> Result<Var> {
        let shape = shape.into();
        let bound = bound as f32;
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.gen_range(-bound..=bound))
            .collect();
        self.materialize(data, shape)
    }

    pub(crate) fn zeros<S: Into<Shape>>(&self, shape: S) -> Result<Var> {
        Var::from_tensor(&Tensor::zeros(shape, self.dtype, &self.device)?)
    }

    pub(crate) fn ones<S: Into<Shape>>(&self, shape: S) -> Result<Var> {
        Var::from_tensor(&Tensor::ones(shape, self.dtype, &self.device)?)
    }

    fn materialize(&self, data: Vec<f32>, shape: Shape) -> Result<Var> {
        let tensor = Tensor::from_vec(data, shape, &Device::Cpu)?
            .to_dtype(self.dtype)?
            .to_device(&self.device)?;
        Var::from_tensor(&tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_reproduces_weights() -> Result<()> {
        let mut a = ParamInit::new(7, DType::F32, &Device::Cpu);
        let mut b = ParamInit::new(7, DType::F32, &Device::Cpu);
        let wa = a.linear(4, 3, LinearInit::XavierUniform)?;
        let wb = b.linear(4, 3, LinearInit::XavierUniform)?;
        assert_eq!(
            wa.as_tensor().flatten_all()?.to_vec1::<f32>()?,
            wb.as_tensor().flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn kaiming_bound_respects_fan_in() -> Result<()> {
        let mut init = ParamInit::new(0, DType::F32, &Device::Cpu);
        let weight = init.linear(8, 16, LinearInit::DEFAULT_LINEAR)?;
        let bound = 1.0 / 16f32.sqrt() + 1e-6;
        for value in weight.as_tensor().flatten_all()?.to_vec1::<f32>()? {
            assert!(value.abs() <= bound);
        }
        Ok(())
    }
}
