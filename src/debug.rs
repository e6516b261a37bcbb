use burn::{
    prelude::Backend,
    tensor::{PrintOptions, Tensor, set_print_options},
};
use num::Float;

use crate::error::RFCNError;

/// Fails with `NonFinite(what)` if `tensor` holds a NaN or an infinity.
pub fn ensure_finite<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    what: &'static str,
) -> Result<(), RFCNError> {
    let values = tensor.to_data().convert::<f32>().to_vec::<f32>()?;

    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(RFCNError::NonFinite(what))
    }
}

pub fn set_tensor_dbg_precision(prec: usize) {
    let po = PrintOptions {
        precision: Option::Some(prec),
        edge_items: 10,
        ..Default::default()
    };

    set_print_options(po);
}

// Helper function for comparing floats
pub fn assert_approx_eq<F>(a: &F, b: &F, epsilon: F)
where
    F: Float + std::fmt::Display + std::fmt::Debug,
{
    assert!(
        (*a - *b).abs() <= epsilon,
        "Values differ: {:?} vs {:?} (tolerance: {:?})",
        *a,
        *b,
        epsilon
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    #[test]
    fn test_ensure_finite() {
        let device = &NdArrayDevice::default();

        let fine = Tensor::<B, 2>::from_data([[1.0, -2.0], [0.0, 3.5]], device);
        assert!(ensure_finite(&fine, "fine").is_ok());

        let nan = Tensor::<B, 1>::from_data([1.0, f32::NAN], device);
        assert!(matches!(
            ensure_finite(&nan, "nan"),
            Err(RFCNError::NonFinite("nan"))
        ));

        let inf = Tensor::<B, 1>::from_data([f32::INFINITY], device);
        assert!(ensure_finite(&inf, "inf").is_err());
    }
}
