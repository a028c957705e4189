//! Dense parameter arrays and whole-model weight sets.

use super::FederatedError;

/// A dense, row-major `f32` array with an explicit shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Ordered sequence of parameter arrays making up one model.
pub type Weights = Vec<Tensor>;

impl Tensor {
    /// Create a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, FederatedError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(FederatedError::model_state(format!(
                "shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Zero-filled tensor of the given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; len],
        }
    }

    /// One-dimensional tensor.
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Multiply every element by `factor`.
    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.data {
            *v *= factor;
        }
    }

    /// `self += factor * other`. Shapes must already match.
    pub fn scaled_add(&mut self, factor: f32, other: &Tensor) {
        debug_assert_eq!(self.shape, other.shape);
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a += factor * b;
        }
    }
}

/// Check that two weight sets have the same length and per-index shapes.
pub fn check_same_shape(expected: &[Tensor], actual: &[Tensor]) -> Result<(), FederatedError> {
    if expected.len() != actual.len() {
        return Err(FederatedError::model_state(format!(
            "expected {} weight arrays, got {}",
            expected.len(),
            actual.len()
        )));
    }
    for (i, (e, a)) in expected.iter().zip(actual).enumerate() {
        if e.shape() != a.shape() {
            return Err(FederatedError::model_state(format!(
                "weight array {} has shape {:?}, expected {:?}",
                i,
                a.shape(),
                e.shape()
            )));
        }
    }
    Ok(())
}
