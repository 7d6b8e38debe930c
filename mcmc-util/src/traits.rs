use nalgebra::DVector;

/// A parameter that can be moved along an ellipse
///
/// `f' <- f cos θ + ν sin θ`
/// where `f` is a current value
///       `ν` is sampled from a zero-mean Gaussian prior
pub trait EssParam: Clone {
    fn linear_combine(&self, a: f32, other: &Self, b: f32) -> Self;
}

impl EssParam for DVector<f32> {
    fn linear_combine(&self, a: f32, other: &Self, b: f32) -> Self {
        self * a + other * b
    }
}
