//! Random tensor construction and sampling helpers.

use rand::Rng;
use rand::distr::StandardUniform;
use rand_distr::StandardNormal;

use crate::scalar::Scalar;
use crate::tensor::Tensor;

/// Trait for types that can be randomly sampled from a uniform distribution.
pub trait RandomUniform: Scalar {
    /// Sample a random value from the uniform distribution [0, 1).
    fn sample_uniform<R: Rng>(rng: &mut R) -> Self;
}

impl RandomUniform for f64 {
    fn sample_uniform<R: Rng>(rng: &mut R) -> Self {
        rng.sample(StandardUniform)
    }
}

impl RandomUniform for f32 {
    fn sample_uniform<R: Rng>(rng: &mut R) -> Self {
        rng.sample(StandardUniform)
    }
}

/// Trait for types that can be randomly sampled from a normal distribution.
pub trait RandomNormal: Scalar {
    /// Sample a random value from the standard normal distribution.
    fn sample_normal<R: Rng>(rng: &mut R) -> Self;
}

impl RandomNormal for f64 {
    fn sample_normal<R: Rng>(rng: &mut R) -> Self {
        rng.sample(StandardNormal)
    }
}

impl RandomNormal for f32 {
    fn sample_normal<R: Rng>(rng: &mut R) -> Self {
        rng.sample(StandardNormal)
    }
}

impl<ElT: RandomUniform> Tensor<ElT> {
    /// Create a tensor with uniform random values in [0, 1).
    pub fn random(shape: &[usize]) -> Self {
        Self::random_with_rng(shape, &mut rand::rng())
    }

    /// Create a tensor with uniform random values using a specific RNG.
    ///
    /// # Example
    ///
    /// ```
    /// use curvprop::Tensor;
    /// use rand::SeedableRng;
    /// use rand::rngs::StdRng;
    ///
    /// let a: Tensor<f64> = Tensor::random_with_rng(&[3], &mut StdRng::seed_from_u64(7));
    /// let b: Tensor<f64> = Tensor::random_with_rng(&[3], &mut StdRng::seed_from_u64(7));
    /// assert_eq!(a, b);
    /// ```
    pub fn random_with_rng<R: Rng>(shape: &[usize], rng: &mut R) -> Self {
        let len: usize = shape.iter().product();
        let data = (0..len).map(|_| ElT::sample_uniform(rng)).collect();
        Self::from_parts(data, shape)
    }
}

impl<ElT: RandomNormal> Tensor<ElT> {
    /// Create a tensor with standard normal random values.
    pub fn randn(shape: &[usize]) -> Self {
        Self::randn_with_rng(shape, &mut rand::rng())
    }

    /// Create a tensor with standard normal random values using a specific RNG.
    pub fn randn_with_rng<R: Rng>(shape: &[usize], rng: &mut R) -> Self {
        let len: usize = shape.iter().product();
        let data = (0..len).map(|_| ElT::sample_normal(rng)).collect();
        Self::from_parts(data, shape)
    }
}

/// Uniform values in `[-bound, bound)`, the default initialisation for
/// fully connected and convolution weights with `bound = 1/sqrt(fan_in)`.
pub(crate) fn uniform_symmetric<R: Rng>(
    shape: &[usize],
    bound: f64,
    rng: &mut R,
) -> Tensor<f64> {
    let mut t = Tensor::<f64>::random_with_rng(shape, rng);
    for x in t.data_mut() {
        *x = (2.0 * *x - 1.0) * bound;
    }
    t
}

/// Draw an index from the categorical distribution with weights `probs`.
///
/// `probs` need not be normalised; the last index absorbs rounding.
pub(crate) fn sample_categorical<R: Rng>(probs: &[f64], rng: &mut R) -> usize {
    let total: f64 = probs.iter().sum();
    let mut u = f64::sample_uniform(rng) * total;
    for (i, &p) in probs.iter().enumerate() {
        if u < p {
            return i;
        }
        u -= p;
    }
    probs.len().saturating_sub(1)
}
