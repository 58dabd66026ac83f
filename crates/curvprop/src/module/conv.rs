//! Convolutions over 1, 2 or 3 spatial dimensions, regular or transposed.

use std::any::Any;

use super::{Module, ModuleGrads, ModuleIo, Parameter, check_input};
use crate::error::BackpropError;
use crate::operations::{matmul, permutedims, sum_leading, sum_trailing};
use crate::random::uniform_symmetric;
use crate::tensor::DenseTensor;
use crate::unfold::{ConvGeometry, UnfoldMap};

/// Stride, padding, dilation and (transposed only) output padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvOptions {
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub output_padding: usize,
}

impl Default for ConvOptions {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
            dilation: 1,
            output_padding: 0,
        }
    }
}

/// Convolution layer with `groups = 1`.
///
/// Weight layout is `[C_out, C_in, *kernel]` for regular and
/// `[C_in, C_out, *kernel]` for transposed convolutions.
#[derive(Debug)]
pub struct Conv {
    transposed: bool,
    in_channels: usize,
    out_channels: usize,
    kernel_size: Vec<usize>,
    options: ConvOptions,
    weight: Parameter,
    bias: Option<Parameter>,
}

impl Conv {
    /// Randomly initialised convolution; the rank is `kernel_size.len()`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for a rank outside 1..=3, a zero-sized
    /// kernel, zero stride/dilation, or an output padding that is not smaller
    /// than stride or dilation.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: &[usize],
        transposed: bool,
        options: ConvOptions,
        bias: bool,
    ) -> Result<Self, BackpropError> {
        let rng = &mut rand::rng();
        let k: usize = kernel_size.iter().product();
        let fan_in = (if transposed { out_channels } else { in_channels }) * k;
        let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
        let mut shape = if transposed {
            vec![in_channels, out_channels]
        } else {
            vec![out_channels, in_channels]
        };
        shape.extend_from_slice(kernel_size);
        let weight = uniform_symmetric(&shape, bound, rng);
        let bias = bias.then(|| uniform_symmetric(&[out_channels], bound, rng));
        Self::from_tensors(weight, bias, transposed, options)
    }

    pub fn conv1d(cin: usize, cout: usize, k: usize, options: ConvOptions, bias: bool) -> Result<Self, BackpropError> {
        Self::new(cin, cout, &[k], false, options, bias)
    }

    pub fn conv2d(cin: usize, cout: usize, k: [usize; 2], options: ConvOptions, bias: bool) -> Result<Self, BackpropError> {
        Self::new(cin, cout, &k, false, options, bias)
    }

    pub fn conv3d(cin: usize, cout: usize, k: [usize; 3], options: ConvOptions, bias: bool) -> Result<Self, BackpropError> {
        Self::new(cin, cout, &k, false, options, bias)
    }

    pub fn conv_transpose1d(cin: usize, cout: usize, k: usize, options: ConvOptions, bias: bool) -> Result<Self, BackpropError> {
        Self::new(cin, cout, &[k], true, options, bias)
    }

    pub fn conv_transpose2d(cin: usize, cout: usize, k: [usize; 2], options: ConvOptions, bias: bool) -> Result<Self, BackpropError> {
        Self::new(cin, cout, &k, true, options, bias)
    }

    pub fn conv_transpose3d(cin: usize, cout: usize, k: [usize; 3], options: ConvOptions, bias: bool) -> Result<Self, BackpropError> {
        Self::new(cin, cout, &k, true, options, bias)
    }

    /// Convolution with explicit weight and bias tensors.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Conv::new`], plus `ShapeMismatch` for a bias
    /// whose length is not the number of output channels.
    pub fn from_tensors(
        weight: DenseTensor<f64>,
        bias: Option<DenseTensor<f64>>,
        transposed: bool,
        options: ConvOptions,
    ) -> Result<Self, BackpropError> {
        let rank = weight.ndim().saturating_sub(2);
        if !(1..=3).contains(&rank) {
            return Err(BackpropError::InvalidConfiguration(format!(
                "convolution weight must have 3 to 5 axes, got shape {:?}",
                weight.shape()
            )));
        }
        let kernel_size = weight.shape()[2..].to_vec();
        if kernel_size.contains(&0) || options.stride == 0 || options.dilation == 0 {
            return Err(BackpropError::InvalidConfiguration(format!(
                "invalid convolution kernel {kernel_size:?} / options {options:?}"
            )));
        }
        if options.output_padding > 0
            && (!transposed || options.output_padding >= options.stride.max(options.dilation))
        {
            return Err(BackpropError::InvalidConfiguration(format!(
                "output_padding {} requires a transposed convolution with larger stride or dilation",
                options.output_padding
            )));
        }
        let (in_channels, out_channels) = if transposed {
            (weight.dim(0), weight.dim(1))
        } else {
            (weight.dim(1), weight.dim(0))
        };
        if let Some(b) = &bias
            && b.shape() != [out_channels]
        {
            return Err(BackpropError::ShapeMismatch {
                context: "Conv bias",
                expected: vec![out_channels],
                actual: b.shape().to_vec(),
            });
        }
        Ok(Self {
            transposed,
            in_channels,
            out_channels,
            kernel_size,
            options,
            weight: Parameter::new(weight),
            bias: bias.map(Parameter::new),
        })
    }

    pub fn rank(&self) -> usize {
        self.kernel_size.len()
    }

    pub fn is_transposed(&self) -> bool {
        self.transposed
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel_size(&self) -> &[usize] {
        &self.kernel_size
    }

    pub fn options(&self) -> ConvOptions {
        self.options
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    fn geometry(&self) -> ConvGeometry {
        ConvGeometry {
            stride: self.options.stride,
            padding: self.options.padding,
            dilation: self.options.dilation,
            output_padding: self.options.output_padding,
            transposed: self.transposed,
        }
    }

    fn kernel_numel(&self) -> usize {
        self.kernel_size.iter().product()
    }

    /// Gather pattern for an input `[N, C_in, *spatial]`.
    pub(crate) fn unfold_map(&self, input: &DenseTensor<f64>) -> Result<UnfoldMap, BackpropError> {
        check_input("Conv input", input, self.rank() + 2, Some(self.in_channels))?;
        UnfoldMap::new(&self.geometry(), self.in_channels, &self.kernel_size, &input.shape()[2..])
    }

    /// Weight as the `[C_out, C_in·K]` matrix acting on patch matrices.
    pub(crate) fn weight_matrix(&self) -> Result<DenseTensor<f64>, BackpropError> {
        let k = self.kernel_numel();
        let w = self.weight.value();
        if self.transposed {
            let w = w.reshape(&[self.in_channels, self.out_channels, k])?;
            Ok(permutedims(&w, &[1, 0, 2])?.reshape(&[self.out_channels, self.in_channels * k])?)
        } else {
            Ok(w.reshape(&[self.out_channels, self.in_channels * k])?)
        }
    }

    /// Convert `[lead.., C_out, C_in·K]` into `[lead.., *weight_shape]`.
    pub(crate) fn matrix_to_weight_layout(
        &self,
        t: &DenseTensor<f64>,
        lead: &[usize],
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let mut shape = lead.to_vec();
        shape.extend_from_slice(self.weight.shape());
        if !self.transposed {
            return Ok(t.reshape(&shape)?);
        }
        let mut split = lead.to_vec();
        split.extend([self.out_channels, self.in_channels, self.kernel_numel()]);
        let mut perm: Vec<usize> = (0..split.len()).collect();
        perm.swap(lead.len(), lead.len() + 1);
        Ok(permutedims(&t.reshape(&split)?, &perm)?.reshape(&shape)?)
    }

    /// Convert `[lead.., *weight_shape]` into `[lead.., C_out, C_in·K]`.
    pub(crate) fn weight_layout_to_matrix(
        &self,
        t: &DenseTensor<f64>,
        lead: &[usize],
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let k = self.kernel_numel();
        let mut shape = lead.to_vec();
        shape.extend([self.out_channels, self.in_channels * k]);
        if !self.transposed {
            return Ok(t.reshape(&shape)?);
        }
        let mut split = lead.to_vec();
        split.extend([self.in_channels, self.out_channels, k]);
        let mut perm: Vec<usize> = (0..split.len()).collect();
        perm.swap(lead.len(), lead.len() + 1);
        Ok(permutedims(&t.reshape(&split)?, &perm)?.reshape(&shape)?)
    }

    /// `W' · U[m]` for patch matrices `[M, C_in·K, P]`, giving `[M, C_out, P]`.
    pub(crate) fn apply_weight(
        &self,
        weight: &DenseTensor<f64>,
        patches: &DenseTensor<f64>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let (m, rows, p) = (patches.dim(0), patches.dim(1), patches.dim(2));
        let flat = permutedims(patches, &[1, 0, 2])?.reshape(&[rows, m * p])?;
        let y = matmul(weight, &flat, false, false)?.reshape(&[self.out_channels, m, p])?;
        Ok(permutedims(&y, &[1, 0, 2])?)
    }

    /// `W'ᵀ · G[m]` for `[M, C_out, P]`, giving patch matrices `[M, C_in·K, P]`.
    pub(crate) fn apply_weight_t(
        &self,
        weight: &DenseTensor<f64>,
        grads: &DenseTensor<f64>,
    ) -> Result<DenseTensor<f64>, BackpropError> {
        let (m, cout, p) = (grads.dim(0), grads.dim(1), grads.dim(2));
        let flat = permutedims(grads, &[1, 0, 2])?.reshape(&[cout, m * p])?;
        let u = matmul(weight, &flat, true, false)?.reshape(&[weight.dim(1), m, p])?;
        Ok(permutedims(&u, &[1, 0, 2])?)
    }
}

impl Module for Conv {
    fn name(&self) -> &'static str {
        "Conv"
    }

    fn forward(&self, input: &DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError> {
        let map = self.unfold_map(input)?;
        let patches = map.unfold(input)?;
        let mut y = self.apply_weight(&self.weight_matrix()?, &patches)?;
        if let Some(b) = &self.bias {
            let p = map.positions();
            for (i, chunk) in y.data_mut().chunks_mut(p.max(1)).enumerate() {
                let bias = b.value().data()[i % self.out_channels];
                for v in chunk {
                    *v += bias;
                }
            }
        }
        let mut shape = vec![input.dim(0), self.out_channels];
        shape.extend_from_slice(map.out_spatial());
        Ok(y.reshape(&shape)?)
    }

    fn backward(
        &self,
        io: &ModuleIo,
        grad_output: &DenseTensor<f64>,
    ) -> Result<ModuleGrads, BackpropError> {
        let map = self.unfold_map(&io.input)?;
        let n = io.input.dim(0);
        let g = grad_output.reshape(&[n, self.out_channels, map.positions()])?;
        let weight = self.weight_matrix()?;

        let input = map.fold(&self.apply_weight_t(&weight, &g)?)?;
        let patches = map.unfold(&io.input)?;
        let per_sample = crate::operations::batched_matmul(&g, &patches, false, true)?;
        let grad_w = self.matrix_to_weight_layout(&sum_leading(&per_sample, 1)?, &[])?;

        let mut params = vec![(self.weight.id(), grad_w)];
        if let Some(b) = &self.bias {
            params.push((b.id(), sum_leading(&sum_trailing(&g, 2)?, 1)?));
        }
        Ok(ModuleGrads { input, params })
    }

    fn parameters(&self) -> Vec<(String, &Parameter)> {
        let mut params = vec![("weight".to_string(), &self.weight)];
        if let Some(b) = &self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
