//! Integration tests for convolutional networks.
//!
//! `Conv -> Sigmoid -> Flatten -> Linear` under an MSE loss, checked against
//! finite-difference Jacobians of the network output and finite-difference
//! curvature of the loss.

use approx::assert_relative_eq;
use curvprop::operations::{apply_binary, sum_axis};
use curvprop::{
    Conv, ConvOptions, DenseTensor, Extension, Flatten, Linear, MSELoss, Module, Reduction, Sigmoid, Tape, backward,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

struct Case {
    transposed: bool,
    options: ConvOptions,
    /// `[conv weight, conv bias, linear weight, linear bias]`
    params: Vec<DenseTensor<f64>>,
    x: DenseTensor<f64>,
    target: DenseTensor<f64>,
}

impl Case {
    fn build(&self, params: &[DenseTensor<f64>]) -> (Conv, Linear) {
        let conv = Conv::from_tensors(params[0].clone(), Some(params[1].clone()), self.transposed, self.options).unwrap();
        let head = Linear::from_tensors(params[2].clone(), Some(params[3].clone())).unwrap();
        (conv, head)
    }

    fn predict(&self, params: &[DenseTensor<f64>]) -> DenseTensor<f64> {
        let (conv, head) = self.build(params);
        let c = conv.forward(&self.x).unwrap();
        let a = Sigmoid.forward(&c).unwrap();
        let f = Flatten.forward(&a).unwrap();
        head.forward(&f).unwrap()
    }

    /// Results of `extensions` for the conv weight and bias.
    fn sweep(&self, extensions: &[&Extension]) -> Vec<[DenseTensor<f64>; 2]> {
        let (conv, head) = self.build(&self.params);
        assert_eq!(conv.is_transposed(), self.transposed);
        let mse = MSELoss::new(Reduction::Sum);
        let mut tape = Tape::new();
        let input = tape.input(self.x.clone());
        let c = tape.apply(&conv, &input).unwrap();
        let a = tape.apply(&Sigmoid, &c).unwrap();
        let f = tape.apply(&Flatten, &a).unwrap();
        let y = tape.apply(&head, &f).unwrap();
        let loss = tape.loss(&mse, &y, &self.target).unwrap();
        backward(&tape, &loss, extensions).unwrap();
        extensions
            .iter()
            .map(|ext| {
                [
                    conv.weight().saved(ext.savefield()).unwrap(),
                    conv.bias().unwrap().saved(ext.savefield()).unwrap(),
                ]
            })
            .collect()
    }

    fn loss(&self, params: &[DenseTensor<f64>]) -> f64 {
        let pred = self.predict(params);
        pred.data().iter().zip(self.target.data()).map(|(p, t)| (p - t) * (p - t)).sum()
    }

    /// Hessian diagonal of parameter `k` from a five-point stencil.
    fn reference_hessian(&self, k: usize) -> Vec<f64> {
        let eps = 1e-2;
        let center = self.loss(&self.params);
        (0..self.params[k].len())
            .map(|j| {
                let shifted = |steps: f64| {
                    let mut params = self.params.clone();
                    params[k].data_mut()[j] += steps * eps;
                    self.loss(&params)
                };
                (-shifted(2.0) + 16.0 * shifted(1.0) - 30.0 * center + 16.0 * shifted(-1.0) - shifted(-2.0))
                    / (12.0 * eps * eps)
            })
            .collect()
    }

    /// Exact GGN diagonal of parameter `k` for an MSE(sum) loss.
    fn reference_ggn(&self, k: usize) -> Vec<f64> {
        let eps = 1e-6;
        (0..self.params[k].len())
            .map(|j| {
                let mut plus = self.params.clone();
                plus[k].data_mut()[j] += eps;
                let mut minus = self.params.clone();
                minus[k].data_mut()[j] -= eps;
                let jac = apply_binary(&self.predict(&plus), &self.predict(&minus), |a, b| (a - b) / (2.0 * eps))
                    .unwrap();
                2.0 * jac.data().iter().map(|v| v * v).sum::<f64>()
            })
            .collect()
    }
}

fn case(transposed: bool, options: ConvOptions, weight: &[usize], x: &[usize], features: usize) -> Case {
    let mut rng = StdRng::seed_from_u64(31);
    let out_channels = if transposed { weight[1] } else { weight[0] };
    Case {
        transposed,
        options,
        params: vec![
            DenseTensor::randn_with_rng(weight, &mut rng),
            DenseTensor::randn_with_rng(&[out_channels], &mut rng),
            DenseTensor::randn_with_rng(&[2, features], &mut rng),
            DenseTensor::randn_with_rng(&[2], &mut rng),
        ],
        x: DenseTensor::randn(x),
        target: DenseTensor::randn_with_rng(&[x[0], 2], &mut rng),
    }
}

fn check_against_reference(case: &Case) {
    let ggn = Extension::diag_ggn_exact();
    let batch = Extension::batch_diag_ggn_exact();
    let hessian = Extension::diag_hessian();
    let results = case.sweep(&[&ggn, &batch, &hessian]);
    for k in 0..2 {
        let got = &results[0][k];
        assert_eq!(got.shape(), case.params[k].shape());
        for (g, want) in got.data().iter().zip(case.reference_ggn(k)) {
            assert_relative_eq!(*g, want, epsilon = 1e-7, max_relative = 1e-5);
        }
        let summed = sum_axis(&results[1][k], 0).unwrap();
        assert!(summed.max_abs_diff(got).unwrap() < 1e-10);
        for (h, want) in results[2][k].data().iter().zip(case.reference_hessian(k)) {
            assert_relative_eq!(*h, want, epsilon = 1e-5, max_relative = 1e-4);
        }
    }
}

#[test]
fn test_conv2d_strided_padded() {
    let options = ConvOptions {
        stride: 2,
        padding: 1,
        ..ConvOptions::default()
    };
    // [2, 1, 3, 3] -> [2, 2, 2, 2]
    check_against_reference(&case(false, options, &[2, 1, 2, 2], &[2, 1, 3, 3], 8));
}

#[test]
fn test_conv1d_dilated() {
    let options = ConvOptions {
        dilation: 2,
        ..ConvOptions::default()
    };
    // [3, 2, 6] -> [3, 2, 2]
    check_against_reference(&case(false, options, &[2, 2, 3], &[3, 2, 6], 4));
}

#[test]
fn test_conv_transpose1d() {
    let options = ConvOptions {
        stride: 2,
        output_padding: 1,
        ..ConvOptions::default()
    };
    // [2, 1, 3] -> [2, 2, 7]
    check_against_reference(&case(true, options, &[1, 2, 2], &[2, 1, 3], 14));
}

#[test]
fn test_conv3d_strided_padded() {
    let options = ConvOptions {
        stride: 2,
        padding: 1,
        ..ConvOptions::default()
    };
    // [2, 1, 3, 3, 3] -> [2, 2, 2, 2, 2]
    check_against_reference(&case(false, options, &[2, 1, 2, 2, 2], &[2, 1, 3, 3, 3], 16));
}

#[test]
fn test_conv_transpose2d_padded() {
    let options = ConvOptions {
        stride: 2,
        padding: 1,
        output_padding: 1,
        ..ConvOptions::default()
    };
    // [2, 1, 2, 2] -> [2, 2, 3, 3]
    check_against_reference(&case(true, options, &[1, 2, 2, 2], &[2, 1, 2, 2], 18));
}

#[test]
fn test_conv_transpose3d() {
    // [2, 1, 2, 2, 2] -> [2, 2, 3, 3, 3]
    check_against_reference(&case(true, ConvOptions::default(), &[1, 2, 2, 2, 2], &[2, 1, 2, 2, 2], 54));
}

#[test]
fn test_conv_batch_grad_sums_to_gradient() {
    let case = case(false, ConvOptions::default(), &[2, 1, 2, 2], &[3, 1, 3, 3], 8);
    let (conv, head) = case.build(&case.params);
    let mse = MSELoss::new(Reduction::Mean);
    let mut tape = Tape::new();
    let input = tape.input(case.x.clone());
    let c = tape.apply(&conv, &input).unwrap();
    let f = tape.apply(&Flatten, &c).unwrap();
    let y = tape.apply(&head, &f).unwrap();
    let loss = tape.loss(&mse, &y, &case.target).unwrap();
    let batch_grad = Extension::batch_grad();
    backward(&tape, &loss, &[&batch_grad]).unwrap();

    for param in [conv.weight(), conv.bias().unwrap()] {
        let per_sample = param.saved("grad_batch").unwrap();
        assert_eq!(per_sample.dim(0), 3);
        let total = sum_axis(&per_sample, 0).unwrap();
        assert!(total.max_abs_diff(&param.grad().unwrap()).unwrap() < 1e-12);
    }
}
