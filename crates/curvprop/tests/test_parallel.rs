//! Integration tests for parallel linear groups.
//!
//! Covers unite/split round trips, the shared mean-input buffer, and
//! extension results agreeing between a group and its merged form.

use std::rc::Rc;

use curvprop::operations::concat;
use curvprop::{
    DenseTensor, Extension, InputFactor, Linear, MSELoss, Module, ParallelLinear, Reduction, Tape, backward,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn group(sizes: &[usize]) -> ParallelLinear {
    let mut rng = StdRng::seed_from_u64(42);
    let layers = sizes
        .iter()
        .map(|&s| Linear::with_rng(4, s, true, &mut rng))
        .collect();
    ParallelLinear::new(layers).unwrap()
}

/// Record `module` on a fresh tape and run `extensions` against an MSE loss.
fn run(module: &dyn Module, x: &DenseTensor<f64>, target: &DenseTensor<f64>, extensions: &[&Extension]) {
    let mse = MSELoss::new(Reduction::Sum);
    let mut tape = Tape::new();
    let input = tape.input(x.clone());
    let y = tape.apply(module, &input).unwrap();
    let loss = tape.loss(&mse, &y, target).unwrap();
    backward(&tape, &loss, extensions).unwrap();
}

#[test]
fn test_unite_then_split_is_bit_identical() {
    let sizes = [2, 3, 5];
    let original = group(&sizes);
    let x = DenseTensor::from_fn(&[3, 4], |i| (i[0] as f64) - 0.5 * (i[1] as f64));
    run(&original, &x, &DenseTensor::zeros(&[3, 10]), &[]);
    assert!(original.mean_input().is_populated());

    let merged = original.unite().unwrap();
    assert_eq!(merged.layers().len(), 1);
    assert_eq!(merged.out_features(), 10);
    assert!(Rc::ptr_eq(original.mean_input(), merged.mean_input()));
    assert_eq!(merged.forward(&x).unwrap(), original.forward(&x).unwrap());

    let restored = merged.split(&sizes).unwrap();
    assert_eq!(restored.out_features_list(), sizes.to_vec());
    assert!(Rc::ptr_eq(original.mean_input(), restored.mean_input()));
    for (a, b) in original.layers().iter().zip(restored.layers()) {
        assert_eq!(a.weight().value(), b.weight().value());
        assert_eq!(a.bias().unwrap().value(), b.bias().unwrap().value());
        assert!(Rc::ptr_eq(b.mean_input().unwrap(), restored.mean_input()));
    }
}

#[test]
fn test_unpopulated_group_gets_fresh_buffer() {
    let original = group(&[1, 2]);
    let merged = original.unite().unwrap();
    assert!(!Rc::ptr_eq(original.mean_input(), merged.mean_input()));
    assert!(!merged.mean_input().is_populated());
}

#[test]
fn test_group_results_match_merged_layer() {
    let original = group(&[2, 3, 5]);
    let merged = original.unite().unwrap();
    let mut rng = StdRng::seed_from_u64(8);
    let x = DenseTensor::randn_with_rng(&[4, 4], &mut rng);
    let target = DenseTensor::randn_with_rng(&[4, 10], &mut rng);

    let extensions = [Extension::diag_ggn_exact(), Extension::batch_grad(), Extension::kflr()];
    let refs: Vec<&Extension> = extensions.iter().collect();
    run(&original, &x, &target, &refs);
    run(&merged, &x, &target, &refs);

    let whole = &merged.layers()[0];
    for savefield in ["diag_ggn_exact", "grad_batch"] {
        let axis = if savefield == "grad_batch" { 1 } else { 0 };
        let parts: Vec<DenseTensor<f64>> = original
            .layers()
            .iter()
            .map(|l| l.weight().saved(savefield).unwrap())
            .collect();
        let refs: Vec<&DenseTensor<f64>> = parts.iter().collect();
        let stacked = concat(&refs, axis).unwrap();
        let expected = whole.weight().saved(savefield).unwrap();
        assert!(stacked.max_abs_diff(&expected).unwrap() < 1e-12, "{savefield}");
    }

    // each sibling's input factor is the merged layer's; output factors are
    // the diagonal blocks of the merged one
    let merged_factors = whole.weight().saved_factors("kflr").unwrap();
    let mut offset = 0;
    for layer in original.layers() {
        let factors = layer.weight().saved_factors("kflr").unwrap();
        assert_eq!(factors.len(), 2);
        assert!(factors[1].max_abs_diff(&merged_factors[1]).unwrap() < 1e-12);
        let out = layer.out_features();
        for r in 0..out {
            for c in 0..out {
                let got = factors[0].get(&[r, c]).unwrap();
                let want = merged_factors[0].get(&[offset + r, offset + c]).unwrap();
                assert!((got - want).abs() < 1e-12);
            }
        }
        offset += out;
    }
}

#[test]
fn test_mean_input_factor_reads_shared_buffer() {
    let original = group(&[2, 2]);
    let x = DenseTensor::from_fn(&[2, 4], |i| (i[0] * 4 + i[1]) as f64);
    let kfac = Extension::kflr().with_input_factor(InputFactor::MeanInput).unwrap();
    run(&original, &x, &DenseTensor::zeros(&[2, 4]), &[&kfac]);

    // x̄ = [2, 3, 4, 5]
    let mean = original.mean_input().mean_input().unwrap();
    assert_eq!(mean.data(), &[2.0, 3.0, 4.0, 5.0]);
    for layer in original.layers() {
        let factors = layer.weight().saved_factors("kflr").unwrap();
        let a = &factors[1];
        assert_eq!(a.shape(), &[4, 4]);
        for r in 0..4 {
            for c in 0..4 {
                assert_eq!(*a.get(&[r, c]).unwrap(), mean.data()[r] * mean.data()[c]);
            }
        }
    }
}

#[test]
fn test_mean_input_factor_for_group_applied_twice() {
    let mut rng = StdRng::seed_from_u64(5);
    let g = ParallelLinear::new(vec![Linear::with_rng(2, 2, false, &mut rng)]).unwrap();
    let x = DenseTensor::from_vec(vec![1.0, -2.0, 3.0, 0.5, -1.0, 2.0], &[3, 2]).unwrap();
    let mse = MSELoss::new(Reduction::Sum);
    let kflr = Extension::kflr().with_input_factor(InputFactor::MeanInput).unwrap();

    let mut tape = Tape::new();
    let input = tape.input(x.clone());
    let h = tape.apply(&g, &input).unwrap();
    let y = tape.apply(&g, &h).unwrap();
    let loss = tape.loss(&mse, &y, &DenseTensor::zeros(&[3, 2])).unwrap();
    backward(&tape, &loss, &[&kflr]).unwrap();

    // A = x̄₁x̄₁ᵀ + x̄₂x̄₂ᵀ with x₂ the output of the first application
    let means: Vec<Vec<f64>> = [&x, h.value()]
        .iter()
        .map(|t| (0..2).map(|j| (0..3).map(|n| t.get(&[n, j]).unwrap()).sum::<f64>() / 3.0).collect())
        .collect();
    let a = &g.layers()[0].weight().saved_factors("kflr").unwrap()[1];
    for r in 0..2 {
        for c in 0..2 {
            let want = means[0][r] * means[0][c] + means[1][r] * means[1][c];
            assert!((a.get(&[r, c]).unwrap() - want).abs() < 1e-12);
        }
    }
}
