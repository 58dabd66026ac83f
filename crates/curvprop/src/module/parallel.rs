//! Groups of sibling linear layers that act as one wider layer.
//!
//! All siblings read the same input and their outputs are concatenated along
//! the feature axis. The group owns one [`MeanInputBuffer`] that every
//! sibling references; [`ParallelLinear::unite`] and
//! [`ParallelLinear::split`] re-partition the output rows while carrying that
//! buffer over by reference.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use super::linear::Linear;
use super::{Module, ModuleGrads, ModuleIo, Parameter, check_input};
use crate::engine::PassId;
use crate::error::BackpropError;
use crate::operations::{concat, narrow, scale_inplace, sum_axis};
use crate::tensor::DenseTensor;

/// Batch mean of a group's input, written at most once per forward pass.
#[derive(Debug, Default)]
pub struct MeanInputBuffer {
    slot: RefCell<Option<Recorded>>,
}

#[derive(Debug)]
struct Recorded {
    pass: PassId,
    source: DenseTensor<f64>,
    mean: DenseTensor<f64>,
}

impl MeanInputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the batch mean of `input` unless this pass already wrote it.
    pub(crate) fn record(&self, pass: PassId, input: &DenseTensor<f64>) -> Result<(), BackpropError> {
        if self.pass() == Some(pass) {
            debug!(pass = pass.index(), "mean input already recorded for this pass");
            return Ok(());
        }
        check_input("mean input", input, 2, None)?;
        let mut mean = sum_axis(input, 0)?;
        scale_inplace(&mut mean, 1.0 / input.dim(0).max(1) as f64);
        *self.slot.borrow_mut() = Some(Recorded {
            pass,
            source: input.clone(),
            mean,
        });
        Ok(())
    }

    /// Most recently recorded mean input `[in_features]`.
    pub fn mean_input(&self) -> Option<DenseTensor<f64>> {
        self.slot.borrow().as_ref().map(|r| r.mean.clone())
    }

    /// Recorded mean if it was taken from `input` during `pass`.
    ///
    /// A group applied more than once per pass only records its first input,
    /// so later applications get `None`.
    pub(crate) fn mean_of(&self, pass: PassId, input: &DenseTensor<f64>) -> Option<DenseTensor<f64>> {
        self.slot
            .borrow()
            .as_ref()
            .filter(|r| r.pass == pass && r.source.shares_storage_with(input))
            .map(|r| r.mean.clone())
    }

    /// Forward pass that produced the current value.
    pub fn pass(&self) -> Option<PassId> {
        self.slot.borrow().as_ref().map(|r| r.pass)
    }

    pub fn is_populated(&self) -> bool {
        self.slot.borrow().is_some()
    }
}

/// Sibling [`Linear`] layers applied to one input, outputs concatenated.
#[derive(Debug)]
pub struct ParallelLinear {
    layers: Vec<Linear>,
    mean_input: Rc<MeanInputBuffer>,
}

impl ParallelLinear {
    /// Group `layers` under a fresh shared mean-input buffer.
    ///
    /// # Errors
    ///
    /// Returns `InconsistentParallelGroup` for an empty group.
    pub fn new(layers: Vec<Linear>) -> Result<Self, BackpropError> {
        if layers.is_empty() {
            return Err(BackpropError::InconsistentParallelGroup {
                reason: "group has no layers".to_string(),
            });
        }
        Ok(Self::assemble(layers, Rc::new(MeanInputBuffer::new())))
    }

    fn assemble(mut layers: Vec<Linear>, buffer: Rc<MeanInputBuffer>) -> Self {
        for layer in &mut layers {
            layer.bind_mean_input(Rc::clone(&buffer));
        }
        Self {
            layers,
            mean_input: buffer,
        }
    }

    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    pub fn in_features(&self) -> usize {
        self.layers[0].in_features()
    }

    pub fn out_features(&self) -> usize {
        self.layers.iter().map(Linear::out_features).sum()
    }

    pub fn out_features_list(&self) -> Vec<usize> {
        self.layers.iter().map(Linear::out_features).collect()
    }

    pub fn mean_input(&self) -> &Rc<MeanInputBuffer> {
        &self.mean_input
    }

    fn validate(&self) -> Result<(), BackpropError> {
        let first = &self.layers[0];
        for (i, layer) in self.layers.iter().enumerate().skip(1) {
            if layer.in_features() != first.in_features() {
                return Err(BackpropError::InconsistentParallelGroup {
                    reason: format!(
                        "layer {i} has in_features {} but layer 0 has {}",
                        layer.in_features(),
                        first.in_features()
                    ),
                });
            }
            if layer.has_bias() != first.has_bias() {
                return Err(BackpropError::InconsistentParallelGroup {
                    reason: format!("layer {i} disagrees with layer 0 on bias presence"),
                });
            }
        }
        Ok(())
    }

    /// The shared buffer to carry into a re-partitioned group.
    fn rebound_buffer(&self) -> Rc<MeanInputBuffer> {
        if self.mean_input.is_populated() {
            Rc::clone(&self.mean_input)
        } else {
            warn!(
                layers = self.layers.len(),
                "parallel group has no recorded mean input; statistics restart after composition"
            );
            Rc::new(MeanInputBuffer::new())
        }
    }

    /// Merge all siblings into a single-layer group with concatenated rows.
    ///
    /// # Errors
    ///
    /// Returns `InconsistentParallelGroup` if siblings disagree on
    /// `in_features` or bias presence.
    pub fn unite(&self) -> Result<ParallelLinear, BackpropError> {
        self.validate()?;
        let weights: Vec<&DenseTensor<f64>> =
            self.layers.iter().map(|l| l.weight().value()).collect();
        let weight = concat(&weights, 0)?;
        let bias = if self.layers[0].has_bias() {
            let biases: Vec<&DenseTensor<f64>> = self
                .layers
                .iter()
                .filter_map(|l| l.bias().map(Parameter::value))
                .collect();
            Some(concat(&biases, 0)?)
        } else {
            None
        };
        let merged = Linear::from_tensors(weight, bias)?;
        Ok(Self::assemble(vec![merged], self.rebound_buffer()))
    }

    /// Re-partition the output rows into siblings of the given sizes.
    ///
    /// # Errors
    ///
    /// Returns `InconsistentParallelGroup` if the sizes do not sum to the
    /// group's output features or contain a zero.
    pub fn split(&self, out_features_list: &[usize]) -> Result<ParallelLinear, BackpropError> {
        let merged = self.unite()?;
        let total = merged.out_features();
        let requested: usize = out_features_list.iter().sum();
        if requested != total || out_features_list.contains(&0) {
            return Err(BackpropError::InconsistentParallelGroup {
                reason: format!(
                    "cannot split {total} output features into {out_features_list:?}"
                ),
            });
        }

        let source = &merged.layers[0];
        let mut layers = Vec::with_capacity(out_features_list.len());
        let mut offset = 0;
        for &size in out_features_list {
            let weight = narrow(source.weight().value(), 0, offset, size)?;
            let bias = source
                .bias()
                .map(|b| narrow(b.value(), 0, offset, size))
                .transpose()?;
            layers.push(Linear::from_tensors(weight, bias)?);
            offset += size;
        }
        Ok(Self::assemble(layers, Rc::clone(&merged.mean_input)))
    }

    /// Row offset of each sibling's block in the concatenated output.
    pub(crate) fn offsets(&self) -> Vec<usize> {
        self.layers
            .iter()
            .scan(0, |acc, l| {
                let start = *acc;
                *acc += l.out_features();
                Some(start)
            })
            .collect()
    }
}

impl Module for ParallelLinear {
    fn name(&self) -> &'static str {
        "ParallelLinear"
    }

    fn forward(&self, input: &DenseTensor<f64>) -> Result<DenseTensor<f64>, BackpropError> {
        let outputs = self
            .layers
            .iter()
            .map(|l| l.forward(input))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&DenseTensor<f64>> = outputs.iter().collect();
        Ok(concat(&refs, 1)?)
    }

    fn backward(
        &self,
        io: &ModuleIo,
        grad_output: &DenseTensor<f64>,
    ) -> Result<ModuleGrads, BackpropError> {
        let mut input: Option<DenseTensor<f64>> = None;
        let mut params = Vec::new();
        for (layer, offset) in self.layers.iter().zip(self.offsets()) {
            let g = narrow(grad_output, 1, offset, layer.out_features())?;
            let grads = layer.backward(io, &g)?;
            input = Some(match input {
                Some(acc) => crate::operations::add(&acc, &grads.input)?,
                None => grads.input,
            });
            params.extend(grads.params);
        }
        Ok(ModuleGrads {
            input: input.unwrap_or_else(|| DenseTensor::zeros(io.input.shape())),
            params,
        })
    }

    fn parameters(&self) -> Vec<(String, &Parameter)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, l)| {
                l.parameters()
                    .into_iter()
                    .map(move |(name, p)| (format!("layers.{i}.{name}"), p))
            })
            .collect()
    }

    fn forward_pre_hook(&self, pass: PassId, input: &DenseTensor<f64>) -> Result<(), BackpropError> {
        for layer in &self.layers {
            layer.forward_pre_hook(pass, input)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Tape;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn group(sizes: &[usize], bias: bool) -> ParallelLinear {
        let mut rng = StdRng::seed_from_u64(11);
        let layers = sizes
            .iter()
            .map(|&s| Linear::with_rng(4, s, bias, &mut rng))
            .collect();
        ParallelLinear::new(layers).unwrap()
    }

    #[test]
    fn test_unite_concatenates_rows() {
        let g = group(&[2, 3], true);
        let merged = g.unite().unwrap();
        assert_eq!(merged.layers().len(), 1);
        let w = merged.layers()[0].weight().value();
        assert_eq!(w.shape(), &[5, 4]);
        assert_eq!(&w.data()[..8], g.layers()[0].weight().value().data());
        assert_eq!(&w.data()[8..], g.layers()[1].weight().value().data());
    }

    #[test]
    fn test_unite_rejects_mismatched_bias() {
        let mut rng = StdRng::seed_from_u64(0);
        let layers = vec![
            Linear::with_rng(4, 2, true, &mut rng),
            Linear::with_rng(4, 2, false, &mut rng),
        ];
        let g = ParallelLinear::new(layers).unwrap();
        assert!(matches!(
            g.unite(),
            Err(BackpropError::InconsistentParallelGroup { .. })
        ));
    }

    #[test]
    fn test_unite_rejects_mismatched_in_features() {
        let mut rng = StdRng::seed_from_u64(0);
        let layers = vec![
            Linear::with_rng(4, 2, true, &mut rng),
            Linear::with_rng(3, 2, true, &mut rng),
        ];
        let g = ParallelLinear::new(layers).unwrap();
        assert!(g.unite().is_err());
        assert!(g.split(&[4]).is_err());
    }

    #[test]
    fn test_split_rejects_bad_partition() {
        let g = group(&[2, 3], false);
        assert!(g.split(&[2, 2]).is_err());
        assert!(g.split(&[5, 0]).is_err());
        assert_eq!(g.split(&[1, 4]).unwrap().out_features_list(), vec![1, 4]);
    }

    #[test]
    fn test_forward_matches_merged() {
        let g = group(&[2, 3, 1], true);
        let x = DenseTensor::from_fn(&[3, 4], |i| (i[0] as f64) - 0.5 * i[1] as f64);
        let y = g.forward(&x).unwrap();
        let y_merged = g.unite().unwrap().forward(&x).unwrap();
        assert_eq!(y.shape(), &[3, 6]);
        assert_eq!(y, y_merged);
    }

    #[test]
    fn test_mean_input_written_once_per_pass() {
        let g = group(&[2, 2], true);
        let x = DenseTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 3.0, 4.0, 5.0, 6.0], &[2, 4]).unwrap();
        let mut tape = Tape::new();
        let v = tape.input(x.clone());
        tape.apply(&g, &v).unwrap();
        let buffer = g.mean_input();
        assert_eq!(buffer.pass(), Some(tape.pass()));
        assert_eq!(buffer.mean_input().unwrap().data(), &[2.0, 3.0, 4.0, 5.0]);

        // A second write in the same pass is ignored.
        buffer.record(tape.pass(), &DenseTensor::zeros(&[1, 4])).unwrap();
        assert_eq!(buffer.mean_input().unwrap().data(), &[2.0, 3.0, 4.0, 5.0]);

        assert!(buffer.mean_of(tape.pass(), &x).is_some());
        assert!(buffer.mean_of(tape.pass(), &DenseTensor::ones(&[2, 4])).is_none());

        // Every sibling references the group buffer.
        for layer in g.layers() {
            assert!(Rc::ptr_eq(layer.mean_input().unwrap(), buffer));
        }
    }

    #[test]
    fn test_unite_rebinds_populated_buffer() {
        let g = group(&[2, 3], true);
        let mut tape = Tape::new();
        let v = tape.input(DenseTensor::ones(&[2, 4]));
        tape.apply(&g, &v).unwrap();

        let merged = g.unite().unwrap();
        assert!(Rc::ptr_eq(merged.mean_input(), g.mean_input()));
        let resplit = merged.split(&[2, 3]).unwrap();
        assert!(Rc::ptr_eq(resplit.mean_input(), g.mean_input()));
    }

    #[test]
    fn test_unite_without_statistics_starts_fresh() {
        let g = group(&[2, 3], true);
        let merged = g.unite().unwrap();
        assert!(!Rc::ptr_eq(merged.mean_input(), g.mean_input()));
        assert!(!merged.mean_input().is_populated());
    }

    #[test]
    fn test_parameter_names() {
        let g = group(&[2, 3], true);
        let names: Vec<String> = g.parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["layers.0.weight", "layers.0.bias", "layers.1.weight", "layers.1.bias"]
        );
    }
}
