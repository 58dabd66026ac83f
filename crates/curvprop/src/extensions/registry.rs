//! Type-keyed lookup of layer and loss handlers.

use std::any::TypeId;
use std::collections::HashMap;
use std::rc::Rc;

use super::extractor::{ConvExtractor, GenericExtractor, LinearExtractor, ParallelLinearExtractor, ParamExtractor};
use crate::derivatives::{
    ConvDerivatives, CrossEntropyLossDerivatives, Derivatives, DropoutDerivatives, Elementwise, FlattenDerivatives,
    LinearDerivatives, LossDerivatives, MSELossDerivatives, ParallelLinearDerivatives, ReLUDerivatives,
    SigmoidDerivatives, SoftplusDerivatives, TanhDerivatives,
};
use crate::module::{
    Conv, CrossEntropyLoss, Dropout, Flatten, Linear, Loss, MSELoss, Module, ParallelLinear, ReLU, Sigmoid,
    Softplus, Tanh,
};

/// Derivative contract plus parameter extraction for one layer type.
#[derive(Debug, Clone)]
pub(crate) struct Handler {
    pub derivatives: Rc<dyn Derivatives>,
    pub extractor: Rc<dyn ParamExtractor>,
}

/// Handlers resolved once per extension, looked up per visited node.
#[derive(Debug, Clone)]
pub(crate) struct Registry {
    modules: HashMap<TypeId, Handler>,
    losses: HashMap<TypeId, Rc<dyn LossDerivatives>>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self {
            modules: HashMap::new(),
            losses: HashMap::new(),
        };
        registry.insert::<Linear>(LinearDerivatives, LinearExtractor);
        registry.insert::<ParallelLinear>(ParallelLinearDerivatives, ParallelLinearExtractor);
        registry.insert::<Conv>(ConvDerivatives, ConvExtractor);
        registry.insert::<Flatten>(FlattenDerivatives, GenericExtractor);
        registry.insert::<ReLU>(ReLUDerivatives::default(), GenericExtractor);
        registry.insert::<Sigmoid>(SigmoidDerivatives::default(), GenericExtractor);
        registry.insert::<Tanh>(TanhDerivatives::default(), GenericExtractor);
        registry.insert::<Softplus>(SoftplusDerivatives::default(), GenericExtractor);
        registry.insert::<Dropout>(Elementwise(DropoutDerivatives), GenericExtractor);
        registry.insert_loss::<MSELoss>(MSELossDerivatives);
        registry.insert_loss::<CrossEntropyLoss>(CrossEntropyLossDerivatives);
        registry
    }
}

impl Registry {
    pub(crate) fn insert<M: Module>(
        &mut self,
        derivatives: impl Derivatives + 'static,
        extractor: impl ParamExtractor + 'static,
    ) {
        self.modules.insert(
            TypeId::of::<M>(),
            Handler {
                derivatives: Rc::new(derivatives),
                extractor: Rc::new(extractor),
            },
        );
    }

    pub(crate) fn insert_loss<L: Loss>(&mut self, derivatives: impl LossDerivatives + 'static) {
        self.losses.insert(TypeId::of::<L>(), Rc::new(derivatives));
    }

    pub(crate) fn handler(&self, module: &dyn Module) -> Option<&Handler> {
        self.modules.get(&module.as_any().type_id())
    }

    pub(crate) fn loss(&self, loss: &dyn Loss) -> Option<&dyn LossDerivatives> {
        self.losses.get(&loss.as_any().type_id()).map(|d| &**d)
    }
}
