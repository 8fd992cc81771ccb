//! Named, coordinate-parameterized providers for node inputs.
//!
//! Network wrapper code registers one binding per symbolic name. Tensor-valued
//! bindings (weights, biases, scalars, intermediates) hand out shared storage so
//! an optimizer can update weights in place and nodes can publish intermediates.
//! Gradient bindings hand out sinks that backward accumulates into. Operation
//! finders compute the qualified id of another node, whose live output becomes
//! the input.
use crate::Tensor;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub type SharedTensor = Arc<RwLock<Tensor>>;

pub fn shared_tensor(tensor: Tensor) -> SharedTensor {
    Arc::new(RwLock::new(tensor))
}

#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("No binding registered under {0}")]
    Missing(String),
    #[error("Binding {name} has no value at layer {layer}, nested layer {nested}")]
    Unresolved {
        name: String,
        layer: usize,
        nested: usize,
    },
    #[error("Binding {name} is a {actual} binding, expected {expected}")]
    CategoryMismatch {
        name: String,
        expected: BindingCategory,
        actual: BindingCategory,
    },
    #[error("Binding {name} is a {actual} binding, expected a tensor binding")]
    NotATensor {
        name: String,
        actual: BindingCategory,
    },
    #[error("Gradient shape mismatch: sink holds {expected:?}, got {actual:?}")]
    GradientShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum BindingCategory {
    Weight,
    Gradient,
    Bias,
    Scalar,
    Intermediate,
    OperationFinder,
}

impl BindingCategory {
    pub fn is_tensor(&self) -> bool {
        matches!(
            self,
            BindingCategory::Weight
                | BindingCategory::Bias
                | BindingCategory::Scalar
                | BindingCategory::Intermediate
        )
    }
}

/// Accumulation target for the gradient of a bound input.
#[derive(Debug, Clone, Default)]
pub struct GradientSink(Arc<Mutex<Option<Tensor>>>);

impl GradientSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `grad` into the sink; an empty sink takes `grad` as is.
    pub fn accumulate(&self, grad: &Tensor) -> Result<(), BindingError> {
        let mut guard = self.0.lock();
        match guard.as_mut() {
            Some(existing) => {
                if existing.shape() != grad.shape() {
                    return Err(BindingError::GradientShapeMismatch {
                        expected: existing.shape().to_vec(),
                        actual: grad.shape().to_vec(),
                    });
                }
                *existing += grad;
            }
            None => *guard = Some(grad.clone()),
        }
        Ok(())
    }

    pub fn get(&self) -> Option<Tensor> {
        self.0.lock().clone()
    }

    pub fn take(&self) -> Option<Tensor> {
        self.0.lock().take()
    }

    pub fn clear(&self) {
        *self.0.lock() = None;
    }

    pub fn ptr_eq(&self, other: &GradientSink) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

pub type TensorResolver = Arc<dyn Fn(usize, usize) -> Option<SharedTensor> + Send + Sync>;
pub type GradientResolver = Arc<dyn Fn(usize, usize) -> Option<GradientSink> + Send + Sync>;
pub type OperationFinder = Arc<dyn Fn(usize, usize) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub enum BindingResolver {
    Tensor(TensorResolver),
    Gradient(GradientResolver),
    OperationFinder(OperationFinder),
}

#[derive(Clone)]
pub struct Binding {
    pub name: String,
    pub category: BindingCategory,
    pub resolver: BindingResolver,
}

impl core::fmt::Debug for Binding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    bindings: HashMap<String, Binding>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, binding: Binding) -> &mut Self {
        if let Some(previous) = self.bindings.insert(binding.name.clone(), binding) {
            log::debug!(
                "Binding {} ({}) replaced",
                previous.name,
                previous.category
            );
        }
        self
    }

    fn register_tensor(
        &mut self,
        name: &str,
        category: BindingCategory,
        resolver: impl Fn(usize, usize) -> Option<SharedTensor> + Send + Sync + 'static,
    ) -> &mut Self {
        self.insert(Binding {
            name: name.to_string(),
            category,
            resolver: BindingResolver::Tensor(Arc::new(resolver)),
        })
    }

    pub fn register_weight(
        &mut self,
        name: &str,
        resolver: impl Fn(usize, usize) -> Option<SharedTensor> + Send + Sync + 'static,
    ) -> &mut Self {
        self.register_tensor(name, BindingCategory::Weight, resolver)
    }

    pub fn register_bias(
        &mut self,
        name: &str,
        resolver: impl Fn(usize, usize) -> Option<SharedTensor> + Send + Sync + 'static,
    ) -> &mut Self {
        self.register_tensor(name, BindingCategory::Bias, resolver)
    }

    pub fn register_scalar(
        &mut self,
        name: &str,
        resolver: impl Fn(usize, usize) -> Option<SharedTensor> + Send + Sync + 'static,
    ) -> &mut Self {
        self.register_tensor(name, BindingCategory::Scalar, resolver)
    }

    pub fn register_intermediate(
        &mut self,
        name: &str,
        resolver: impl Fn(usize, usize) -> Option<SharedTensor> + Send + Sync + 'static,
    ) -> &mut Self {
        self.register_tensor(name, BindingCategory::Intermediate, resolver)
    }

    pub fn register_gradient(
        &mut self,
        name: &str,
        resolver: impl Fn(usize, usize) -> Option<GradientSink> + Send + Sync + 'static,
    ) -> &mut Self {
        self.insert(Binding {
            name: name.to_string(),
            category: BindingCategory::Gradient,
            resolver: BindingResolver::Gradient(Arc::new(resolver)),
        })
    }

    /// `finder(layer, nested)` returns a qualified node id such as `"hidden_0_0"`.
    pub fn register_operation_finder(
        &mut self,
        name: &str,
        finder: impl Fn(usize, usize) -> Option<String> + Send + Sync + 'static,
    ) -> &mut Self {
        self.insert(Binding {
            name: name.to_string(),
            category: BindingCategory::OperationFinder,
            resolver: BindingResolver::OperationFinder(Arc::new(finder)),
        })
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn category(&self, name: &str) -> Option<BindingCategory> {
        self.bindings.get(name).map(|b| b.category)
    }

    fn get_or_missing(&self, name: &str) -> Result<&Binding, BindingError> {
        self.bindings
            .get(name)
            .ok_or_else(|| BindingError::Missing(name.to_string()))
    }

    pub fn resolve_tensor(
        &self,
        name: &str,
        layer: usize,
        nested: usize,
    ) -> Result<SharedTensor, BindingError> {
        let binding = self.get_or_missing(name)?;
        match &binding.resolver {
            BindingResolver::Tensor(resolver) => {
                resolver(layer, nested).ok_or_else(|| BindingError::Unresolved {
                    name: name.to_string(),
                    layer,
                    nested,
                })
            }
            _ => Err(BindingError::NotATensor {
                name: name.to_string(),
                actual: binding.category,
            }),
        }
    }

    pub fn resolve_gradient(
        &self,
        name: &str,
        layer: usize,
        nested: usize,
    ) -> Result<GradientSink, BindingError> {
        let binding = self.get_or_missing(name)?;
        match &binding.resolver {
            BindingResolver::Gradient(resolver) => {
                resolver(layer, nested).ok_or_else(|| BindingError::Unresolved {
                    name: name.to_string(),
                    layer,
                    nested,
                })
            }
            _ => Err(BindingError::CategoryMismatch {
                name: name.to_string(),
                expected: BindingCategory::Gradient,
                actual: binding.category,
            }),
        }
    }

    pub fn find_operation(
        &self,
        name: &str,
        layer: usize,
        nested: usize,
    ) -> Result<String, BindingError> {
        let binding = self.get_or_missing(name)?;
        match &binding.resolver {
            BindingResolver::OperationFinder(finder) => {
                finder(layer, nested).ok_or_else(|| BindingError::Unresolved {
                    name: name.to_string(),
                    layer,
                    nested,
                })
            }
            _ => Err(BindingError::CategoryMismatch {
                name: name.to_string(),
                expected: BindingCategory::OperationFinder,
                actual: binding.category,
            }),
        }
    }
}
