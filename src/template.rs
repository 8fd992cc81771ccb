use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Operation id {0} is declared more than once")]
    DuplicateOperation(String),
    #[error("Operation {op} lists {targets} gradient targets for {inputs} inputs")]
    GradientTargetCount {
        op: String,
        inputs: usize,
        targets: usize,
    },
    #[error("Repetition counts must be at least 1 (layers {layers}, nested layers {nested_layers})")]
    EmptyRepetition { layers: usize, nested_layers: usize },
}

/// How many times an operation is instantiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepetitionScope {
    #[default]
    Global,
    PerLayer,
    PerNestedLayer,
}

impl RepetitionScope {
    pub fn depth(&self) -> usize {
        match self {
            RepetitionScope::Global => 0,
            RepetitionScope::PerLayer => 1,
            RepetitionScope::PerNestedLayer => 2,
        }
    }

    /// Coordinate of the instance of an op with this scope that a consumer at
    /// `(layer, nested)` refers to.
    pub fn project(&self, layer: usize, nested: usize) -> (usize, usize) {
        match self {
            RepetitionScope::Global => (0, 0),
            RepetitionScope::PerLayer => (layer, 0),
            RepetitionScope::PerNestedLayer => (layer, nested),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSpec {
    /// A template operation id or a binding name.
    Name(String),
    /// Every instance of a finer-scoped operation inside the consumer's coordinate,
    /// stacked along a new leading axis.
    Gather { gather: String },
}

impl From<&str> for InputSpec {
    fn from(value: &str) -> Self {
        InputSpec::Name(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub scope: RepetitionScope,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    /// Intermediate binding that receives a copy of every output.
    #[serde(default)]
    pub result_to: Option<String>,
    /// Per input, the gradient binding that collects the gradient of a bound input.
    #[serde(default)]
    pub gradient_result_to: Vec<Option<String>>,
}

impl OperationSpec {
    pub fn new(id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            scope: RepetitionScope::Global,
            inputs: vec![],
            result_to: None,
            gradient_result_to: vec![],
        }
    }

    pub fn scope(mut self, scope: RepetitionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn input(mut self, input: impl Into<InputSpec>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn gather(mut self, op: &str) -> Self {
        self.inputs.push(InputSpec::Gather {
            gather: op.to_string(),
        });
        self
    }

    pub fn result_to(mut self, name: &str) -> Self {
        self.result_to = Some(name.to_string());
        self
    }

    pub fn gradient_result_to(mut self, targets: &[Option<&str>]) -> Self {
        self.gradient_result_to = targets.iter().map(|t| t.map(str::to_string)).collect();
        self
    }

    pub fn gradient_target(&self, input_index: usize) -> Option<&str> {
        self.gradient_result_to
            .get(input_index)
            .and_then(|t| t.as_deref())
    }
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectureTemplate {
    #[serde(default = "one")]
    pub layers: usize,
    #[serde(default = "one")]
    pub nested_layers: usize,
    pub operations: Vec<OperationSpec>,
}

impl ArchitectureTemplate {
    pub fn new(layers: usize, nested_layers: usize) -> Self {
        Self {
            layers,
            nested_layers,
            operations: vec![],
        }
    }

    pub fn with_operation(mut self, op: OperationSpec) -> Self {
        self.operations.push(op);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, TemplateError> {
        let template: Self = serde_json::from_str(json)?;
        template.validate()?;
        Ok(template)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String, TemplateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.layers == 0 || self.nested_layers == 0 {
            return Err(TemplateError::EmptyRepetition {
                layers: self.layers,
                nested_layers: self.nested_layers,
            });
        }
        let mut seen = HashSet::new();
        for op in &self.operations {
            if !seen.insert(op.id.as_str()) {
                return Err(TemplateError::DuplicateOperation(op.id.clone()));
            }
            if op.gradient_result_to.len() > op.inputs.len() {
                return Err(TemplateError::GradientTargetCount {
                    op: op.id.clone(),
                    inputs: op.inputs.len(),
                    targets: op.gradient_result_to.len(),
                });
            }
        }
        Ok(())
    }

    pub fn operation(&self, id: &str) -> Option<&OperationSpec> {
        self.operations.iter().find(|op| op.id == id)
    }
}
