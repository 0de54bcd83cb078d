//! Metric fields
//!
//! A field produces the values of one column (or of a parameter/value
//! column pair) every time its metric is sampled.

use super::Value;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Produces one value per sample
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> Result<Value>;
}

/// Produces one value per parameter, for all parameters at once
///
/// Implementations are free to batch the work, e.g. run a single remote
/// command on every node instead of one command per node.
#[async_trait]
pub trait BatchProbe: Send + Sync {
    async fn probe_all(&self, params: &[Value]) -> Result<Vec<(Value, Value)>>;
}

/// How a field produces its values
#[derive(Clone)]
pub enum FieldKind {
    /// Fixed for the whole experiment, e.g. the cluster size
    Constant(Value),
    /// Evaluated on every sample, e.g. memory of a process
    Variable(Arc<dyn Probe>),
    /// One value per parameter, e.g. one value per cluster node
    Multidimensional {
        param_name: String,
        params: Vec<Value>,
        probe: Arc<dyn BatchProbe>,
    },
}

/// Values produced by one field for one sample
#[derive(Debug, Clone, PartialEq)]
pub enum Collected {
    Scalar(Value),
    Pairs(Vec<(Value, Value)>),
}

/// A named column producer of a metric
#[derive(Clone)]
pub struct Field {
    name: String,
    kind: FieldKind,
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            FieldKind::Constant(value) => format!("Constant({})", value),
            FieldKind::Variable(_) => "Variable".to_string(),
            FieldKind::Multidimensional { param_name, params, .. } => {
                format!("Multidimensional({}, {} params)", param_name, params.len())
            }
        };
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

impl Field {
    pub fn constant(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Constant(value.into()),
        }
    }

    pub fn variable(name: impl Into<String>, probe: Arc<dyn Probe>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Variable(probe),
        }
    }

    /// Variable field backed by a synchronous closure
    pub fn variable_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        Self::variable(name, Arc::new(FnProbe(f)))
    }

    pub fn multidimensional(
        name: impl Into<String>,
        param_name: impl Into<String>,
        params: Vec<Value>,
        probe: Arc<dyn BatchProbe>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Multidimensional {
                param_name: param_name.into(),
                params,
                probe,
            },
        }
    }

    /// Multidimensional field evaluating `f` once per parameter, in order
    pub fn per_param<F>(
        name: impl Into<String>,
        param_name: impl Into<String>,
        params: Vec<Value>,
        f: F,
    ) -> Self
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self::multidimensional(name, param_name, params, Arc::new(PerParamProbe(f)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_multidimensional(&self) -> bool {
        matches!(self.kind, FieldKind::Multidimensional { .. })
    }

    /// CSV columns emitted by this field
    pub fn column_names(&self) -> Vec<&str> {
        match &self.kind {
            FieldKind::Multidimensional { param_name, .. } => {
                vec![param_name.as_str(), self.name.as_str()]
            }
            _ => vec![self.name.as_str()],
        }
    }

    pub async fn collect(&self) -> Result<Collected> {
        match &self.kind {
            FieldKind::Constant(value) => Ok(Collected::Scalar(value.clone())),
            FieldKind::Variable(probe) => probe.probe().await.map(Collected::Scalar),
            FieldKind::Multidimensional { params, probe, .. } => {
                probe.probe_all(params).await.map(Collected::Pairs)
            }
        }
    }
}

struct FnProbe<F>(F);

#[async_trait]
impl<F> Probe for FnProbe<F>
where
    F: Fn() -> Result<Value> + Send + Sync,
{
    async fn probe(&self) -> Result<Value> {
        (self.0)()
    }
}

struct PerParamProbe<F>(F);

#[async_trait]
impl<F> BatchProbe for PerParamProbe<F>
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    async fn probe_all(&self, params: &[Value]) -> Result<Vec<(Value, Value)>> {
        params
            .iter()
            .map(|param| (self.0)(param).map(|value| (param.clone(), value)))
            .collect()
    }
}
