use crate::{
    config::{CoordinatorConfig, DeclaredAxes, DeclaredGroup, ParentSpec, StyleConfig},
    database::Stores,
    prepare::PrepareError,
    template::{BuilderRegistry, JobAxes, MultiGroup},
};
use serde_yaml::Value;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Everything the preparer needs to materialize one candidate job.
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub input: BTreeMap<String, Value>,
    pub parents: Vec<ParentRef>,
    pub resource_glob: Option<String>,
}

/// A previously computed record this job depends on.
#[derive(Debug, Clone)]
pub struct ParentRef {
    pub style: String,
    pub key: String,
}

/// One job template family: how to enumerate its parameter axes, which
/// candidates are structurally valid and how a candidate becomes a concrete
/// job input. Handlers are registered at process start.
pub trait StyleHandler: Send + Sync {
    fn axes(&self, store: &Stores) -> Result<JobAxes, PrepareError>;

    fn validate(&self, candidate: &BTreeMap<String, Value>) -> bool;

    fn build_inputs(
        &self,
        candidate: BTreeMap<String, Value>,
    ) -> Result<ResolvedInput, PrepareError>;
}

#[derive(Default)]
pub struct StyleRegistry {
    handlers: BTreeMap<String, Box<dyn StyleHandler>>,
}

impl StyleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, style: impl Into<String>, handler: Box<dyn StyleHandler>) {
        self.handlers.insert(style.into(), handler);
    }

    pub fn get(&self, style: &str) -> Option<&dyn StyleHandler> {
        self.handlers.get(style).map(Box::as_ref)
    }
}

/// Handler for styles declared entirely in the config file: singular values,
/// inline lockstep groups and builder references, plus a required-key
/// structural predicate. Operator-defined styles need no code.
pub struct DeclaredStyle {
    axes: DeclaredAxes,
    parents: Vec<ParentSpec>,
    resources: Option<String>,
    require: Vec<String>,
    builders: Arc<BuilderRegistry>,
}

impl DeclaredStyle {
    pub fn from_config(config: &StyleConfig, builders: Arc<BuilderRegistry>) -> Self {
        Self {
            axes: config.axes.clone(),
            parents: config.parents.clone(),
            resources: config.resources.clone(),
            require: config.require.clone(),
            builders,
        }
    }
}

impl StyleHandler for DeclaredStyle {
    fn axes(&self, store: &Stores) -> Result<JobAxes, PrepareError> {
        let mut multi = Vec::with_capacity(self.axes.groups.len());

        for group in &self.axes.groups {
            match group {
                DeclaredGroup::Inline { keys, columns } => {
                    multi.push(MultiGroup::new(keys.clone(), columns.clone())?);
                }
                DeclaredGroup::Builder(reference) => {
                    let builder = self
                        .builders
                        .get(&reference.name)
                        .ok_or_else(|| PrepareError::UnknownBuilder(reference.name.clone()))?;

                    multi.push(builder(store, reference)?);
                }
            }
        }

        Ok(JobAxes {
            singular: self.axes.singular.clone(),
            multi,
        })
    }

    fn validate(&self, candidate: &BTreeMap<String, Value>) -> bool {
        for key in &self.require {
            let present = candidate
                .get(key)
                .map(|value| !value.is_null())
                .unwrap_or(false);

            if !present {
                debug!(key = %key, "Candidate lacks required key");

                return false;
            }
        }

        true
    }

    fn build_inputs(
        &self,
        candidate: BTreeMap<String, Value>,
    ) -> Result<ResolvedInput, PrepareError> {
        let mut parents = Vec::with_capacity(self.parents.len());

        for spec in &self.parents {
            let key = candidate
                .get(&spec.field)
                .and_then(Value::as_str)
                .ok_or_else(|| PrepareError::MissingParentField(spec.field.clone()))?;

            parents.push(ParentRef {
                style: spec.style.clone(),
                key: key.to_owned(),
            });
        }

        Ok(ResolvedInput {
            input: candidate,
            parents,
            resource_glob: self.resources.clone(),
        })
    }
}

/// Build the registry for all styles declared in the config file.
pub fn registry_from_config(
    config: &CoordinatorConfig,
    builders: Arc<BuilderRegistry>,
) -> StyleRegistry {
    let mut registry = StyleRegistry::new();

    for (style, style_config) in config.styles.iter() {
        registry.register(
            style.clone(),
            Box::new(DeclaredStyle::from_config(style_config, builders.clone())),
        );
    }

    registry
}
