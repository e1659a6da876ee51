//! Cascade document model: parsing, validation, and the typed configuration
//! surface the rest of the engine consumes.

mod candidates;
mod context;
mod document;
mod validate;
mod wards;

pub use candidates::{
    CandidatesConfig, CandidatesMode, CostNormalization, EvaluatorSpec, FactorSpec, LlmEvaluator,
    ModelStrategy, ModelsSpec, MutationMode, ParetoPolicy, ReforgeConfig,
};
pub use context::{
    AnchorSlice, AnchorsConfig, BudgetStrategy, CalloutConfig, CellAnchor, ContextConfig,
    ContextSource, ContextSourceSpec, IncludeKind, IntraContextConfig, SelectionConfig,
    SelectionStrategy, TokenBudgetConfig,
};
pub use document::{
    AsyncCascadeSpec, AsyncTrigger, AudibleConfig, AutoFixConfig, Backoff, Cascade, CascadeError,
    Cell, CellVariant, DecisionPointsConfig, DeterministicCell, ForEachRowConfig, LlmCell,
    OnErrorConfig, OnErrorSpec, RetryConfig, RulesConfig, ScreenCell, SubCascadeSpec,
};
pub use wards::{
    AmbiguousPolyglotBlock, PolyglotBlock, PolyglotLanguage, ValidatorCall, ValidatorSpec,
    WardMode, WardSpec, WardsConfig,
};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Resolves cascade refs (`sub_cascades`, `async_cascades`, validator
/// cascades) to loaded documents.
///
/// Holds in-memory registrations plus an optional root directory searched
/// for `<ref>.yaml` / `<ref>.yml` / `<ref>.json`.
#[derive(Default)]
pub struct CascadeLibrary {
    registered: RwLock<FxHashMap<String, Arc<Cascade>>>,
    root: Option<PathBuf>,
}

impl CascadeLibrary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            registered: RwLock::new(FxHashMap::default()),
            root: Some(root.into()),
        }
    }

    /// Register an in-memory cascade under its `cascade_id`.
    pub fn register(&self, cascade: Cascade) -> Arc<Cascade> {
        let cascade = Arc::new(cascade);
        self.registered
            .write()
            .insert(cascade.cascade_id.clone(), Arc::clone(&cascade));
        cascade
    }

    /// Resolve a ref: registered id first, then disk under the root.
    pub fn get(&self, cascade_ref: &str) -> Result<Arc<Cascade>, CascadeError> {
        if let Some(found) = self.registered.read().get(cascade_ref) {
            return Ok(Arc::clone(found));
        }
        if let Some(root) = &self.root {
            for extension in ["yaml", "yml", "json"] {
                let candidate = root.join(format!("{cascade_ref}.{extension}"));
                if candidate.is_file() {
                    let cascade = Arc::new(Cascade::from_file(&candidate)?);
                    self.registered
                        .write()
                        .insert(cascade_ref.to_string(), Arc::clone(&cascade));
                    return Ok(cascade);
                }
            }
        }
        Err(CascadeError::UnknownRef {
            cascade_ref: cascade_ref.to_string(),
        })
    }

    /// True when the ref resolves without loading it.
    #[must_use]
    pub fn contains(&self, cascade_ref: &str) -> bool {
        self.get(cascade_ref).is_ok()
    }
}
