//! Registry of flow types, used to rebuild flows from checkpoints and to
//! start the flows that accept sessions opened by other runs.

use std::collections::HashMap;

use flowkeep_types::session::SessionOpened;
use tracing::warn;

use super::error::RunError;
use super::logic::{ErasedFlow, FlowLogic};

type Rebuild =
    Box<dyn Fn(serde_json::Value) -> Result<Box<dyn ErasedFlow>, serde_json::Error> + Send + Sync>;

type Accept = Box<dyn Fn(&SessionOpened) -> Box<dyn ErasedFlow> + Send + Sync>;

/// Maps `FlowLogic::NAME` to a factory rebuilding the flow from its state,
/// and initiating flow names to the flow started on the accepting side.
#[derive(Default)]
pub struct FlowRegistry {
    factories: HashMap<&'static str, Rebuild>,
    initiated: HashMap<String, Accept>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `F`, rebuilt by plain deserialization.
    pub fn register<F: FlowLogic>(&mut self) -> &mut Self {
        self.register_with::<F, _>(|_| {})
    }

    /// Register `F` with a hook run on every rebuilt instance, used to
    /// re-inject `#[serde(skip)]` collaborators.
    pub fn register_with<F, R>(&mut self, rehydrate: R) -> &mut Self
    where
        F: FlowLogic,
        R: Fn(&mut F) + Send + Sync + 'static,
    {
        let rebuild: Rebuild = Box::new(move |state| {
            let mut flow: F = serde_json::from_value(state)?;
            rehydrate(&mut flow);
            Ok(Box::new(flow) as Box<dyn ErasedFlow>)
        });
        if self.factories.insert(F::NAME, rebuild).is_some() {
            warn!(flow = F::NAME, "flow registered twice, keeping the latest factory");
        }
        self
    }

    /// Start an `F` run whenever a run of `initiating_flow` opens a session
    /// towards this engine's party. `F` is registered for restore too.
    pub fn register_initiated<F, A>(
        &mut self,
        initiating_flow: impl Into<String>,
        accept: A,
    ) -> &mut Self
    where
        F: FlowLogic,
        A: Fn(&SessionOpened) -> F + Send + Sync + 'static,
    {
        if !self.contains(F::NAME) {
            self.register::<F>();
        }
        let initiating_flow = initiating_flow.into();
        let accept: Accept =
            Box::new(move |notice| Box::new(accept(notice)) as Box<dyn ErasedFlow>);
        if self.initiated.insert(initiating_flow.clone(), accept).is_some() {
            warn!(
                initiating_flow = %initiating_flow,
                flow = F::NAME,
                "initiated flow registered twice, keeping the latest"
            );
        }
        self
    }

    /// Whether any flow accepts sessions from other runs.
    pub fn accepts_sessions(&self) -> bool {
        !self.initiated.is_empty()
    }

    /// Build the flow accepting the session `notice` announces.
    pub fn accept(&self, notice: &SessionOpened) -> Option<Box<dyn ErasedFlow>> {
        let initiating_flow = notice.initiating_flow.as_deref()?;
        self.initiated.get(initiating_flow).map(|accept| accept(notice))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered flow names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Rebuild a flow from checkpointed state.
    pub fn restore(
        &self,
        name: &str,
        state: serde_json::Value,
    ) -> Result<Box<dyn ErasedFlow>, RunError> {
        let rebuild = self
            .factories
            .get(name)
            .ok_or_else(|| RunError::UnknownFlow(name.to_string()))?;
        rebuild(state).map_err(|source| RunError::Restore {
            flow_name: name.to_string(),
            source,
        })
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut initiated: Vec<&str> = self.initiated.keys().map(String::as_str).collect();
        initiated.sort_unstable();
        f.debug_struct("FlowRegistry")
            .field("flows", &self.names())
            .field("initiated_by", &initiated)
            .finish()
    }
}
