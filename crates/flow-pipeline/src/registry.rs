//! Flow registry.
//!
//! Built once at startup. Start requests name a flow directly; an incoming
//! session `Init` names a protocol, which maps to the responder flow.

use std::collections::HashMap;
use std::sync::Arc;

use crate::logic::FlowLogic;

/// Maps flow names to logic and protocols to responder flows.
#[derive(Default, Clone)]
pub struct FlowRegistry {
    flows: HashMap<String, Arc<dyn FlowLogic>>,
    responders: HashMap<String, String>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a flow under `name`.
    pub fn with_flow(mut self, name: impl Into<String>, logic: impl FlowLogic + 'static) -> Self {
        self.flows.insert(name.into(), Arc::new(logic));
        self
    }

    /// Starts the flow `flow_name` when a session with `protocol` is initiated.
    pub fn with_responder(mut self, protocol: impl Into<String>, flow_name: impl Into<String>) -> Self {
        self.responders.insert(protocol.into(), flow_name.into());
        self
    }

    pub fn flow(&self, name: &str) -> Option<Arc<dyn FlowLogic>> {
        self.flows.get(name).cloned()
    }

    pub fn responder_for(&self, protocol: &str) -> Option<&str> {
        self.responders.get(protocol).map(String::as_str)
    }

    /// Registered flow names, sorted.
    pub fn flow_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.flows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flows", &self.flow_names())
            .field("responders", &self.responders)
            .finish()
    }
}
