//! String identifiers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Creates an identifier from an existing string.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier of one flow instance. Also the bus partition key.
    FlowId
);

string_id!(
    /// Identifier of a session. Both parties use the same id for the same session.
    SessionId
);

string_id!(
    /// Identifier of an outbox request, stable across resends.
    RequestId
);

string_id!(
    /// Identity of a network participant (for example an X.500 style name).
    Party
);

impl FlowId {
    /// Creates a new random flow ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionId {
    /// Derives the id of the `index`-th session opened by a flow.
    ///
    /// Derivation is deterministic so that replaying an event regenerates the
    /// same id.
    pub fn for_flow(flow_id: &FlowId, index: u64) -> Self {
        Self(format!("{}-session-{}", flow_id, index))
    }
}

impl RequestId {
    /// Derives the id of the `index`-th external request issued by a flow.
    pub fn for_flow(flow_id: &FlowId, index: u64) -> Self {
        Self(format!("{}-request-{}", flow_id, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_are_deterministic() {
        let flow = FlowId::from_string("flow-1");
        assert_eq!(SessionId::for_flow(&flow, 3), SessionId::for_flow(&flow, 3));
        assert_eq!(SessionId::for_flow(&flow, 3).as_str(), "flow-1-session-3");
        assert_eq!(RequestId::for_flow(&flow, 0).as_str(), "flow-1-request-0");
    }

    #[test]
    fn ids_serialize_transparently() {
        let party = Party::from("O=Alice, L=London, C=GB");
        let json = serde_json::to_string(&party).unwrap();
        assert_eq!(json, "\"O=Alice, L=London, C=GB\"");
    }

    #[test]
    fn random_flow_ids_differ() {
        assert_ne!(FlowId::new(), FlowId::new());
    }
}
