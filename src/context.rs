use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Merchant,
    /// Scheduled reconciler sweeps.
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Merchant => "merchant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn user(id: Ulid) -> Self {
        Self { id, role: Role::User }
    }

    pub fn merchant(id: Ulid) -> Self {
        Self { id, role: Role::Merchant }
    }

    pub fn system() -> Self {
        Self { id: Ulid::nil(), role: Role::System }
    }
}

/// Per-call audit context. Passed explicitly through every engine operation
/// so nothing depends on which thread or task happens to run the call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Ulid,
    pub actor: Actor,
    /// Set for reconciler calls; names the sweep that issued them.
    pub origin: Option<&'static str>,
}

impl RequestContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            request_id: Ulid::new(),
            actor,
            origin: None,
        }
    }

    pub fn system(origin: &'static str) -> Self {
        Self {
            request_id: Ulid::new(),
            actor: Actor::system(),
            origin: Some(origin),
        }
    }

    pub fn span(&self, op: &'static str) -> tracing::Span {
        tracing::info_span!(
            "op",
            op,
            request_id = %self.request_id,
            actor = %self.actor.id,
            role = self.actor.role.as_str(),
            origin = self.origin.unwrap_or("request"),
        )
    }
}
