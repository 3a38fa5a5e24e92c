//! Human-in-the-loop plan approval.
//!
//! A suspended loop registers an approval id and waits on it; the gateway
//! resolves the id when the user answers. There is no intrinsic timeout: the
//! wait ends on a decision or on job cancellation.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use weft_core::correlation::CorrelationMap;

/// Text injected as the user turn when a plan is approved without edits.
pub const DEFAULT_APPROVAL_TEXT: &str = "Approved. Proceed with the plan.";

/// The user's answer to a plan.
///
/// On the wire: `false` denies, `true` approves unchanged, and a string
/// approves with that (possibly edited) instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    Approve(String),
    Deny,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawDecision {
    Flag(bool),
    Text(String),
}

impl Serialize for ApprovalDecision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Approve(text) => RawDecision::Text(text.clone()).serialize(serializer),
            Self::Deny => RawDecision::Flag(false).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ApprovalDecision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawDecision::deserialize(deserializer)? {
            RawDecision::Flag(false) => Self::Deny,
            RawDecision::Flag(true) => Self::Approve(DEFAULT_APPROVAL_TEXT.to_string()),
            RawDecision::Text(text) => Self::Approve(text),
        })
    }
}

/// Pending approvals, keyed by approval id. Each checkpoint belongs to the
/// conversation whose generation opened it and only answers addressed to
/// that conversation resolve it.
#[derive(Default)]
pub struct ApprovalRegistry {
    pending: CorrelationMap<ApprovalDecision>,
    owners: Mutex<HashMap<String, String>>,
}

impl ApprovalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new checkpoint for `conversation_id`; returns its id and the
    /// receiver to wait on.
    pub fn begin(&self, conversation_id: &str) -> (String, oneshot::Receiver<ApprovalDecision>) {
        let id = uuid::Uuid::new_v4().to_string();
        self.owners().insert(id.clone(), conversation_id.to_string());
        let rx = self.pending.register(id.clone());
        (id, rx)
    }

    /// Returns `false` if no loop is waiting on `approval_id` or the
    /// checkpoint belongs to another conversation.
    pub fn resolve(&self, conversation_id: &str, approval_id: &str, decision: ApprovalDecision) -> bool {
        {
            let mut owners = self.owners();
            if owners.get(approval_id).map(String::as_str) != Some(conversation_id) {
                return false;
            }
            owners.remove(approval_id);
        }
        self.pending.resolve(approval_id, decision)
    }

    pub fn abandon(&self, approval_id: &str) {
        self.owners().remove(approval_id);
        self.pending.remove(approval_id);
    }

    /// Conversation that opened `approval_id`, while it is pending.
    pub fn owner(&self, approval_id: &str) -> Option<String> {
        self.owners().get(approval_id).cloned()
    }

    pub fn is_pending(&self, approval_id: &str) -> bool {
        self.pending.contains(approval_id)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.pending_ids()
    }

    fn owners(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.owners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_wire_forms() {
        let deny: ApprovalDecision = serde_json::from_str("false").unwrap();
        assert_eq!(deny, ApprovalDecision::Deny);

        let edited: ApprovalDecision = serde_json::from_str(r#""Only do step 1""#).unwrap();
        assert_eq!(edited, ApprovalDecision::Approve("Only do step 1".into()));

        let plain: ApprovalDecision = serde_json::from_str("true").unwrap();
        assert_eq!(plain, ApprovalDecision::Approve(DEFAULT_APPROVAL_TEXT.into()));

        assert_eq!(serde_json::to_string(&ApprovalDecision::Deny).unwrap(), "false");
    }

    #[tokio::test]
    async fn resolve_wakes_the_waiter_once() {
        let registry = ApprovalRegistry::new();
        let (id, rx) = registry.begin("conv-a");
        assert!(registry.is_pending(&id));
        assert_eq!(registry.owner(&id).as_deref(), Some("conv-a"));

        assert!(registry.resolve("conv-a", &id, ApprovalDecision::Approve("go".into())));
        assert!(!registry.resolve("conv-a", &id, ApprovalDecision::Deny));
        assert!(registry.owner(&id).is_none());
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Approve("go".into()));
    }

    #[test]
    fn abandoned_checkpoint_rejects_late_answers() {
        let registry = ApprovalRegistry::new();
        let (id, _rx) = registry.begin("conv-a");
        registry.abandon(&id);
        assert!(!registry.resolve("conv-a", &id, ApprovalDecision::Deny));
        assert!(registry.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn answer_for_another_conversation_is_rejected() {
        let registry = ApprovalRegistry::new();
        let (id, rx) = registry.begin("conv-a");

        assert!(!registry.resolve("conv-b", &id, ApprovalDecision::Deny));
        assert!(registry.is_pending(&id));

        assert!(registry.resolve("conv-a", &id, ApprovalDecision::Approve("go".into())));
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Approve("go".into()));
    }
}
