//! Approval prompt and answer payloads carried on the push topics.

use crate::ids::ApprovalId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Display strings shown to the human alongside an approval prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalMetadata {
    /// What the subject should be called in the prompt UI.
    pub display_name: String,
    /// The process asking for the decision.
    pub process_name: String,
}

/// The prompt pushed to the client process when the host needs a decision.
///
/// Fire and forget on the wire: the answer, if any, comes back on the
/// [`crate::frame::topics::APPROVAL_ANSWER`] topic on its own timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPrompt {
    pub approval_id: ApprovalId,
    /// The item the decision is about, e.g. the credential being signed.
    pub subject_id: String,
    pub metadata: ApprovalMetadata,
    pub created_at: DateTime<Utc>,
}

/// The human's answer to a previously pushed prompt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApprovalAnswer {
    pub approval_id: ApprovalId,
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_serde_roundtrip() {
        let prompt = ApprovalPrompt {
            approval_id: ApprovalId(9),
            subject_id: "login-item-42".to_owned(),
            metadata: ApprovalMetadata {
                display_name: "example.com".to_owned(),
                process_name: "browser".to_owned(),
            },
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&prompt).unwrap();
        let back: ApprovalPrompt = serde_json::from_str(&json).unwrap();
        assert_eq!(back.approval_id, ApprovalId(9));
        assert_eq!(back.subject_id, "login-item-42");
    }
}
