use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload posted by the agent's hook script to `/api/hooks/{event}`.
///
/// Everything except `session_id` is optional; unrecognized events still
/// carry a subset of these fields and are logged as-is.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HookInput {
    pub session_id: String,
    pub transcript_path: Option<String>,
    pub cwd: String,
    pub permission_mode: Option<String>,
    pub hook_event_name: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_response: Option<Value>,
    pub tool_use_id: Option<String>,
    pub message: Option<String>,
    pub notification_type: Option<String>,
    pub prompt: Option<String>,
    pub stop_hook_active: bool,
    pub reason: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionBehavior {
    Allow,
    Deny,
}

impl DecisionBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// An operator's verdict for one pending approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub behavior: DecisionBehavior,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HookDecision {
    pub behavior: DecisionBehavior,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSpecificOutput {
    pub hook_event_name: &'static str,
    pub decision: HookDecision,
}

/// Response body the hook script forwards back to the agent for
/// `PermissionRequest` events.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionEnvelope {
    pub hook_specific_output: HookSpecificOutput,
}

impl DecisionEnvelope {
    pub fn allow() -> Self {
        Self {
            hook_specific_output: HookSpecificOutput {
                hook_event_name: "PermissionRequest",
                decision: HookDecision {
                    behavior: DecisionBehavior::Allow,
                    message: None,
                },
            },
        }
    }

    pub fn deny(message: Option<String>) -> Self {
        Self {
            hook_specific_output: HookSpecificOutput {
                hook_event_name: "PermissionRequest",
                decision: HookDecision {
                    behavior: DecisionBehavior::Deny,
                    message,
                },
            },
        }
    }
}
