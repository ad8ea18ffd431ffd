//! Wire payloads for the run subjects

use serde::{Deserialize, Serialize};

use crate::config::{McpServerDef, ModeDescriptor};
use crate::domain::{ExecMode, RunStatus};
use crate::policy::{TerminationBudget, ToolCall};

/// One entry of the context pack shipped on run start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPackItem {
    pub key: String,
    pub value: String,
}

/// `run.start` - control -> worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartPayload {
    #[serde(rename = "run-id")]
    pub run_id: String,

    #[serde(rename = "task-id")]
    pub task_id: String,

    #[serde(rename = "agent-id")]
    pub agent_id: String,

    pub prompt: String,

    #[serde(rename = "policy-profile")]
    pub policy_profile: String,

    #[serde(rename = "exec-mode")]
    pub exec_mode: ExecMode,

    pub termination: TerminationBudget,

    #[serde(rename = "mcp-servers")]
    pub mcp_servers: Vec<McpServerDef>,

    pub mode: Option<ModeDescriptor>,

    #[serde(rename = "context-pack")]
    pub context_pack: Vec<ContextPackItem>,

    #[serde(rename = "microagent-prompts")]
    pub microagent_prompts: Vec<String>,
}

/// `run.tool-call.request` - worker -> control
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequestMsg {
    #[serde(rename = "run-id")]
    pub run_id: String,

    #[serde(rename = "call-id")]
    pub call_id: String,

    pub tool: String,

    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub path: Option<String>,
}

impl ToolCallRequestMsg {
    /// The policy-engine view of this request
    pub fn to_tool_call(&self) -> ToolCall {
        ToolCall {
            tool: self.tool.clone(),
            command: self.command.clone(),
            path: self.path.clone(),
            call_id: self.call_id.clone(),
        }
    }
}

/// `run.tool-call.response` - control -> worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponseMsg {
    #[serde(rename = "run-id")]
    pub run_id: String,

    #[serde(rename = "call-id")]
    pub call_id: String,

    /// "allow" or "deny"
    pub decision: String,

    #[serde(default)]
    pub reason: Option<String>,
}

/// `run.tool-call.result` - worker -> control
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResultMsg {
    #[serde(rename = "run-id")]
    pub run_id: String,

    #[serde(rename = "call-id")]
    pub call_id: String,

    pub tool: String,

    pub success: bool,

    #[serde(default)]
    pub output: String,

    #[serde(rename = "cost-usd", default)]
    pub cost_usd: f64,
}

/// `run.output` - worker -> control
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutputMsg {
    #[serde(rename = "task-id")]
    pub task_id: String,

    pub line: String,

    /// "stdout" or "stderr"
    pub stream: String,
}

/// `run.complete` - worker -> control
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompleteMsg {
    #[serde(rename = "run-id")]
    pub run_id: String,

    pub status: RunStatus,

    #[serde(default)]
    pub output: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(rename = "step-count", default)]
    pub step_count: u32,

    #[serde(rename = "cost-usd", default)]
    pub cost_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_call_request_roundtrip() {
        let json = json!({
            "run-id": "r1",
            "call-id": "c1",
            "tool": "bash",
            "command": "git status",
        });

        let msg: ToolCallRequestMsg = serde_json::from_value(json).unwrap();
        assert_eq!(msg.run_id, "r1");
        assert_eq!(msg.command.as_deref(), Some("git status"));
        assert!(msg.path.is_none());

        let call = msg.to_tool_call();
        assert_eq!(call.tool, "bash");
        assert_eq!(call.call_id, "c1");
    }

    #[test]
    fn test_run_complete_kebab_fields() {
        let msg = RunCompleteMsg {
            run_id: "r1".to_string(),
            status: RunStatus::Completed,
            output: Some("done".to_string()),
            error: None,
            step_count: 7,
            cost_usd: 0.42,
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["run-id"], "r1");
        assert_eq!(json["step-count"], 7);
        assert_eq!(json["cost-usd"], 0.42);
        assert_eq!(json["status"], "completed");
    }

    #[test]
    fn test_run_start_payload_serializes() {
        let payload = RunStartPayload {
            run_id: "r1".to_string(),
            task_id: "t1".to_string(),
            agent_id: "a1".to_string(),
            prompt: "do the thing".to_string(),
            policy_profile: "default".to_string(),
            exec_mode: ExecMode::Sandbox,
            termination: TerminationBudget::default(),
            mcp_servers: vec![],
            mode: None,
            context_pack: vec![ContextPackItem {
                key: "step_output:s1".to_string(),
                value: "prior output".to_string(),
            }],
            microagent_prompts: vec![],
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["policy-profile"], "default");
        assert_eq!(json["exec-mode"], "sandbox");
        assert_eq!(json["context-pack"][0]["key"], "step_output:s1");
    }
}
