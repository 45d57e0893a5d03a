use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::vision::VisionReply;

/// Mutable state of one task run. Created on entry to
/// [`crate::engine::TaskEngine::execute`] and discarded with the result.
#[derive(Debug)]
pub struct ExecutionContext {
    pub task_name: String,
    /// Caller parameters, keyed by the declared input spelling.
    pub parameters: HashMap<String, String>,
    /// Values stored by successful `extract` actions, in arrival order.
    pub extracted_values: HashMap<String, String>,
    /// Names announced by `output` actions, deduplicated, execution order.
    pub declared_outputs: Vec<String>,
    pub current_step_index: usize,
    pub current_step_name: String,
    pub screenshot_paths: Vec<PathBuf>,
    pub total_tokens_used: u64,
}

impl ExecutionContext {
    pub fn new(task_name: String, parameters: HashMap<String, String>) -> Self {
        Self {
            task_name,
            parameters,
            extracted_values: HashMap::new(),
            declared_outputs: Vec::new(),
            current_step_index: 0,
            current_step_name: String::new(),
            screenshot_paths: Vec::new(),
            total_tokens_used: 0,
        }
    }

    /// Parameters win over extracted values on name collision.
    pub fn resolve_value(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(name)
            .or_else(|| self.extracted_values.get(name))
            .map(String::as_str)
    }

    pub fn declare_output(&mut self, name: &str) {
        if !self.declared_outputs.iter().any(|n| n == name) {
            self.declared_outputs.push(name.to_string());
        }
    }

    pub fn record_screenshot(&mut self, path: PathBuf) {
        self.screenshot_paths.push(path);
    }

    pub fn last_screenshot(&self) -> Option<&PathBuf> {
        self.screenshot_paths.last()
    }

    pub fn add_usage(&mut self, reply: &VisionReply) {
        self.total_tokens_used += reply.total_tokens();
    }

    /// Outputs in declaration order; names never extracted are omitted.
    pub fn collect_outputs(&self) -> IndexMap<String, String> {
        let mut outputs = IndexMap::new();
        for name in &self.declared_outputs {
            if let Some(value) = self.extracted_values.get(name) {
                outputs.insert(name.clone(), value.clone());
            }
        }
        outputs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at_step: Option<String>,
    pub outputs: IndexMap<String, String>,
    pub steps_completed: usize,
    pub steps_total: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Last screenshot captured during the run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
    pub total_tokens_used: u64,
}

/// Snapshot-readable engine status; written only from the execution path.
#[derive(Debug, Default)]
pub struct EngineStatus {
    inner: RwLock<StatusInner>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StatusInner {
    pub is_running: bool,
    pub current_task_name: Option<String>,
    pub current_step_name: Option<String>,
}

impl EngineStatus {
    pub fn snapshot(&self) -> StatusInner {
        self.inner.read().expect("status lock poisoned").clone()
    }

    pub(crate) fn begin(&self, task_name: &str) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.is_running = true;
        inner.current_task_name = Some(task_name.to_string());
        inner.current_step_name = None;
    }

    pub(crate) fn set_step(&self, step_name: &str) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.current_step_name = Some(step_name.to_string());
    }

    pub(crate) fn finish(&self) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.is_running = false;
        inner.current_task_name = None;
        inner.current_step_name = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reply(input: u64, output: u64) -> VisionReply {
        VisionReply {
            text: String::new(),
            input_tokens: input,
            output_tokens: output,
            model: "m".into(),
            duration: Duration::from_millis(1),
        }
    }

    #[test]
    fn parameters_win_over_extracted_values() {
        let mut params = HashMap::new();
        params.insert("total".to_string(), "from-param".to_string());
        let mut ctx = ExecutionContext::new("t".into(), params);
        ctx.extracted_values
            .insert("total".into(), "from-extract".into());
        assert_eq!(ctx.resolve_value("total"), Some("from-param"));
        assert_eq!(ctx.resolve_value("missing"), None);
    }

    #[test]
    fn declare_output_deduplicates_preserving_order() {
        let mut ctx = ExecutionContext::new("t".into(), HashMap::new());
        ctx.declare_output("b");
        ctx.declare_output("a");
        ctx.declare_output("b");
        assert_eq!(ctx.declared_outputs, vec!["b", "a"]);
    }

    #[test]
    fn outputs_omit_missing_extracts() {
        let mut ctx = ExecutionContext::new("t".into(), HashMap::new());
        ctx.extracted_values.insert("present".into(), "1".into());
        ctx.declare_output("present");
        ctx.declare_output("absent");
        let outputs = ctx.collect_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs.get("present"), Some(&"1".to_string()));
    }

    #[test]
    fn token_usage_sums_both_directions() {
        let mut ctx = ExecutionContext::new("t".into(), HashMap::new());
        ctx.add_usage(&reply(100, 20));
        ctx.add_usage(&reply(50, 5));
        assert_eq!(ctx.total_tokens_used, 175);
    }
}
