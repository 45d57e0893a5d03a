//! End-to-end engine runs against a scripted vision model and a recording
//! device controller.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mblrun::config::EngineConfig;
use mblrun::engine::{TaskEngine, TaskExecutionResult};
use mblrun::errors::{EngineError, EngineResult};
use mblrun::logging::TaskLogger;
use mblrun::mbl::{self, Action, TaskDefinition};
use mblrun::remote::RemoteDesktopController;
use mblrun::vision::{VisionModelClient, VisionReply};

// ── Mock collaborators ───────────────────────────────────────────────────

/// Replays a fixed queue of model replies and records the prompts it saw.
struct ScriptedVision {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedVision {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl VisionModelClient for ScriptedVision {
    async fn send(
        &self,
        _png: &[u8],
        prompt: &str,
        _cancel: &CancellationToken,
    ) -> EngineResult<VisionReply> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let text = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("vision mock ran out of scripted replies"));
        Ok(VisionReply {
            text,
            input_tokens: 10,
            output_tokens: 2,
            model: "scripted".into(),
            duration: Duration::from_millis(1),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DeviceCall {
    Screenshot,
    Click(u32, u32),
    DoubleClick(u32, u32),
    RightClick(u32, u32),
    Keys(String),
    Combo(String),
}

/// Records every device call; optionally stalls screenshot capture.
struct RecordingController {
    calls: Mutex<Vec<DeviceCall>>,
    connected: AtomicBool,
    screenshot_delay: Option<Duration>,
}

impl RecordingController {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            screenshot_delay: None,
        })
    }

    fn with_screenshot_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            screenshot_delay: Some(delay),
        })
    }

    fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, filter: impl Fn(&DeviceCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| filter(c)).count()
    }

    fn record(&self, call: DeviceCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RemoteDesktopController for RecordingController {
    async fn connect(&self, _cancel: &CancellationToken) -> EngineResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn capture_screenshot(&self, cancel: &CancellationToken) -> EngineResult<Vec<u8>> {
        if let Some(delay) = self.screenshot_delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.record(DeviceCall::Screenshot);
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn click(&self, x: u32, y: u32, _cancel: &CancellationToken) -> EngineResult<()> {
        self.record(DeviceCall::Click(x, y));
        Ok(())
    }

    async fn double_click(&self, x: u32, y: u32, _cancel: &CancellationToken) -> EngineResult<()> {
        self.record(DeviceCall::DoubleClick(x, y));
        Ok(())
    }

    async fn right_click(&self, x: u32, y: u32, _cancel: &CancellationToken) -> EngineResult<()> {
        self.record(DeviceCall::RightClick(x, y));
        Ok(())
    }

    async fn send_keys(&self, text: &str, _cancel: &CancellationToken) -> EngineResult<()> {
        self.record(DeviceCall::Keys(text.to_string()));
        Ok(())
    }

    async fn send_key_combo(&self, combo: &str, _cancel: &CancellationToken) -> EngineResult<()> {
        self.record(DeviceCall::Combo(combo.to_string()));
        Ok(())
    }
}

/// In-memory logger handing out synthetic screenshot paths.
struct MemoryLogger {
    screenshots: AtomicUsize,
}

impl MemoryLogger {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            screenshots: AtomicUsize::new(0),
        })
    }

    fn saved_screenshots(&self) -> usize {
        self.screenshots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskLogger for MemoryLogger {
    async fn start_task_log(&self, task_name: &str) -> Option<PathBuf> {
        Some(PathBuf::from(format!("memory/{task_name}.jsonl")))
    }

    async fn log_task_start(&self, _task_name: &str, _parameters: &HashMap<String, String>) {}

    async fn log_step_start(&self, _index: usize, _description: &str) {}

    async fn log_step_complete(&self, _index: usize, _description: &str) {}

    async fn log_action(&self, _action: &Action, _detail: &str) {}

    async fn log_task_complete(&self, _success: bool, _error: Option<&str>) {}

    async fn save_screenshot(&self, _png: &[u8], prefix: &str) -> Option<PathBuf> {
        let n = self.screenshots.fetch_add(1, Ordering::SeqCst);
        Some(PathBuf::from(format!("memory/{prefix}_{n}.png")))
    }

    async fn flush(&self) {}
}

// ── Harness ──────────────────────────────────────────────────────────────

fn fast_config() -> EngineConfig {
    EngineConfig {
        default_expect_timeout_seconds: 30,
        expect_retry_intervals_ms: vec![10, 10, 10],
        post_action_delay_ms: 0,
        post_click_delay_ms: 0,
        typing_delay_ms: 0,
    }
}

fn parse(source: &str) -> TaskDefinition {
    mbl::parse_task(source, "scenario.mbl").expect("scenario task must be valid")
}

struct Harness {
    engine: TaskEngine,
    controller: Arc<RecordingController>,
    vision: Arc<ScriptedVision>,
    logger: Arc<MemoryLogger>,
}

impl Harness {
    fn new(replies: &[&str]) -> Self {
        Self::build(RecordingController::new(), replies, fast_config())
    }

    fn build(
        controller: Arc<RecordingController>,
        replies: &[&str],
        config: EngineConfig,
    ) -> Self {
        let vision = ScriptedVision::new(replies);
        let logger = MemoryLogger::new();
        let engine = TaskEngine::new(
            controller.clone(),
            vision.clone(),
            logger.clone(),
            config,
        );
        Self {
            engine,
            controller,
            vision,
            logger,
        }
    }

    async fn run(&self, task: &TaskDefinition, params: &[(&str, &str)]) -> TaskExecutionResult {
        let params: HashMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.engine
            .execute(task, params, CancellationToken::new())
            .await
    }
}

// ── End-to-end scenarios ─────────────────────────────────────────────────

#[tokio::test]
async fn s1_minimal_click() {
    let task = parse("task \"T\"\n step \"s\"\n  click \"Save\"\n");
    let h = Harness::new(&["400,300"]);

    let result = h.run(&task, &[]).await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.steps_completed, 1);
    assert_eq!(result.steps_total, 1);
    assert!(result.outputs.is_empty());
    assert_eq!(
        h.controller.calls(),
        vec![DeviceCall::Screenshot, DeviceCall::Click(400, 300)]
    );
}

#[tokio::test]
async fn s2_extract_output_round_trip() {
    let task = parse(
        "task \"T\"\nstep \"s\"\n extract total from \"Total\"\n output total\n",
    );
    let h = Harness::new(&["  42.00  "]);

    let result = h.run(&task, &[]).await;

    assert!(result.success);
    assert_eq!(result.outputs.get("total"), Some(&"42.00".to_string()));
    assert_eq!(result.outputs.len(), 1);
}

#[tokio::test]
async fn s3_expect_retries_then_matches() {
    let task = parse("task \"T\"\nstep \"s\"\n expect \"Main window\"\n");
    let h = Harness::new(&["NO_MATCH", "UNCERTAIN", "UNCERTAIN", "MATCH"]);

    let result = h.run(&task, &[]).await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(h.vision.calls(), 4);
    assert_eq!(h.logger.saved_screenshots(), 4);
    assert_eq!(
        h.controller.count(|c| *c == DeviceCall::Screenshot),
        4
    );
}

#[tokio::test]
async fn s4_expect_exhausted_runs_on_timeout_and_handler_abort_surfaces() {
    let task = parse(
        "task \"T\"\nstep \"s\"\n expect \"Main window\"\non timeout\n abort \"t/o\"\n",
    );
    let h = Harness::new(&["NO_MATCH", "NO_MATCH", "NO_MATCH", "NO_MATCH"]);

    let result = h.run(&task, &[]).await;

    assert!(!result.success);
    assert_eq!(h.vision.calls(), 4);
    assert!(result.error.as_deref().unwrap().contains("t/o"));
}

#[tokio::test]
async fn s4b_expect_message_survives_passive_handler() {
    let task = parse(
        "task \"T\"\nstep \"s\"\n expect \"Main window\"\non timeout\n screenshot\n",
    );
    let h = Harness::new(&["NO_MATCH", "NO_MATCH", "NO_MATCH", "NO_MATCH"]);

    let result = h.run(&task, &[]).await;

    assert!(!result.success);
    let error = result.error.as_deref().unwrap();
    assert!(error.contains("Expect failed"), "unexpected error: {error}");
    assert!(error.contains("Main window"));
    // The handler's screenshot ran on top of the four expect attempts.
    assert_eq!(h.logger.saved_screenshots(), 5);
}

#[tokio::test]
async fn s5_if_branch_yes_clicks_ok() {
    let src = "task \"T\"\nstep \"s\"\n if screen shows \"Dialog\"\n  click \"OK\"\n else\n  click \"Cancel\"\n end\n";
    let h = Harness::new(&["YES", "10,20"]);

    let result = h.run(&parse(src), &[]).await;

    assert!(result.success);
    assert_eq!(
        h.controller.count(|c| matches!(c, DeviceCall::Click(10, 20))),
        1
    );
}

#[tokio::test]
async fn s5_if_branch_no_clicks_cancel() {
    let src = "task \"T\"\nstep \"s\"\n if screen shows \"Dialog\"\n  click \"OK\"\n else\n  click \"Cancel\"\n end\n";
    let h = Harness::new(&["NO", "30,40"]);

    let result = h.run(&parse(src), &[]).await;

    assert!(result.success);
    assert_eq!(
        h.controller.count(|c| matches!(c, DeviceCall::Click(30, 40))),
        1
    );
    // Second prompt asked for the else-branch target.
    let prompts = h.vision.prompts.lock().unwrap();
    assert!(prompts[1].contains("Cancel"));
}

#[tokio::test]
async fn s6_parameter_substitution_types_into_field() {
    let task = parse("task \"T\"\ninput name\nstep \"s\"\n type name into \"Field\"\n");
    let h = Harness::new(&["100,200"]);

    let result = h.run(&task, &[("name", "Ada")]).await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(
        h.controller.calls(),
        vec![
            DeviceCall::Screenshot,
            DeviceCall::Click(100, 200),
            DeviceCall::Combo("Ctrl+A".into()),
            DeviceCall::Combo("Delete".into()),
            DeviceCall::Keys("Ada".into()),
        ]
    );
}

#[tokio::test]
async fn type_append_skips_the_clear_sequence() {
    let task = parse("task \"T\"\nstep \"s\"\n type \"more\" append into \"Notes\"\n");
    let h = Harness::new(&["5,6"]);

    let result = h.run(&task, &[]).await;

    assert!(result.success);
    assert_eq!(h.controller.count(|c| matches!(c, DeviceCall::Combo(_))), 0);
    assert_eq!(
        h.controller.count(|c| *c == DeviceCall::Keys("more".into())),
        1
    );
}

#[tokio::test]
async fn select_is_a_two_phase_click() {
    let task = parse("task \"T\"\ninput country\nstep \"s\"\n select country in \"Country\"\n");
    let h = Harness::new(&["50,60", "50,90"]);

    let result = h.run(&task, &[("country", "Germany")]).await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(h.vision.calls(), 2);
    assert_eq!(
        h.controller.calls(),
        vec![
            DeviceCall::Screenshot,
            DeviceCall::Click(50, 60),
            DeviceCall::Screenshot,
            DeviceCall::Click(50, 90),
        ]
    );
    let prompts = h.vision.prompts.lock().unwrap();
    assert!(prompts[1].contains("Germany"));
}

// ── Failure paths ────────────────────────────────────────────────────────

#[tokio::test]
async fn element_not_found_runs_on_error_and_keeps_original_message() {
    let task = parse(
        "task \"T\"\nstep \"s\"\n click \"Save\"\non error\n screenshot\n",
    );
    let h = Harness::new(&["NOT_FOUND: no Save button"]);

    let result = h.run(&task, &[]).await;

    assert!(!result.success);
    let error = result.error.as_deref().unwrap();
    assert!(error.contains("Save"));
    assert!(error.contains("no Save button"));
    assert_eq!(result.failed_at_step.as_deref(), Some("s"));
    // on error handler captured one extra screenshot.
    assert_eq!(h.logger.saved_screenshots(), 2);
}

#[tokio::test]
async fn abort_fails_without_running_handlers() {
    let task = parse(
        "task \"T\"\nstep \"s\"\n abort \"wrong build\"\non error\n screenshot\non timeout\n screenshot\n",
    );
    let h = Harness::new(&[]);

    let result = h.run(&task, &[]).await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("wrong build"));
    assert_eq!(h.logger.saved_screenshots(), 0);
}

#[tokio::test]
async fn missing_input_fails_before_any_step() {
    let task = parse("task \"T\"\ninput amount\nstep \"s\"\n type amount into \"F\"\n");
    let h = Harness::new(&[]);

    let result = h.run(&task, &[]).await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("amount"));
    assert_eq!(result.steps_completed, 0);
    assert!(result.failed_at_step.is_none());
    assert_eq!(h.vision.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn step_timeout_classifies_and_runs_on_timeout_once() {
    let task = parse(
        "task \"T\"\nstep \"slow step\"\n timeout 1\n screenshot\non timeout\n key Ctrl+L\n",
    );
    let controller = RecordingController::with_screenshot_delay(Duration::from_secs(5));
    let h = Harness::build(controller, &[], fast_config());

    let result = h.run(&task, &[]).await;

    assert!(!result.success);
    let error = result.error.as_deref().unwrap();
    assert!(error.contains("timed out"), "unexpected error: {error}");
    assert!(error.contains("slow step"));
    assert_eq!(
        h.controller.count(|c| *c == DeviceCall::Combo("Ctrl+L".into())),
        1
    );
}

#[tokio::test]
async fn pre_cancelled_token_reports_cancellation() {
    let task = parse("task \"T\"\nstep \"s\"\n click \"X\"\non error\n screenshot\n");
    let h = Harness::new(&[]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = h.engine.execute(&task, HashMap::new(), cancel).await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Task was cancelled."));
    // No handler runs on cancellation.
    assert_eq!(h.logger.saved_screenshots(), 0);
}

#[tokio::test]
async fn failure_stops_remaining_steps() {
    let task = parse(
        "task \"T\"\nstep \"one\"\n click \"A\"\nstep \"two\"\n click \"B\"\n",
    );
    let h = Harness::new(&["NOT_FOUND", "1,1"]);

    let result = h.run(&task, &[]).await;

    assert!(!result.success);
    assert_eq!(result.steps_completed, 0);
    assert_eq!(result.failed_at_step.as_deref(), Some("one"));
    // The second step's locate never happened.
    assert_eq!(h.vision.calls(), 1);
}

// ── Invariants ───────────────────────────────────────────────────────────

#[tokio::test]
async fn deterministic_given_deterministic_mocks() {
    let src = "task \"T\"\ninput name\nstep \"s\"\n type name into \"F\"\n extract v from \"V\"\n output v\n";
    let replies = &["100,200", "checked"];

    let first = Harness::new(replies);
    let a = first.run(&parse(src), &[("name", "Ada")]).await;
    let second = Harness::new(replies);
    let b = second.run(&parse(src), &[("name", "Ada")]).await;

    assert_eq!(a.outputs, b.outputs);
    assert_eq!(a.steps_completed, b.steps_completed);
    assert_eq!(first.controller.calls(), second.controller.calls());
}

#[tokio::test]
async fn outputs_follow_execution_order_and_deduplicate() {
    let src = "task \"T\"\nstep \"s\"\n extract b from \"B\"\n extract a from \"A\"\n output b\n output a\n output b\n";
    let h = Harness::new(&["2", "1"]);

    let result = h.run(&parse(src), &[]).await;

    let keys: Vec<&String> = result.outputs.keys().collect();
    assert_eq!(keys, vec!["b", "a"]);
    assert_eq!(result.outputs.get("b"), Some(&"2".to_string()));
}

#[tokio::test]
async fn output_of_untaken_branch_extract_is_omitted() {
    let src = "task \"T\"\nstep \"s\"\n if screen shows \"Detail\"\n  extract v from \"V\"\n end\n output v\n";
    let h = Harness::new(&["NO"]);

    let result = h.run(&parse(src), &[]).await;

    assert!(result.success, "error: {:?}", result.error);
    assert!(result.outputs.is_empty());
}

#[tokio::test]
async fn extract_empty_stores_empty_string() {
    let src = "task \"T\"\nstep \"s\"\n extract note from \"Note\"\n output note\n";
    let h = Harness::new(&["EMPTY"]);

    let result = h.run(&parse(src), &[]).await;

    assert!(result.success);
    assert_eq!(result.outputs.get("note"), Some(&String::new()));
}

#[tokio::test]
async fn parameters_shadow_extracted_values() {
    let src = "task \"T\"\ninput v\nstep \"s\"\n extract v from \"V\"\n type v into \"F\"\n";
    let h = Harness::new(&["extracted", "7,8"]);

    let result = h.run(&parse(src), &[("v", "param")]).await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(
        h.controller.count(|c| *c == DeviceCall::Keys("param".into())),
        1
    );
}

#[tokio::test]
async fn token_usage_accumulates_across_calls() {
    let task = parse("task \"T\"\nstep \"s\"\n expect \"W\"\n click \"X\"\n");
    let h = Harness::new(&["MATCH", "1,2"]);

    let result = h.run(&task, &[]).await;

    assert!(result.success);
    // Two model calls at 10 input + 2 output tokens each.
    assert_eq!(result.total_tokens_used, 24);
}

#[tokio::test]
async fn last_screenshot_is_attached_to_the_result() {
    let task = parse("task \"T\"\nstep \"s\"\n screenshot\n screenshot\n");
    let h = Harness::new(&[]);

    let result = h.run(&task, &[]).await;

    assert!(result.success);
    let path = result.screenshot_path.unwrap();
    assert!(path.to_string_lossy().ends_with("manual_1.png"));
}

#[tokio::test]
async fn status_is_idle_after_completion() {
    let task = parse("task \"T\"\nstep \"s\"\n screenshot\n");
    let h = Harness::new(&[]);

    let before = h.engine.status();
    assert!(!before.is_running);

    let _ = h.run(&task, &[]).await;

    let after = h.engine.status();
    assert!(!after.is_running);
    assert!(after.current_task_name.is_none());
}
