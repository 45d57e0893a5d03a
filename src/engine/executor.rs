use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::engine::context::{EngineStatus, ExecutionContext, StatusInner, TaskExecutionResult};
use crate::errors::{EngineError, EngineResult};
use crate::logging::TaskLogger;
use crate::mbl::{Action, ErrorHandler, TaskDefinition};
use crate::protocol::prompts;
use crate::protocol::responses::{
    parse_boolean, parse_coordinate, parse_expect, parse_extract, CoordinateReply, ExpectOutcome,
    ExtractReply,
};
use crate::remote::RemoteDesktopController;
use crate::vision::{VisionModelClient, VisionReply};

/// Extra settle time between opening a dropdown and reading its options.
const DROPDOWN_OPEN_DELAY_MS: u64 = 300;

/// Sequential interpreter for validated task definitions.
///
/// One engine instance runs one task at a time; the enclosing service is
/// responsible for serialising calls to [`TaskEngine::execute`].
pub struct TaskEngine {
    controller: Arc<dyn RemoteDesktopController>,
    vision: Arc<dyn VisionModelClient>,
    logger: Arc<dyn TaskLogger>,
    config: EngineConfig,
    status: EngineStatus,
}

impl TaskEngine {
    pub fn new(
        controller: Arc<dyn RemoteDesktopController>,
        vision: Arc<dyn VisionModelClient>,
        logger: Arc<dyn TaskLogger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            controller,
            vision,
            logger,
            config,
            status: EngineStatus::default(),
        }
    }

    pub fn status(&self) -> StatusInner {
        self.status.snapshot()
    }

    /// Runs a validated task to completion, cancellation or failure.
    ///
    /// `parameters` keys are accepted case-insensitively against the task's
    /// declared inputs; every declared input must be supplied.
    pub async fn execute(
        &self,
        task: &TaskDefinition,
        parameters: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> TaskExecutionResult {
        let started = Instant::now();
        let log_file = self.logger.start_task_log(&task.name).await;

        let parameters = match normalize_parameters(task, parameters) {
            Ok(parameters) => parameters,
            Err(e) => {
                tracing::error!(task = %task.name, error = %e, "task rejected at entry");
                return TaskExecutionResult {
                    success: false,
                    error: Some(e.to_string()),
                    failed_at_step: None,
                    outputs: Default::default(),
                    steps_completed: 0,
                    steps_total: task.steps.len(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    log_file,
                    screenshot_path: None,
                    total_tokens_used: 0,
                };
            }
        };

        tracing::info!(task = %task.name, steps = task.steps.len(), "task started");
        self.status.begin(&task.name);
        self.logger.log_task_start(&task.name, &parameters).await;

        let mut ctx = ExecutionContext::new(task.name.clone(), parameters);
        let mut steps_completed = 0usize;
        let mut failure: Option<EngineError> = None;

        for (index, step) in task.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                failure = Some(EngineError::Cancelled);
                break;
            }

            ctx.current_step_index = index;
            ctx.current_step_name = step.description.clone();
            self.status.set_step(&step.description);
            self.logger.log_step_start(index, &step.description).await;
            tracing::info!(step = %step.description, index, "step started");

            let timeout_seconds = step
                .timeout_seconds
                .unwrap_or(self.config.default_expect_timeout_seconds);
            let step_token = cancel.child_token();

            let outcome = tokio::time::timeout(
                Duration::from_secs(timeout_seconds),
                self.run_actions(&step.actions, &mut ctx, &step_token),
            )
            .await;

            let step_error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(EngineError::Cancelled)) => Some(EngineError::Cancelled),
                Ok(Err(e)) => Some(e),
                Err(_elapsed) => {
                    step_token.cancel();
                    Some(EngineError::StepTimedOut {
                        step: step.description.clone(),
                        seconds: timeout_seconds,
                    })
                }
            };

            match step_error {
                None => {
                    self.logger.log_step_complete(index, &step.description).await;
                    tracing::info!(step = %step.description, "step complete");
                    steps_completed += 1;
                }
                Some(e) => {
                    tracing::warn!(step = %step.description, error = %e, "step failed");
                    failure = Some(self.dispatch_failure(task, &mut ctx, &cancel, e).await);
                    break;
                }
            }
        }

        self.status.finish();

        let (success, error, failed_at_step) = match &failure {
            None => (true, None, None),
            Some(e) => (
                false,
                Some(e.to_string()),
                (!ctx.current_step_name.is_empty()).then(|| ctx.current_step_name.clone()),
            ),
        };

        self.logger.log_task_complete(success, error.as_deref()).await;
        self.logger.flush().await;
        tracing::info!(
            task = %task.name,
            success,
            steps_completed,
            tokens = ctx.total_tokens_used,
            "task finished"
        );

        TaskExecutionResult {
            success,
            error,
            failed_at_step,
            outputs: ctx.collect_outputs(),
            steps_completed,
            steps_total: task.steps.len(),
            duration_ms: started.elapsed().as_millis() as u64,
            log_file,
            screenshot_path: ctx.last_screenshot().cloned(),
            total_tokens_used: ctx.total_tokens_used,
        }
    }

    /// Runs the matching error handler (if any) and settles the final error.
    ///
    /// An `abort` raised inside a handler replaces the original error; any
    /// other handler failure is logged and discarded.
    async fn dispatch_failure(
        &self,
        task: &TaskDefinition,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        original: EngineError,
    ) -> EngineError {
        let handler = match &original {
            EngineError::StepTimedOut { .. } | EngineError::ExpectExhausted { .. } => {
                task.on_timeout.as_ref().map(|h| ("on timeout", h))
            }
            EngineError::Abort(_) | EngineError::Cancelled => None,
            _ => task.on_error.as_ref().map(|h| ("on error", h)),
        };

        let Some((name, handler)) = handler else {
            return original;
        };

        tracing::info!(handler = name, "running error handler");
        match self.run_handler(handler, ctx, cancel).await {
            Ok(()) => original,
            Err(EngineError::Abort(message)) => EngineError::Abort(message),
            Err(e) => {
                tracing::warn!(handler = name, error = %e, "error handler failed");
                original
            }
        }
    }

    async fn run_handler(
        &self,
        handler: &ErrorHandler,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        // Handlers run under the caller token only; the step deadline that
        // may have just fired does not apply to them.
        self.run_actions(&handler.actions, ctx, cancel).await
    }

    async fn run_actions(
        &self,
        actions: &[Action],
        ctx: &mut ExecutionContext,
        token: &CancellationToken,
    ) -> EngineResult<()> {
        for action in actions {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.run_action(action, ctx, token).await?;
        }
        Ok(())
    }

    async fn run_action(
        &self,
        action: &Action,
        ctx: &mut ExecutionContext,
        token: &CancellationToken,
    ) -> EngineResult<()> {
        tracing::debug!(verb = action.verb(), "running action");
        match action {
            Action::Expect { description } => self.run_expect(action, description, ctx, token).await,
            Action::Click { target } => {
                let (x, y) = self.locate(target, ctx, token).await?;
                self.controller.click(x, y, token).await?;
                self.logger
                    .log_action(action, &format!("clicked \"{target}\" at {x},{y}"))
                    .await;
                self.pause(self.config.post_click_delay_ms, token).await
            }
            Action::DoubleClick { target } => {
                let (x, y) = self.locate(target, ctx, token).await?;
                self.controller.double_click(x, y, token).await?;
                self.logger
                    .log_action(action, &format!("double-clicked \"{target}\" at {x},{y}"))
                    .await;
                self.pause(self.config.post_click_delay_ms, token).await
            }
            Action::RightClick { target } => {
                let (x, y) = self.locate(target, ctx, token).await?;
                self.controller.right_click(x, y, token).await?;
                self.logger
                    .log_action(action, &format!("right-clicked \"{target}\" at {x},{y}"))
                    .await;
                self.pause(self.config.post_click_delay_ms, token).await
            }
            Action::Type {
                value,
                is_param,
                target,
                append,
            } => {
                let text = self.resolve(value, *is_param, ctx)?;
                let (x, y) = self.locate(target, ctx, token).await?;
                self.controller.click(x, y, token).await?;
                self.pause(self.config.post_click_delay_ms, token).await?;
                if !append {
                    self.controller.send_key_combo("Ctrl+A", token).await?;
                    self.controller.send_key_combo("Delete", token).await?;
                }
                self.controller.send_keys(&text, token).await?;
                self.logger
                    .log_action(action, &format!("typed into \"{target}\""))
                    .await;
                self.pause(self.config.post_action_delay_ms, token).await
            }
            Action::Select {
                value,
                is_param,
                target,
            } => {
                let option = self.resolve(value, *is_param, ctx)?;

                let (x, y) = self.locate(target, ctx, token).await?;
                self.controller.click(x, y, token).await?;
                self.pause(
                    self.config.post_click_delay_ms + DROPDOWN_OPEN_DELAY_MS,
                    token,
                )
                .await?;

                let png = self.observe(ctx, token, "select").await?;
                let reply = self
                    .ask(&png, &prompts::locate_option_prompt(&option, target), ctx, token)
                    .await?;
                match parse_coordinate(&reply.text) {
                    CoordinateReply::Found { x, y } => {
                        self.controller.click(x, y, token).await?;
                        self.logger
                            .log_action(
                                action,
                                &format!("selected \"{option}\" in \"{target}\" at {x},{y}"),
                            )
                            .await;
                        self.pause(self.config.post_click_delay_ms, token).await
                    }
                    CoordinateReply::NotFound { detail } => Err(EngineError::ElementNotFound {
                        target: format!("{option} in {target}"),
                        detail,
                    }),
                }
            }
            Action::Key { key_combo } => {
                self.controller.send_key_combo(key_combo, token).await?;
                self.logger
                    .log_action(action, &format!("pressed {key_combo}"))
                    .await;
                self.pause(self.config.post_action_delay_ms, token).await
            }
            Action::Extract { variable, source } => {
                let png = self.observe(ctx, token, "extract").await?;
                let reply = self
                    .ask(&png, &prompts::extract_prompt(source), ctx, token)
                    .await?;
                match parse_extract(&reply.text) {
                    ExtractReply::Value { value } => {
                        self.logger
                            .log_action(action, &format!("extracted '{variable}' from \"{source}\""))
                            .await;
                        ctx.extracted_values.insert(variable.clone(), value);
                        Ok(())
                    }
                    ExtractReply::Empty => {
                        ctx.extracted_values.insert(variable.clone(), String::new());
                        Ok(())
                    }
                    ExtractReply::NotFound => Err(EngineError::ElementNotFound {
                        target: source.clone(),
                        detail: "no value readable".into(),
                    }),
                }
            }
            Action::Output { variable } => {
                ctx.declare_output(variable);
                self.logger
                    .log_action(action, &format!("declared output '{variable}'"))
                    .await;
                Ok(())
            }
            Action::Screenshot => {
                self.observe(ctx, token, "manual").await?;
                self.logger.log_action(action, "captured screenshot").await;
                Ok(())
            }
            Action::Abort { message } => Err(EngineError::Abort(message.clone())),
            Action::IfScreenShows {
                condition,
                then_actions,
                else_actions,
            } => {
                let png = self.observe(ctx, token, "condition").await?;
                let reply = self
                    .ask(&png, &prompts::question_prompt(condition), ctx, token)
                    .await?;
                let shown = parse_boolean(&reply.text);
                self.logger
                    .log_action(action, &format!("\"{condition}\" -> {shown}"))
                    .await;
                if shown {
                    Box::pin(self.run_actions(then_actions, ctx, token)).await
                } else if let Some(else_actions) = else_actions {
                    Box::pin(self.run_actions(else_actions, ctx, token)).await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Polls the screen until the description matches or attempts run out.
    async fn run_expect(
        &self,
        action: &Action,
        description: &str,
        ctx: &mut ExecutionContext,
        token: &CancellationToken,
    ) -> EngineResult<()> {
        let intervals = &self.config.expect_retry_intervals_ms;
        let attempts = intervals.len() + 1;
        let mut last_response = String::new();

        for attempt in 0..attempts {
            let png = self.observe(ctx, token, "expect").await?;
            let reply = self
                .ask(&png, &prompts::expect_prompt(description), ctx, token)
                .await?;
            last_response = reply.text.trim().to_string();

            match parse_expect(&reply.text) {
                ExpectOutcome::Match => {
                    self.logger
                        .log_action(action, &format!("\"{description}\" matched on attempt {}", attempt + 1))
                        .await;
                    return Ok(());
                }
                ExpectOutcome::NoMatch | ExpectOutcome::Uncertain => {
                    tracing::debug!(
                        description = %description,
                        attempt = attempt + 1,
                        attempts,
                        "expect did not match"
                    );
                    if attempt < intervals.len() {
                        self.pause(intervals[attempt], token).await?;
                    }
                }
            }
        }

        Err(EngineError::ExpectExhausted {
            description: description.to_string(),
            attempts,
            last_response,
        })
    }

    /// Captures a screenshot, archives it and records its path.
    async fn observe(
        &self,
        ctx: &mut ExecutionContext,
        token: &CancellationToken,
        prefix: &str,
    ) -> EngineResult<Vec<u8>> {
        let png = self.controller.capture_screenshot(token).await?;
        if let Some(path) = self.logger.save_screenshot(&png, prefix).await {
            ctx.record_screenshot(path);
        }
        Ok(png)
    }

    async fn ask(
        &self,
        png: &[u8],
        prompt: &str,
        ctx: &mut ExecutionContext,
        token: &CancellationToken,
    ) -> EngineResult<VisionReply> {
        let reply = self.vision.send(png, prompt, token).await?;
        ctx.add_usage(&reply);
        Ok(reply)
    }

    /// Screenshot + locate round trip for one click target.
    async fn locate(
        &self,
        target: &str,
        ctx: &mut ExecutionContext,
        token: &CancellationToken,
    ) -> EngineResult<(u32, u32)> {
        let png = self.observe(ctx, token, "locate").await?;
        let reply = self
            .ask(&png, &prompts::locate_prompt(target), ctx, token)
            .await?;
        match parse_coordinate(&reply.text) {
            CoordinateReply::Found { x, y } => Ok((x, y)),
            CoordinateReply::NotFound { detail } => Err(EngineError::ElementNotFound {
                target: target.to_string(),
                detail,
            }),
        }
    }

    fn resolve(&self, value: &str, is_param: bool, ctx: &ExecutionContext) -> EngineResult<String> {
        if !is_param {
            return Ok(value.to_string());
        }
        ctx.resolve_value(value)
            .map(str::to_string)
            .ok_or_else(|| EngineError::MissingInput(value.to_string()))
    }

    async fn pause(&self, ms: u64, token: &CancellationToken) -> EngineResult<()> {
        if ms == 0 {
            return Ok(());
        }
        tokio::select! {
            _ = token.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
        }
    }
}

/// Matches caller keys to declared inputs case-insensitively and rekeys
/// them to the declared spelling; lookups past this point are strict.
fn normalize_parameters(
    task: &TaskDefinition,
    supplied: HashMap<String, String>,
) -> EngineResult<HashMap<String, String>> {
    let mut normalized = HashMap::with_capacity(supplied.len());
    let mut rest: Vec<(String, String)> = supplied.into_iter().collect();

    for input in &task.inputs {
        let position = rest
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(input))
            .ok_or_else(|| EngineError::MissingInput(input.clone()))?;
        let (_, value) = rest.swap_remove(position);
        normalized.insert(input.clone(), value);
    }

    // Extra parameters are allowed through unchanged; they are reachable
    // by `type`/`select` only via exact name match.
    for (key, value) in rest {
        normalized.insert(key, value);
    }
    Ok(normalized)
}
