//! The run orchestrator — drives one run from `run_started` to a terminal event.
//!
//! Each step asks the model for a decision, executes its actions through the
//! sandboxed [`ToolExecutor`], and feeds the results back as messages. Every
//! observable change is appended to the run's event log via its
//! [`RunHandle`], and the finished run is summarized into session memory.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use taskpilot_config::AppConfig;
use taskpilot_core::error::{FormatError, RunError};
use taskpilot_core::event::EventKind;
use taskpilot_core::message::Message;
use taskpilot_core::model::{GenerationConfig, ModelBackend};
use taskpilot_core::registry::{Closing, RunHandle};
use taskpilot_core::run::{Phase, RunRecord, RunStatus};
use taskpilot_memory::{MemoryEntry, MemoryStatus, SessionMemory};
use taskpilot_security::{CommandDenylist, Workspace};
use taskpilot_tools::{ShellTool, ToolExecutor};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::parser::{Decision, parse_decision, plain_text_answer};
use crate::progress::{Progress, ProgressInput, classify};
use crate::prompt::{
    DEFAULT_HISTORY_CHAR_BUDGET, FirstMessage, INITIAL_TREE_LIMIT, SYSTEM_PROMPT,
    format_retry_message, tool_feedback, trim_history,
};

pub const TIMEOUT_MESSAGE: &str =
    "Reached max steps without final answer. Run again with a higher max_steps or a narrower task.";

/// Tunables shared by every run.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Re-prompts per step after an unparsable reply (0 = none)
    pub max_format_retries: u32,
    pub history_char_budget: usize,
    pub memory_context_entries: usize,
    pub memory_context_chars: usize,
    pub shell_timeout: Duration,
    pub max_shell_timeout: Duration,
    pub output_char_limit: usize,
    pub extra_denylist: Vec<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_format_retries: 3,
            history_char_budget: DEFAULT_HISTORY_CHAR_BUDGET,
            memory_context_entries: 8,
            memory_context_chars: 5_000,
            shell_timeout: Duration::from_secs(45),
            max_shell_timeout: Duration::from_secs(600),
            output_char_limit: taskpilot_tools::DEFAULT_OUTPUT_CHAR_LIMIT,
            extra_denylist: Vec::new(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_format_retries: config.agent.max_format_retries,
            history_char_budget: config.agent.history_char_budget,
            memory_context_entries: config.memory.context_entries,
            memory_context_chars: config.memory.context_chars,
            shell_timeout: Duration::from_secs(config.tools.shell_timeout_secs),
            max_shell_timeout: Duration::from_secs(config.tools.max_shell_timeout_secs),
            output_char_limit: config.tools.output_char_limit,
            extra_denylist: config.tools.extra_denylist.clone(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { final_answer: String, step: u32 },
    Timeout { message: String },
    Failed { message: String },
}

impl RunOutcome {
    fn memory_status(&self) -> MemoryStatus {
        match self {
            RunOutcome::Completed { .. } => MemoryStatus::Completed,
            RunOutcome::Timeout { .. } => MemoryStatus::Timeout,
            RunOutcome::Failed { .. } => MemoryStatus::Error,
        }
    }

    /// Text remembered for this run.
    pub fn summary(&self) -> &str {
        match self {
            RunOutcome::Completed { final_answer, .. } => final_answer,
            RunOutcome::Timeout { message } | RunOutcome::Failed { message } => message,
        }
    }
}

/// Non-fatal ways the step loop can stop.
enum Finish {
    Answer { answer: String, step: u32 },
    StepsExhausted,
}

/// Mutable per-run bookkeeping.
#[derive(Default)]
struct StepState {
    step: u32,
    tools_executed: usize,
    progress: u8,
    patterns: Vec<Phase>,
    has_memory: bool,
}

/// Runs tasks against a model backend.
pub struct Orchestrator {
    model: Arc<dyn ModelBackend>,
    memory: Arc<SessionMemory>,
    settings: OrchestratorSettings,
    denylist: CommandDenylist,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn ModelBackend>, memory: Arc<SessionMemory>) -> Self {
        Self {
            model,
            memory,
            settings: OrchestratorSettings::default(),
            denylist: CommandDenylist::default(),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.denylist = CommandDenylist::with_extra(&settings.extra_denylist);
        self.settings = settings;
        self
    }

    pub fn with_max_format_retries(mut self, retries: u32) -> Self {
        self.settings.max_format_retries = retries;
        self
    }

    pub fn with_history_budget(mut self, chars: usize) -> Self {
        self.settings.history_char_budget = chars;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Run in a background task.
    ///
    /// A panic inside the run is caught and recorded as `run_error`, so the
    /// run still reaches a terminal state.
    pub fn spawn(self: Arc<Self>, handle: RunHandle) -> tokio::task::JoinHandle<RunOutcome> {
        let span = tracing::info_span!("run", run_id = %handle.id());
        tokio::spawn(
            async move {
                match AssertUnwindSafe(self.run(handle.clone())).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let detail = panic_message(panic.as_ref());
                        self.recover_from_panic(&handle, detail).await
                    }
                }
            }
            .instrument(span),
        )
    }

    async fn recover_from_panic(&self, handle: &RunHandle, detail: String) -> RunOutcome {
        let message = format!("internal error: {detail}");
        error!(run_id = %handle.id(), error = %message, "Run task panicked");

        let record = handle.record();
        let closed = handle.close(
            Closing::new(RunStatus::Error)
                .with_error(message.clone())
                .with_progress(record.progress_pct, Phase::Error)
                .with_event(EventKind::RunError {
                    message: message.clone(),
                }),
        );
        let outcome = RunOutcome::Failed { message };
        if closed {
            self.remember(handle, &record.task, &StepState::default(), &outcome).await;
        }
        outcome
    }

    /// Drive the run to a terminal state and record it in session memory.
    pub async fn run(&self, handle: RunHandle) -> RunOutcome {
        let record = handle.record();
        let config = &record.config;
        handle.mark_started();
        info!(
            run_id = %handle.id(),
            step_limit = config.step_limit,
            model = %self.model.name(),
            "Run started"
        );

        let memory_context = self
            .memory
            .render_context(
                self.settings.memory_context_entries,
                self.settings.memory_context_chars,
            )
            .await;

        let initial_phase = if memory_context.is_some() {
            Phase::PlanningWithMemory
        } else {
            Phase::Planning
        };
        handle.set_progress(0, initial_phase);
        handle.emit(EventKind::RunStarted {
            task: record.task.clone(),
            step_limit: config.step_limit,
            workspace: record.workspace.display().to_string(),
            image_path: record.image_path.as_ref().map(|p| p.display().to_string()),
            has_session_memory: memory_context.is_some(),
            coder_model: config.coder_model.clone(),
            lazy_load: config.lazy_load,
            sparse_load: config.sparse_load,
            max_gpu_memory_gib: config.max_gpu_memory_gib,
        });
        if let Some(ctx) = &memory_context {
            handle.emit(EventKind::MemoryContextUsed {
                memory_entries: ctx.entries,
            });
        }

        let mut state = StepState {
            has_memory: memory_context.is_some(),
            ..StepState::default()
        };
        let memory_text = memory_context.as_ref().map(|c| c.text.as_str());

        let outcome = match self.drive(&handle, &record, memory_text, &mut state).await {
            Ok(Finish::Answer { answer, step }) => {
                let progress = Progress::terminal(Phase::Completed, 100);
                let update = progress_event(&mut state, step, config.step_limit, progress);
                handle.close(
                    Closing::new(RunStatus::Completed)
                        .with_answer(Some(answer.clone()))
                        .with_progress(state.progress, progress.phase)
                        .with_event(update)
                        .with_event(EventKind::RunCompleted {
                            final_answer: answer.clone(),
                            step,
                        }),
                );
                info!(run_id = %handle.id(), step, "Run completed");
                RunOutcome::Completed {
                    final_answer: answer,
                    step,
                }
            }
            Ok(Finish::StepsExhausted) => {
                let progress = Progress::terminal(Phase::Timeout, 100);
                let update = progress_event(&mut state, config.step_limit, config.step_limit, progress);
                handle.close(
                    Closing::new(RunStatus::Completed)
                        .with_progress(state.progress, progress.phase)
                        .with_event(update)
                        .with_event(EventKind::RunTimeout {
                            message: TIMEOUT_MESSAGE.into(),
                            step_limit: config.step_limit,
                        }),
                );
                info!(run_id = %handle.id(), step_limit = config.step_limit, "Run reached step limit");
                RunOutcome::Timeout {
                    message: TIMEOUT_MESSAGE.into(),
                }
            }
            Err(err) => {
                let message = err.to_string();
                error!(run_id = %handle.id(), step = state.step, error = %message, "Run failed");
                let progress = Progress::terminal(Phase::Error, state.progress);
                handle.close(
                    Closing::new(RunStatus::Error)
                        .with_error(message.clone())
                        .with_progress(progress.percent, progress.phase)
                        .with_event(EventKind::RunError {
                            message: message.clone(),
                        }),
                );
                RunOutcome::Failed { message }
            }
        };

        self.remember(&handle, &record.task, &state, &outcome).await;
        outcome
    }

    async fn drive(
        &self,
        handle: &RunHandle,
        record: &RunRecord,
        memory_text: Option<&str>,
        state: &mut StepState,
    ) -> Result<Finish, RunError> {
        let config = &record.config;
        let cancel = handle.cancellation_token();
        let executor = self.executor_for(Workspace::open(&record.workspace)?, config);

        let ocr_text = match &record.image_path {
            Some(image) if config.enable_ocr => {
                Some(self.extract_image_text(handle, executor.workspace(), image).await?)
            }
            Some(_) => {
                debug!(run_id = %handle.id(), "OCR disabled; ignoring image");
                None
            }
            None => None,
        };

        let file_tree = {
            let executor = executor.clone();
            tokio::task::spawn_blocking(move || executor.file_tree(INITIAL_TREE_LIMIT))
                .await
                .map_err(|e| RunError::Internal(format!("file tree task failed: {e}")))?
        };
        let workspace_root = executor.workspace().root().display().to_string();
        let first = FirstMessage {
            task: &record.task,
            workspace_root: &workspace_root,
            file_tree: &file_tree,
            shell_enabled: executor.shell_enabled(),
            session_memory: memory_text,
            ocr_text: ocr_text.as_deref(),
        };
        let mut messages = vec![Message::system(SYSTEM_PROMPT), Message::user(first.render())];

        for step in 1..=config.step_limit {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            state.step = step;

            let decision = self
                .decide(handle, step, &mut messages, config, state.tools_executed)
                .await?;
            handle.emit(EventKind::StepDecision {
                step,
                thought: decision.thought.clone(),
                actions: decision.actions.clone(),
                final_answer: decision.final_answer.clone(),
            });

            if let Some(answer) = decision.final_answer {
                if !decision.actions.is_empty() {
                    debug!(
                        run_id = %handle.id(),
                        step,
                        skipped = decision.actions.len(),
                        "Final answer given; skipping pending actions"
                    );
                }
                return Ok(Finish::Answer { answer, step });
            }

            messages.push(Message::assistant(decision.raw_text));

            let mut step_tools = Vec::with_capacity(decision.actions.len());
            for action in &decision.actions {
                if cancel.is_cancelled() {
                    return Err(RunError::Cancelled);
                }
                let tool = action.tool_name();
                let args = action.args_json();
                handle.emit(EventKind::ToolStarted {
                    step,
                    tool,
                    args: args.clone(),
                });

                let result = until_cancelled(&cancel, executor.execute(action)).await??;
                state.tools_executed += 1;
                step_tools.push(tool);
                messages.push(Message::user(tool_feedback(&args, &result)));

                handle.emit(EventKind::ToolResult {
                    step,
                    tool,
                    args,
                    success: result.success,
                    output: result.output,
                    truncated: result.truncated,
                    duration_ms: result.duration_ms,
                    failure: result.failure,
                });
            }

            let progress = classify(&ProgressInput {
                step,
                step_limit: config.step_limit,
                tools_executed: state.tools_executed,
                step_tools: &step_tools,
                has_memory: state.has_memory,
            });
            debug!(
                run_id = %handle.id(),
                step,
                phase = %progress.phase,
                percent = progress.percent,
                "Step finished"
            );
            report_progress(handle, state, step, config.step_limit, progress);
        }

        Ok(Finish::StepsExhausted)
    }

    /// Ask the model for a decision, re-prompting on malformed output.
    async fn decide(
        &self,
        handle: &RunHandle,
        step: u32,
        messages: &mut Vec<Message>,
        config: &GenerationConfig,
        tools_executed: usize,
    ) -> Result<Decision, RunError> {
        let attempts = self.settings.max_format_retries.saturating_add(1);
        let cancel = handle.cancellation_token();
        let mut last_error = FormatError::EmptyDecision;

        for attempt in 1..=attempts {
            let history = trim_history(messages, self.settings.history_char_budget);
            debug!(
                run_id = %handle.id(),
                step,
                attempt,
                messages = history.len(),
                "Requesting decision"
            );
            let raw = until_cancelled(&cancel, self.model.generate(&history, config)).await??;

            match parse_decision(&raw) {
                Ok(decision) => return Ok(decision),
                Err(err) => {
                    if let Some(answer) = plain_text_answer(&raw, tools_executed) {
                        debug!(run_id = %handle.id(), step, "Accepting plain-text reply as final answer");
                        return Ok(Decision {
                            thought: String::new(),
                            actions: Vec::new(),
                            final_answer: Some(answer.clone()),
                            raw_text: answer,
                        });
                    }

                    let reason = err.to_string();
                    warn!(run_id = %handle.id(), step, attempt, error = %reason, "Invalid model decision");
                    handle.emit(EventKind::FormatRetry {
                        step,
                        attempt,
                        error: reason.clone(),
                    });
                    messages.push(Message::user(format_retry_message(&reason)));
                    last_error = err;
                }
            }
        }

        Err(RunError::FormatRetriesExhausted {
            step,
            attempts,
            last_error,
        })
    }

    async fn extract_image_text(
        &self,
        handle: &RunHandle,
        workspace: &Workspace,
        image: &Path,
    ) -> Result<String, RunError> {
        let resolved = workspace.resolve(&image.to_string_lossy())?;
        debug!(run_id = %handle.id(), image = %resolved.display(), "Extracting image text");

        let cancel = handle.cancellation_token();
        let text = until_cancelled(&cancel, self.model.extract_text_from_image(&resolved))
            .await?
            .map_err(RunError::Ocr)?;

        handle.emit(EventKind::OcrCompleted {
            chars: text.chars().count(),
        });
        Ok(text)
    }

    fn executor_for(&self, workspace: Workspace, config: &GenerationConfig) -> ToolExecutor {
        let shell = ShellTool::new(self.settings.shell_timeout)
            .with_max_timeout(self.settings.max_shell_timeout)
            .with_denylist(self.denylist.clone())
            .with_enabled(config.allow_shell);
        ToolExecutor::new(workspace)
            .with_shell(shell)
            .with_output_limit(self.settings.output_char_limit)
    }

    async fn remember(&self, handle: &RunHandle, task: &str, state: &StepState, outcome: &RunOutcome) {
        let mut entry = MemoryEntry {
            run_id: handle.id().to_string(),
            status: outcome.memory_status(),
            task: task.to_string(),
            patterns: Vec::new(),
            outcome: outcome.summary().to_string(),
            finished_at: Utc::now(),
        };
        for phase in &state.patterns {
            entry.push_pattern(*phase);
        }

        if let Err(e) = self.memory.append(entry).await {
            warn!(run_id = %handle.id(), error = %e, "Failed to persist session memory");
        }
    }
}

/// Fold `progress` into the run's bookkeeping and build its `progress_update`.
fn progress_event(state: &mut StepState, step: u32, step_limit: u32, progress: Progress) -> EventKind {
    state.progress = state.progress.max(progress.percent);
    if !state.patterns.contains(&progress.phase) {
        state.patterns.push(progress.phase);
    }
    EventKind::ProgressUpdate {
        step,
        step_limit,
        progress_pct: state.progress,
        pattern: progress.phase,
        tools_executed: state.tools_executed,
    }
}

/// Emit a mid-run `progress_update` and mirror it onto the run record.
fn report_progress(
    handle: &RunHandle,
    state: &mut StepState,
    step: u32,
    step_limit: u32,
    progress: Progress,
) {
    let update = progress_event(state, step, step_limit, progress);
    handle.set_progress(state.progress, progress.phase);
    handle.emit(update);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, RunError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RunError::Cancelled),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedModel, action_json, answer_json};
    use serde_json::json;
    use taskpilot_core::error::ModelError;
    use taskpilot_core::registry::{NewRun, RunRegistry};
    use taskpilot_core::tool::ToolFailure;
    use taskpilot_memory::Order;

    struct Harness {
        dir: tempfile::TempDir,
        registry: RunRegistry,
        memory: Arc<SessionMemory>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                registry: RunRegistry::new(),
                memory: Arc::new(SessionMemory::default()),
            }
        }

        fn handle(&self, config: GenerationConfig, image: Option<&str>) -> RunHandle {
            self.registry.create_run(NewRun {
                task: "do the thing".into(),
                workspace: self.dir.path().canonicalize().unwrap(),
                image_path: image.map(Into::into),
                config,
            })
        }

        fn orchestrator(&self, model: Arc<ScriptedModel>) -> Orchestrator {
            Orchestrator::new(model, self.memory.clone())
        }

        fn event_types(&self, id: &str) -> Vec<&'static str> {
            self.registry
                .read_since(id, 0)
                .unwrap()
                .events
                .iter()
                .map(|e| e.kind.type_name())
                .collect()
        }
    }

    fn config(step_limit: u32) -> GenerationConfig {
        GenerationConfig {
            step_limit,
            ..GenerationConfig::default()
        }
    }

    #[tokio::test]
    async fn final_answer_on_first_step() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec![&answer_json("4")]));
        let handle = h.handle(config(5), None);

        let outcome = h.orchestrator(model.clone()).run(handle.clone()).await;
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                final_answer: "4".into(),
                step: 1
            }
        );

        assert_eq!(
            h.event_types(handle.id()),
            vec!["run_started", "step_decision", "progress_update", "run_completed"]
        );
        let snap = h.registry.read_since(handle.id(), 0).unwrap();
        assert_eq!(snap.status, RunStatus::Completed);
        assert_eq!(snap.progress_pct, 100);
        assert_eq!(snap.phase, Phase::Completed);
        assert_eq!(snap.final_answer.as_deref(), Some("4"));
        assert_eq!(model.call_count(), 1);

        let remembered = h.memory.recent(10, Order::OldestFirst).await;
        assert_eq!(remembered.len(), 1);
        assert_eq!(remembered[0].status, MemoryStatus::Completed);
        assert_eq!(remembered[0].outcome, "4");
    }

    #[tokio::test]
    async fn tool_results_feed_back_into_history() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec![
            &action_json("write_file", json!({"path": "notes/todo.md", "content": "- ship it\n"})),
            &answer_json("wrote the file"),
        ]));
        let handle = h.handle(config(5), None);

        let outcome = h.orchestrator(model.clone()).run(handle.clone()).await;
        assert!(matches!(outcome, RunOutcome::Completed { step: 2, .. }));
        assert_eq!(
            std::fs::read_to_string(h.dir.path().join("notes/todo.md")).unwrap(),
            "- ship it\n"
        );

        assert_eq!(
            h.event_types(handle.id()),
            vec![
                "run_started",
                "step_decision",
                "tool_started",
                "tool_result",
                "progress_update",
                "step_decision",
                "progress_update",
                "run_completed",
            ]
        );

        let second_call = &model.seen()[1];
        let feedback = &second_call.last().unwrap().content;
        assert!(feedback.starts_with("TOOL_RESULT\ntool=write_file"));

        let remembered = h.memory.recent(1, Order::NewestFirst).await;
        assert_eq!(remembered[0].patterns, vec![Phase::Editing, Phase::Completed]);
    }

    #[tokio::test]
    async fn unparseable_output_exhausts_retries() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec!["I refuse to speak JSON"]));
        let handle = h.handle(config(5), None);

        let outcome = h
            .orchestrator(model.clone())
            .with_max_format_retries(3)
            .run(handle.clone())
            .await;
        assert!(matches!(outcome, RunOutcome::Failed { .. }));

        let types = h.event_types(handle.id());
        assert_eq!(types.iter().filter(|t| **t == "format_retry").count(), 4);
        assert_eq!(types.iter().filter(|t| **t == "run_error").count(), 1);
        assert_eq!(types.last(), Some(&"run_error"));
        assert_eq!(model.call_count(), 4);

        let snap = h.registry.read_since(handle.id(), 0).unwrap();
        assert_eq!(snap.status, RunStatus::Error);
        assert!(snap.error.unwrap().contains("after 4 attempts"));

        let remembered = h.memory.recent(10, Order::OldestFirst).await;
        assert_eq!(remembered.len(), 1);
        assert_eq!(remembered[0].status, MemoryStatus::Error);
    }

    #[tokio::test]
    async fn one_retry_allows_a_second_attempt() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec!["garbage", &answer_json("ok")]));
        let handle = h.handle(config(3), None);

        let outcome = h
            .orchestrator(model.clone())
            .with_max_format_retries(1)
            .run(handle.clone())
            .await;
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                final_answer: "ok".into(),
                step: 1
            }
        );
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn zero_retries_fail_on_first_bad_reply() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec!["garbage", &answer_json("ok")]));
        let handle = h.handle(config(3), None);

        let outcome = h
            .orchestrator(model.clone())
            .with_max_format_retries(0)
            .run(handle.clone())
            .await;
        assert!(matches!(outcome, RunOutcome::Failed { ref message } if message.contains("after 1 attempts")));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn multibyte_fenced_reply_is_retried_not_fatal() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec!["```日本語```"]));
        let handle = h.handle(config(3), None);
        let orchestrator = Arc::new(h.orchestrator(model.clone()).with_max_format_retries(1));

        let outcome = orchestrator.spawn(handle.clone()).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { ref message } if message.contains("not a valid decision")));
        assert_eq!(model.call_count(), 2);

        let types = h.event_types(handle.id());
        assert_eq!(types.iter().filter(|t| **t == "format_retry").count(), 2);
        assert_eq!(types.last(), Some(&"run_error"));
        assert_eq!(h.registry.get(handle.id()).unwrap().status, RunStatus::Error);
        assert_eq!(h.memory.len().await, 1);
    }

    #[tokio::test]
    async fn panicking_backend_still_ends_the_run() {
        struct PanickingModel;

        #[async_trait::async_trait]
        impl ModelBackend for PanickingModel {
            fn name(&self) -> &str {
                "panicking"
            }

            async fn generate(
                &self,
                _messages: &[Message],
                _config: &GenerationConfig,
            ) -> Result<String, ModelError> {
                panic!("backend exploded")
            }
        }

        let h = Harness::new();
        let handle = h.handle(config(3), None);
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(PanickingModel), h.memory.clone()));

        let outcome = orchestrator.spawn(handle.clone()).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                message: "internal error: backend exploded".into()
            }
        );

        let snap = h.registry.read_since(handle.id(), 0).unwrap();
        assert_eq!(snap.status, RunStatus::Error);
        assert_eq!(snap.phase, Phase::Error);
        assert_eq!(snap.error.as_deref(), Some("internal error: backend exploded"));
        assert!(snap.events.last().unwrap().kind.is_terminal());
        assert_eq!(h.event_types(handle.id()).last(), Some(&"run_error"));

        let remembered = h.memory.recent(10, Order::OldestFirst).await;
        assert_eq!(remembered.len(), 1);
        assert_eq!(remembered[0].status, MemoryStatus::Error);
    }

    #[tokio::test]
    async fn retry_prompt_carries_parse_error() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec!["no json here", &answer_json("ok")]));
        let handle = h.handle(config(3), None);

        let outcome = h.orchestrator(model.clone()).run(handle.clone()).await;
        assert!(matches!(outcome, RunOutcome::Completed { step: 1, .. }));

        let retry = &model.seen()[1];
        let last = &retry.last().unwrap().content;
        assert!(last.contains("Parse error:"));
        let types = h.event_types(handle.id());
        assert_eq!(types.iter().filter(|t| **t == "format_retry").count(), 1);
    }

    #[tokio::test]
    async fn step_limit_ends_with_timeout() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec![&action_json("list_files", json!({}))]));
        let handle = h.handle(config(2), None);

        let outcome = h.orchestrator(model.clone()).run(handle.clone()).await;
        assert_eq!(
            outcome,
            RunOutcome::Timeout {
                message: TIMEOUT_MESSAGE.into()
            }
        );

        let snap = h.registry.read_since(handle.id(), 0).unwrap();
        assert_eq!(snap.status, RunStatus::Completed);
        assert!(snap.final_answer.is_none());
        assert_eq!(snap.progress_pct, 100);
        assert_eq!(snap.phase, Phase::Timeout);
        assert_eq!(h.event_types(handle.id()).last(), Some(&"run_timeout"));

        let remembered = h.memory.recent(10, Order::OldestFirst).await;
        assert_eq!(remembered.len(), 1);
        assert_eq!(remembered[0].status, MemoryStatus::Timeout);
        assert_eq!(
            remembered[0].patterns,
            vec![Phase::Discovery, Phase::WrapUp, Phase::Timeout]
        );
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec![
            &action_json("list_files", json!({})),
            &action_json("read_file", json!({"path": "missing.txt"})),
            &answer_json("done"),
        ]));
        let handle = h.handle(config(4), None);
        h.orchestrator(model).run(handle.clone()).await;

        let percents: Vec<u8> = h
            .registry
            .read_since(handle.id(), 0)
            .unwrap()
            .events
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::ProgressUpdate { progress_pct, .. } => Some(progress_pct),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![25, 50, 100]);
    }

    #[tokio::test]
    async fn plain_text_after_tools_is_accepted() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec![
            &action_json("list_files", json!({"path": "."})),
            "The workspace is empty, nothing to change.",
        ]));
        let handle = h.handle(config(5), None);

        let outcome = h.orchestrator(model).run(handle.clone()).await;
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                final_answer: "The workspace is empty, nothing to change.".into(),
                step: 2
            }
        );
        assert!(!h.event_types(handle.id()).contains(&"format_retry"));
    }

    #[tokio::test]
    async fn pending_actions_are_skipped_with_final_answer() {
        let h = Harness::new();
        let raw = json!({
            "thought": "",
            "actions": [{"tool": "write_file", "args": {"path": "late.txt", "content": "x"}}],
            "final_answer": "already done",
        })
        .to_string();
        let model = Arc::new(ScriptedModel::new(vec![&raw]));
        let handle = h.handle(config(5), None);

        h.orchestrator(model).run(handle.clone()).await;
        assert!(!h.dir.path().join("late.txt").exists());
        assert!(!h.event_types(handle.id()).contains(&"tool_started"));
    }

    #[tokio::test]
    async fn model_error_is_fatal() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::with_results(vec![Err(ModelError::Timeout(
            "backend stalled".into(),
        ))]));
        let handle = h.handle(config(5), None);

        let outcome = h.orchestrator(model.clone()).run(handle.clone()).await;
        let RunOutcome::Failed { message } = outcome else {
            panic!("expected failure");
        };
        assert!(message.contains("model generation failed"));
        assert_eq!(model.call_count(), 1);
        assert_eq!(h.registry.get(handle.id()).unwrap().status, RunStatus::Error);
    }

    #[tokio::test]
    async fn session_memory_is_injected() {
        let h = Harness::new();
        h.memory
            .append(MemoryEntry {
                run_id: "prev".into(),
                status: MemoryStatus::Completed,
                task: "earlier task".into(),
                patterns: vec![Phase::Discovery],
                outcome: "earlier outcome".into(),
                finished_at: Utc::now(),
            })
            .await
            .unwrap();

        let model = Arc::new(ScriptedModel::new(vec![&answer_json("ok")]));
        let handle = h.handle(config(3), None);
        h.orchestrator(model.clone()).run(handle.clone()).await;

        let events = h.registry.read_since(handle.id(), 0).unwrap().events;
        assert!(matches!(
            events[0].kind,
            EventKind::RunStarted {
                has_session_memory: true,
                ..
            }
        ));
        assert_eq!(events[1].kind, EventKind::MemoryContextUsed { memory_entries: 1 });

        let first_prompt = &model.seen()[0][1].content;
        assert!(first_prompt.contains("SESSION_MEMORY:\n[Run 1]"));
        assert!(first_prompt.contains("task=earlier task"));
        assert_eq!(h.memory.len().await, 2);
    }

    #[tokio::test]
    async fn loaded_memory_sets_initial_phase() {
        let h = Harness::new();
        h.memory
            .append(MemoryEntry {
                run_id: "prev".into(),
                status: MemoryStatus::Completed,
                task: "earlier task".into(),
                patterns: vec![],
                outcome: "earlier outcome".into(),
                finished_at: Utc::now(),
            })
            .await
            .unwrap();

        let model = Arc::new(
            ScriptedModel::new(vec![&answer_json("later")]).with_delay(Duration::from_secs(3600)),
        );
        let handle = h.handle(config(3), None);
        let mut ticks = h.registry.subscribe(handle.id()).unwrap();
        let task = Arc::new(h.orchestrator(model)).spawn(handle.clone());

        while h.registry.read_since(handle.id(), 0).unwrap().next_index < 2 {
            ticks.changed().await.unwrap();
        }
        let record = h.registry.get(handle.id()).unwrap();
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.phase, Phase::PlanningWithMemory);
        assert_eq!(record.progress_pct, 0);

        handle.cancellation_token().cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn progress_reaches_100_only_with_terminal_event() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec![
            &action_json("list_files", json!({})),
            &answer_json("done"),
        ]));
        let handle = h.handle(config(4), None);
        let mut ticks = h.registry.subscribe(handle.id()).unwrap();
        let task = Arc::new(h.orchestrator(model)).spawn(handle.clone());

        loop {
            let snap = h.registry.read_since(handle.id(), 0).unwrap();
            let terminal_logged = snap.events.iter().any(|e| e.kind.is_terminal());
            if snap.progress_pct == 100 {
                assert!(terminal_logged);
                assert_eq!(snap.status, RunStatus::Completed);
            }
            if snap.events.iter().any(|e| {
                matches!(e.kind, EventKind::ProgressUpdate { progress_pct: 100, .. })
            }) {
                assert!(terminal_logged);
            }
            if snap.status.is_terminal() {
                break;
            }
            ticks.changed().await.unwrap();
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn image_text_goes_into_first_prompt() {
        let h = Harness::new();
        std::fs::write(h.dir.path().join("shot.png"), b"png").unwrap();
        let model = Arc::new(
            ScriptedModel::new(vec![&answer_json("read it")]).with_ocr(Ok("# Heading".into())),
        );
        let handle = h.handle(config(3), Some("shot.png"));
        h.orchestrator(model.clone()).run(handle.clone()).await;

        let types = h.event_types(handle.id());
        assert_eq!(&types[..2], &["run_started", "ocr_completed"]);
        assert!(model.seen()[0][1].content.contains("OCR_CONTEXT:\n# Heading"));
    }

    #[tokio::test]
    async fn ocr_failure_and_escaping_image_are_fatal() {
        let h = Harness::new();
        std::fs::write(h.dir.path().join("shot.png"), b"png").unwrap();
        let failing = Arc::new(
            ScriptedModel::new(vec![&answer_json("x")])
                .with_ocr(Err(ModelError::NotConfigured("no ocr".into()))),
        );
        let handle = h.handle(config(3), Some("shot.png"));
        let outcome = h.orchestrator(failing.clone()).run(handle).await;
        assert!(matches!(outcome, RunOutcome::Failed { ref message } if message.contains("image text extraction")));
        assert_eq!(failing.call_count(), 0);

        let model = Arc::new(ScriptedModel::new(vec![&answer_json("x")]).with_ocr(Ok("t".into())));
        let handle = h.handle(config(3), Some("../outside.png"));
        let outcome = h.orchestrator(model).run(handle).await;
        assert!(matches!(outcome, RunOutcome::Failed { ref message } if message.contains("escapes")));
    }

    #[tokio::test]
    async fn ocr_disabled_skips_image() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec![&answer_json("fine")]));
        let cfg = GenerationConfig {
            enable_ocr: false,
            ..config(3)
        };
        let handle = h.handle(cfg, Some("missing.png"));
        let outcome = h.orchestrator(model).run(handle.clone()).await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert!(!h.event_types(handle.id()).contains(&"ocr_completed"));
    }

    #[tokio::test]
    async fn shell_respects_run_config() {
        let h = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec![
            &action_json("run_shell", json!({"command": "echo hi"})),
            &answer_json("ok"),
        ]));
        let cfg = GenerationConfig {
            allow_shell: false,
            ..config(3)
        };
        let handle = h.handle(cfg, None);
        h.orchestrator(model.clone()).run(handle.clone()).await;

        let events = h.registry.read_since(handle.id(), 0).unwrap().events;
        let failure = events.iter().find_map(|e| match &e.kind {
            EventKind::ToolResult { failure, .. } => Some(*failure),
            _ => None,
        });
        assert_eq!(failure, Some(Some(ToolFailure::Disabled)));
        assert!(!model.seen()[0][1].content.contains("run_shell("));
    }

    #[tokio::test]
    async fn cancellation_stops_a_waiting_run() {
        let h = Harness::new();
        let model = Arc::new(
            ScriptedModel::new(vec![&answer_json("too late")]).with_delay(Duration::from_secs(3600)),
        );
        let handle = h.handle(config(3), None);
        let orchestrator = Arc::new(h.orchestrator(model));
        let task = orchestrator.spawn(handle.clone());

        tokio::task::yield_now().await;
        handle.cancellation_token().cancel();

        let outcome = task.await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                message: "run cancelled".into()
            }
        );
        let snap = h.registry.read_since(handle.id(), 0).unwrap();
        assert_eq!(snap.status, RunStatus::Error);
        assert_eq!(snap.error.as_deref(), Some("run cancelled"));
        assert_eq!(h.memory.len().await, 1);
    }
}
