//! `taskpilot run` — Execute one task in-process and stream its events.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use taskpilot_agent::{Orchestrator, OrchestratorSettings, RunOutcome};
use taskpilot_core::event::{EventKind, RunEvent};
use taskpilot_core::model::GenerationConfig;
use taskpilot_core::registry::{NewRun, RunRegistry};
use taskpilot_security::Workspace;
use tracing::{debug, info};

use super::load_config;

/// Longest tool output echoed to the terminal per event.
const OUTPUT_PREVIEW_CHARS: usize = 400;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// The task to perform
    #[arg(required = true, num_args = 1..)]
    pub task: Vec<String>,

    /// Workspace root the agent may read and modify
    #[arg(short, long, default_value = ".")]
    pub workspace: PathBuf,

    /// Image whose text is extracted into the first prompt
    #[arg(long)]
    pub image: Option<PathBuf>,

    /// Step limit (1-200)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=200))]
    pub max_steps: Option<u32>,

    #[arg(long)]
    pub max_new_tokens: Option<u32>,

    #[arg(long)]
    pub temperature: Option<f32>,

    /// Override the coder model name
    #[arg(long)]
    pub coder_model: Option<String>,

    /// Disable the run_shell tool
    #[arg(long)]
    pub no_shell: bool,

    /// Ignore the attached image
    #[arg(long)]
    pub no_ocr: bool,

    /// Only print the final answer
    #[arg(short, long)]
    pub quiet: bool,
}

impl RunArgs {
    fn generation_config(&self, defaults: GenerationConfig) -> GenerationConfig {
        let mut config = defaults;
        if let Some(steps) = self.max_steps {
            config.step_limit = steps;
        }
        if let Some(tokens) = self.max_new_tokens {
            config.max_new_tokens = tokens;
        }
        if let Some(temperature) = self.temperature {
            config.temperature = temperature;
        }
        if let Some(model) = &self.coder_model {
            config.coder_model = model.clone();
        }
        config.allow_shell &= !self.no_shell;
        config.enable_ocr &= !self.no_ocr;
        config
    }
}

pub async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;

    let task = args.task.join(" ");
    if task.trim().is_empty() {
        return Err("task must not be empty".into());
    }
    let workspace = Workspace::open(&args.workspace)?;
    let generation = args.generation_config(config.generation_defaults());

    let model = taskpilot_providers::build_from_config(&config.model)?;
    let memory = taskpilot_gateway::session_memory(&config);
    let orchestrator = Arc::new(
        Orchestrator::new(model, memory).with_settings(OrchestratorSettings::from_config(&config)),
    );
    let registry = Arc::new(RunRegistry::new());

    let new_run = NewRun {
        task,
        workspace: workspace.root().to_path_buf(),
        image_path: args.image.clone(),
        config: generation,
    };

    let quiet = args.quiet;
    let outcome = execute(&registry, orchestrator, new_run, |event| {
        if !quiet && let Some(line) = render_event(event) {
            eprintln!("{line}");
        }
    })
    .await?;

    match outcome {
        RunOutcome::Completed { final_answer, .. } => {
            println!("{final_answer}");
            Ok(())
        }
        RunOutcome::Timeout { message } => {
            eprintln!("{message}");
            Ok(())
        }
        RunOutcome::Failed { message } => Err(message.into()),
    }
}

/// Start a run and feed its events to `on_event` until it finishes.
///
/// Ctrl-C cancels the run; the orchestrator then records the cancellation
/// as the terminal event.
pub async fn execute<F>(
    registry: &Arc<RunRegistry>,
    orchestrator: Arc<Orchestrator>,
    new_run: NewRun,
    mut on_event: F,
) -> Result<RunOutcome, Box<dyn std::error::Error>>
where
    F: FnMut(&RunEvent),
{
    let handle = registry.create_run(new_run);
    let id = handle.id().to_string();
    let mut ticks = registry.subscribe(&id).ok_or("run disappeared from registry")?;
    info!(run_id = %id, model = orchestrator.model_name(), "Run started");
    let task = orchestrator.spawn(handle);

    let interrupt = {
        let registry = registry.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                registry.cancel(&id);
            }
        })
    };

    let mut cursor = 0;
    'events: loop {
        let snapshot = registry.read_since(&id, cursor).ok_or("run disappeared from registry")?;
        cursor = snapshot.next_index;
        for event in &snapshot.events {
            on_event(event);
            if event.kind.is_terminal() {
                break 'events;
            }
        }
        if snapshot.status.is_terminal() || ticks.changed().await.is_err() {
            break;
        }
    }
    interrupt.abort();

    let outcome = task.await?;
    debug!(run_id = %id, events = cursor, "Run finished");
    Ok(outcome)
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

/// One terminal line per event, or `None` for events not worth showing.
pub fn render_event(event: &RunEvent) -> Option<String> {
    let line = match &event.kind {
        EventKind::RunStarted {
            task,
            step_limit,
            workspace,
            ..
        } => format!("▶ {task}\n  workspace: {workspace} (max {step_limit} steps)"),
        EventKind::MemoryContextUsed { memory_entries } => {
            format!("  using {memory_entries} remembered run(s)")
        }
        EventKind::OcrCompleted { chars } => format!("  extracted {chars} chars from image"),
        EventKind::StepDecision { step, thought, .. } if !thought.is_empty() => {
            format!("[{step}] {}", clip(thought, OUTPUT_PREVIEW_CHARS))
        }
        EventKind::StepDecision { .. } => return None,
        EventKind::ProgressUpdate {
            progress_pct,
            pattern,
            ..
        } => format!("  {progress_pct:>3}% {pattern}"),
        EventKind::ToolStarted { step, tool, args } => format!("[{step}] → {tool} {args}"),
        EventKind::ToolResult {
            tool,
            success,
            output,
            duration_ms,
            ..
        } => {
            let mark = if *success { "✓" } else { "✗" };
            format!(
                "  {mark} {tool} ({duration_ms} ms)\n{}",
                indent(&clip(output, OUTPUT_PREVIEW_CHARS))
            )
        }
        EventKind::FormatRetry { step, attempt, error } => {
            format!("[{step}] invalid decision (attempt {attempt}): {error}")
        }
        EventKind::RunTimeout { step_limit, .. } => format!("■ stopped after {step_limit} steps"),
        EventKind::RunCompleted { step, .. } => format!("■ completed at step {step}"),
        EventKind::RunError { message } => format!("■ error: {message}"),
    };
    Some(line)
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
