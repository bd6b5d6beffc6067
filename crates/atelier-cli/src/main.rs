use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use atelier_contracts::config::{AtelierConfig, PersonaProfile};
use atelier_contracts::events::EventWriter;
use atelier_contracts::references::ReferenceSet;
use atelier_contracts::rotation::RotationStore;
use atelier_engine::loader::{extension_for_mime, load_reference_set};
use atelier_engine::{
    default_provider_registry, BatchItemResult, CancelToken, ContentRequest, GenerationOutcome,
    GenerationProvider, Pipeline,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "atelier-rs", version, about = "Persona image request composer")]
struct Cli {
    /// JSON config file; defaults plus environment overrides when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// JSONL event log.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the composed request without sending it (advances rotation).
    Compose(ComposeArgs),
    Generate(GenerateArgs),
    Batch(BatchArgs),
    #[command(subcommand)]
    State(StateCommand),
}

#[derive(Debug, Parser)]
struct ComposeArgs {
    #[arg(long)]
    persona: String,
    #[arg(long, default_value = "")]
    prompt: String,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    persona: String,
    #[arg(long, default_value = "")]
    prompt: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    provider: Option<String>,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    /// JSONL file of `{"persona": ..., "prompt": ...}` lines.
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    provider: Option<String>,
}

#[derive(Debug, Subcommand)]
enum StateCommand {
    Show {
        #[arg(long)]
        persona: String,
    },
    Reset {
        #[arg(long)]
        persona: String,
    },
}

struct Workspace {
    config: AtelierConfig,
    base_dir: PathBuf,
    events: EventWriter,
}

impl Workspace {
    fn load(config_path: Option<&Path>, events_path: Option<&Path>) -> Result<Self> {
        let config = AtelierConfig::load(config_path)?;
        let base_dir = config_path
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let events = match events_path {
            Some(path) => EventWriter::new(path, uuid::Uuid::new_v4().to_string()),
            None => EventWriter::detached(),
        };
        Ok(Self {
            config,
            base_dir,
            events,
        })
    }

    fn persona(&self, id: &str) -> Result<(PersonaProfile, ReferenceSet)> {
        let Some(profile) = self.config.persona(id) else {
            bail!("persona '{id}' is not configured");
        };
        let Some(persona) = self.config.personas.get(id) else {
            bail!("persona '{id}' is not configured");
        };
        let references = load_reference_set(&persona.references, &self.base_dir)
            .with_context(|| format!("failed loading references for persona '{id}'"))?;
        Ok((profile, references))
    }

    fn pipeline(&self, provider_override: Option<&str>) -> Result<Pipeline> {
        let name = provider_override.unwrap_or(self.config.provider.name.as_str());
        let registry = default_provider_registry(&self.config.provider);
        let provider: Arc<dyn GenerationProvider> = registry.get(name).with_context(|| {
            format!(
                "unknown provider '{name}' (available: {})",
                registry.names().join(", ")
            )
        })?;
        Ok(Pipeline::from_config(&self.config, provider).with_events(self.events.clone()))
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let workspace = Workspace::load(cli.config.as_deref(), cli.events.as_deref())?;
    match cli.command {
        Command::Compose(args) => run_compose(&workspace, args),
        Command::Generate(args) => run_generate(&workspace, args),
        Command::Batch(args) => run_batch(&workspace, args),
        Command::State(command) => run_state(&workspace, command),
    }
}

fn run_compose(workspace: &Workspace, args: ComposeArgs) -> Result<i32> {
    let (persona, references) = workspace.persona(&args.persona)?;
    let pipeline = workspace.pipeline(None)?;
    let request = pipeline.preview(&ContentRequest {
        persona: &persona,
        caller_text: &args.prompt,
        references: &references,
    })?;
    println!("{}", serde_json::to_string_pretty(&request.preview())?);
    Ok(0)
}

fn run_generate(workspace: &Workspace, args: GenerateArgs) -> Result<i32> {
    let (persona, references) = workspace.persona(&args.persona)?;
    let pipeline = workspace.pipeline(args.provider.as_deref())?;
    let outcome = pipeline.run(
        &ContentRequest {
            persona: &persona,
            caller_text: &args.prompt,
            references: &references,
        },
        &CancelToken::new(),
    )?;
    let artifact = write_artifact(&args.out, &outcome)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome_summary(&outcome, artifact.as_deref()))?
    );
    Ok(if outcome.is_success() { 0 } else { 2 })
}

fn run_batch(workspace: &Workspace, args: BatchArgs) -> Result<i32> {
    let raw = fs::read_to_string(&args.input)
        .with_context(|| format!("failed reading batch input {}", args.input.display()))?;
    let items = parse_batch_lines(&raw)?;

    let mut personas: BTreeMap<String, (PersonaProfile, ReferenceSet)> = BTreeMap::new();
    let mut summaries = Vec::new();
    let mut runnable: Vec<&BatchLine> = Vec::new();
    for item in &items {
        if !personas.contains_key(&item.persona) {
            match workspace.persona(&item.persona) {
                Ok(loaded) => {
                    personas.insert(item.persona.clone(), loaded);
                }
                Err(err) => {
                    log::warn!("skipping batch line {}: {err:#}", item.line);
                    summaries.push(json!({
                        "line": item.line,
                        "persona": item.persona,
                        "status": "failed",
                        "error": format!("{err:#}"),
                    }));
                    continue;
                }
            }
        }
        runnable.push(item);
    }

    let requests: Vec<ContentRequest<'_>> = runnable
        .iter()
        .filter_map(|item| {
            personas.get(&item.persona).map(|(persona, references)| ContentRequest {
                persona,
                caller_text: &item.prompt,
                references,
            })
        })
        .collect();
    let pipeline = workspace.pipeline(args.provider.as_deref())?;
    let reports = pipeline.run_batch(&requests, &CancelToken::new());

    let mut succeeded = 0usize;
    for report in &reports {
        let line = runnable
            .get(report.index)
            .map(|item| item.line)
            .unwrap_or_default();
        let summary = match &report.result {
            BatchItemResult::Completed(outcome) => {
                let (summary, ok) = completed_summary(&args.out, outcome);
                if ok {
                    succeeded += 1;
                }
                summary
            }
            BatchItemResult::Failed(err) => json!({
                "status": "failed",
                "error_kind": err.kind().map(|kind| kind.as_str()),
                "error": err.to_string(),
                "retryable": err.is_retryable(),
            }),
            BatchItemResult::Skipped => json!({"status": "skipped"}),
        };
        let mut summary = summary;
        if let Value::Object(map) = &mut summary {
            map.insert("line".to_string(), json!(line));
            map.insert("persona".to_string(), json!(report.persona_id));
        }
        summaries.push(summary);
    }

    summaries.sort_by_key(|row| row["line"].as_u64().unwrap_or_default());
    for summary in &summaries {
        println!("{}", serde_json::to_string(summary)?);
    }
    Ok(if succeeded == items.len() { 0 } else { 2 })
}

fn run_state(workspace: &Workspace, command: StateCommand) -> Result<i32> {
    let store = RotationStore::from_config(&workspace.config.rotation);
    let state = match command {
        StateCommand::Show { persona } => store.load(&persona),
        StateCommand::Reset { persona } => store
            .reset(&persona)
            .with_context(|| format!("failed resetting rotation for '{persona}'"))?,
    };
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchLine {
    line: usize,
    persona: String,
    prompt: String,
}

fn parse_batch_lines(raw: &str) -> Result<Vec<BatchLine>> {
    let mut items = Vec::new();
    for (idx, text) in raw.lines().enumerate() {
        let line = idx + 1;
        let text = text.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let value: Value = serde_json::from_str(text)
            .with_context(|| format!("batch line {line} is not valid JSON"))?;
        let Some(persona) = value
            .get("persona")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|persona| !persona.is_empty())
        else {
            bail!("batch line {line} has no persona");
        };
        let prompt = value
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default();
        items.push(BatchLine {
            line,
            persona: persona.to_string(),
            prompt: prompt.to_string(),
        });
    }
    Ok(items)
}

fn write_artifact(out_dir: &Path, outcome: &GenerationOutcome) -> Result<Option<PathBuf>> {
    let Some(payload) = outcome.payload.as_ref() else {
        return Ok(None);
    };
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed creating {}", out_dir.display()))?;
    let path = out_dir.join(format!(
        "{}-{}.{}",
        outcome.request.persona_id,
        outcome.request.request_id,
        extension_for_mime(&payload.mime_type)
    ));
    fs::write(&path, &payload.image_bytes)
        .with_context(|| format!("failed writing {}", path.display()))?;
    Ok(Some(path))
}

/// A batch item whose artifact cannot be written is reported as failed.
fn completed_summary(out_dir: &Path, outcome: &GenerationOutcome) -> (Value, bool) {
    match write_artifact(out_dir, outcome) {
        Ok(artifact) => (
            outcome_summary(outcome, artifact.as_deref()),
            outcome.is_success(),
        ),
        Err(err) => {
            log::warn!(
                "request {} produced no artifact: {err:#}",
                outcome.request.request_id
            );
            let mut summary = outcome_summary(outcome, None);
            if let Value::Object(map) = &mut summary {
                map.insert("status".to_string(), json!("failed"));
                map.insert("error_kind".to_string(), json!("artifact_write"));
                map.insert("error".to_string(), json!(format!("{err:#}")));
            }
            (summary, false)
        }
    }
}

fn outcome_summary(outcome: &GenerationOutcome, artifact: Option<&Path>) -> Value {
    json!({
        "status": outcome.status,
        "attempts": outcome.attempts,
        "backoff_waits": outcome.backoff_waits,
        "error_kind": outcome.last_error_kind,
        "error": outcome.last_error_message,
        "request_id": outcome.request.request_id,
        "vocabulary_tier": outcome.request.vocabulary_tier.as_str(),
        "prompt": outcome.request.prompt,
        "artifact": artifact.map(|path| path.display().to_string()),
        "seed": outcome.payload.as_ref().and_then(|payload| payload.seed),
    })
}
