//! CLI subcommands — init, validate, plan, set, run, status, events.
//!
//! A thin layer: each command parses its arguments and wires straight onto
//! the library calls (`compute_plan`, `apply`, `load_current`,
//! `append_input`, `stream_inputs`/`stream_artefacts`).

use crate::core::planner::{self, PlanContext, PlanRequest};
use crate::core::types::{InputEvent, InputState, Manifest};
use crate::core::{ident, parser, runner};
use crate::store::manifest::{self, ManifestError};
use crate::store::{eventlog, hasher, LocalStore, Store};
use clap::Subcommand;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new trama project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate and compile pipeline.yaml without touching state
    Validate {
        /// Path to pipeline.yaml
        #[arg(short, long, default_value = "pipeline.yaml")]
        file: PathBuf,
    },

    /// Show the execution plan for the current manifest
    Plan {
        /// Path to pipeline.yaml
        #[arg(short, long, default_value = "pipeline.yaml")]
        file: PathBuf,

        /// Project id (default: pipeline name)
        #[arg(short, long)]
        project: Option<String>,

        /// Condition configuration, key=json
        #[arg(short, long)]
        config: Vec<String>,

        /// Fan-out dimension size, dim=N
        #[arg(short, long)]
        dim: Vec<String>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Record an input edit
    Set {
        /// Input reference: canonical id, dotted path, or bare name
        input: String,

        /// New value (JSON; bare strings accepted)
        value: String,

        /// Path to pipeline.yaml
        #[arg(short, long, default_value = "pipeline.yaml")]
        file: PathBuf,

        /// Project id (default: pipeline name)
        #[arg(short, long)]
        project: Option<String>,

        /// Editor recorded on the event
        #[arg(long)]
        by: Option<String>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Plan and execute against the configured backend
    Run {
        /// Path to pipeline.yaml
        #[arg(short, long, default_value = "pipeline.yaml")]
        file: PathBuf,

        /// Project id (default: pipeline name)
        #[arg(short, long)]
        project: Option<String>,

        /// Condition configuration, key=json
        #[arg(short, long)]
        config: Vec<String>,

        /// Fan-out dimension size, dim=N
        #[arg(short, long)]
        dim: Vec<String>,

        /// Concurrency bound within a layer
        #[arg(long, default_value_t = 4)]
        jobs: usize,

        /// Compute and execute structurally without persisting
        #[arg(long)]
        dry_run: bool,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Show the current manifest
    Status {
        /// Project id
        #[arg(short, long)]
        project: String,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Replay the event log
    Events {
        /// Project id
        #[arg(short, long)]
        project: String,

        /// Show artefact events instead of input events
        #[arg(long)]
        artefacts: bool,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Plan { file, project, config, dim, state_dir } => {
            cmd_plan(&file, project.as_deref(), &config, &dim, &state_dir)
        }
        Commands::Set { input, value, file, project, by, state_dir } => {
            cmd_set(&input, &value, &file, project.as_deref(), by, &state_dir)
        }
        Commands::Run { file, project, config, dim, jobs, dry_run, state_dir } => {
            cmd_run(&file, project.as_deref(), &config, &dim, jobs, dry_run, &state_dir)
        }
        Commands::Status { project, state_dir } => cmd_status(&project, &state_dir),
        Commands::Events { project, artefacts, state_dir } => {
            cmd_events(&project, artefacts, &state_dir)
        }
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let doc_path = path.join("pipeline.yaml");
    if doc_path.exists() {
        return Err(format!("{} already exists", doc_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;

    let template = r#"version: "1.0"
name: my-pipeline
description: "Managed by trama"

blueprints:
  - id: movie
    nodes:
      - id: Topic
        kind: input_source
      - id: WriteScript
        kind: producer
      - id: Script
        kind: artifact
    edges:
      - from: Topic
        to: WriteScript
      - from: WriteScript
        to: Script

root: movie
"#;
    std::fs::write(&doc_path, template)
        .map_err(|e| format!("cannot write {}: {}", doc_path.display(), e))?;

    println!("Initialized trama project at {}", path.display());
    println!("  Created: {}", doc_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

/// Parse and validate a pipeline document, returning errors if invalid.
fn parse_and_validate(file: &Path) -> Result<parser::PipelineDoc, String> {
    let doc = parser::parse_pipeline_file(file)?;
    let errors = parser::validate_document(&doc);
    if errors.is_empty() {
        return Ok(doc);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err("validation failed".to_string())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let doc = parse_and_validate(file)?;
    let composition = parser::compile(&doc).map_err(|e| e.to_string())?;

    for warning in &composition.warnings {
        println!("  WARN: {}", warning);
    }
    println!(
        "OK: {} ({} nodes, {} edges)",
        doc.name,
        composition.graph.nodes.len(),
        composition.graph.edges.len()
    );
    Ok(())
}

fn parse_config_args(pairs: &[String]) -> Result<PlanContext, String> {
    let mut ctx = PlanContext::default();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{}'", pair))?;
        let value = serde_json::from_str(raw).unwrap_or(serde_json::Value::String(raw.to_string()));
        ctx.config.insert(key.to_string(), value);
    }
    Ok(ctx)
}

fn parse_dim_args(pairs: &[String], ctx: &mut PlanContext) -> Result<(), String> {
    for pair in pairs {
        let (dim, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected dim=N, got '{}'", pair))?;
        let size: usize = raw.parse().map_err(|_| format!("invalid dimension size '{}'", raw))?;
        ctx.dimensions.insert(dim.to_string(), size);
    }
    Ok(())
}

fn load_or_seed(store: &dyn Store, project: &str) -> Result<manifest::LoadedManifest, String> {
    match manifest::load_current(store, project) {
        Ok(loaded) => Ok(loaded),
        Err(ManifestError::NotFound { .. }) => Ok(manifest::LoadedManifest {
            manifest: Manifest::empty(&eventlog::now_iso8601()),
            hash: None,
        }),
        Err(e) => Err(e.to_string()),
    }
}

fn cmd_plan(
    file: &Path,
    project: Option<&str>,
    config: &[String],
    dims: &[String],
    state_dir: &Path,
) -> Result<(), String> {
    let doc = parse_and_validate(file)?;
    let composition = parser::compile(&doc).map_err(|e| e.to_string())?;
    let project = project.unwrap_or(&doc.name);

    let mut ctx = parse_config_args(config)?;
    parse_dim_args(dims, &mut ctx)?;

    let store = LocalStore::new(state_dir);
    let loaded = load_or_seed(&store, project)?;

    let plan = planner::compute_plan(&PlanRequest {
        graph: &composition.graph,
        manifest: &loaded.manifest,
        revision: loaded.manifest.revision + 1,
        edits: &IndexMap::new(),
        context: &ctx,
        manifest_hash: loaded.hash.as_deref(),
        created_at: &eventlog::now_iso8601(),
    })
    .map_err(|e| e.to_string())?;

    println!("Planning: {} (revision {} → {})", project, loaded.manifest.revision, plan.revision);
    println!();
    if plan.is_empty() {
        println!("Nothing to do — all artefacts current.");
        return Ok(());
    }
    for (i, layer) in plan.layers.iter().enumerate() {
        println!("layer {}:", i);
        for job in layer {
            println!("  + {}", job.job_id);
        }
    }
    println!();
    println!("Plan: {} job(s) in {} layer(s).", plan.job_count(), plan.layers.len());
    Ok(())
}

fn cmd_set(
    input: &str,
    value: &str,
    file: &Path,
    project: Option<&str>,
    by: Option<String>,
    state_dir: &Path,
) -> Result<(), String> {
    let doc = parse_and_validate(file)?;
    let composition = parser::compile(&doc).map_err(|e| e.to_string())?;
    let project = project.unwrap_or(&doc.name);

    let known: Vec<String> = composition.graph.input_ids();
    let id = ident::resolve(input, &known).map_err(|e| e.to_string())?;
    let payload =
        serde_json::from_str(value).unwrap_or(serde_json::Value::String(value.to_string()));

    let store = LocalStore::new(state_dir);
    let loaded = load_or_seed(&store, project)?;
    let revision = loaded.manifest.revision + 1;
    let now = eventlog::now_iso8601();
    let hash = hasher::hash_value(&payload)?;

    eventlog::append_input(
        &store,
        project,
        &InputEvent {
            id: id.clone(),
            revision,
            payload: payload.clone(),
            hash: hash.clone(),
            edited_by: by.clone(),
            created_at: now.clone(),
        },
    )?;

    let mut next = loaded.manifest.clone();
    next.base_revision = loaded.manifest.revision;
    next.revision = revision;
    next.created_at = now.clone();
    next.inputs.insert(
        id.clone(),
        InputState { hash, revision, payload, edited_by: by, updated_at: now },
    );
    manifest::save_manifest(&store, project, &next, loaded.hash.as_deref())
        .map_err(|e| e.to_string())?;

    println!("{} = {} (revision {})", id, value, revision);
    Ok(())
}

fn cmd_run(
    file: &Path,
    project: Option<&str>,
    config: &[String],
    dims: &[String],
    jobs: usize,
    dry_run: bool,
    state_dir: &Path,
) -> Result<(), String> {
    let doc = parse_and_validate(file)?;
    let composition = parser::compile(&doc).map_err(|e| e.to_string())?;
    let project = project.unwrap_or(&doc.name).to_string();

    let mut ctx = parse_config_args(config)?;
    parse_dim_args(dims, &mut ctx)?;

    let store = LocalStore::new(state_dir);
    let runtime = tokio::runtime::Runtime::new().map_err(|e| format!("runtime error: {}", e))?;

    // No provider integrations are wired at the CLI; the stub backend
    // records a structural pass. Real backends plug in via the library.
    let report = runtime.block_on(runner::apply(runner::ApplyOptions {
        store: &store,
        project: &project,
        graph: &composition.graph,
        edits: IndexMap::new(),
        edited_by: None,
        context: ctx,
        producer: None,
        max_concurrency: jobs,
        dry_run,
    }))?;

    if dry_run {
        println!("Dry run — nothing persisted.");
    }
    println!(
        "{}: revision {} — {} planned, {} succeeded, {} failed, {} skipped",
        report.status,
        report.revision,
        report.planned_jobs,
        report.jobs_succeeded,
        report.jobs_failed,
        report.jobs_skipped
    );
    Ok(())
}

fn cmd_status(project: &str, state_dir: &Path) -> Result<(), String> {
    let store = LocalStore::new(state_dir);
    let loaded = manifest::load_current(&store, project).map_err(|e| e.to_string())?;
    let m = &loaded.manifest;

    println!("{}: revision {} (base {}, {})", project, m.revision, m.base_revision, m.created_at);
    println!();
    println!("inputs:");
    for (id, state) in &m.inputs {
        println!("  {} @r{} {}", id, state.revision, state.hash);
    }
    println!("artefacts:");
    for (id, state) in &m.artefacts {
        println!("  {} {} @r{}", state.status, id, state.revision);
    }
    Ok(())
}

fn cmd_events(project: &str, artefacts: bool, state_dir: &Path) -> Result<(), String> {
    let store = LocalStore::new(state_dir);
    if artefacts {
        for event in eventlog::stream_artefacts(&store, project)? {
            let e = event?;
            println!("r{} {} {} ({})", e.revision, e.status, e.artefact_id, e.produced_by);
        }
    } else {
        for event in eventlog::stream_inputs(&store, project)? {
            let e = event?;
            println!(
                "r{} {} = {} by {}",
                e.revision,
                e.id,
                e.payload,
                e.edited_by.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}
