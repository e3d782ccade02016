//! Plan execution — layers run strictly in order against a pluggable
//! producer backend, with bounded concurrency inside each layer.
//!
//! A producer error never unwinds the run: it becomes a `failed` job
//! result, downstream jobs are recorded `skipped`, and unrelated branches
//! keep making progress. `apply` is the full orchestration: plan, persist
//! the plan, execute, append events, save the manifest with one
//! compare-and-swap retry.

use super::ident;
use super::planner::{self, PlanContext, PlanRequest};
use super::types::*;
use crate::store::manifest::{self, ManifestError};
use crate::store::{self, eventlog, hasher, planstore, Store};
use async_trait::async_trait;
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;

// ============================================================================
// Producer seam
// ============================================================================

/// Producer-side artifact payload: inline JSON, or raw bytes destined for
/// content-addressed blob storage.
#[derive(Debug, Clone)]
pub enum ArtifactPayload {
    Inline(serde_json::Value),
    Blob { bytes: Vec<u8>, mime_type: String },
}

/// One artifact returned by a producer.
#[derive(Debug, Clone)]
pub struct ProducedPayload {
    pub id: String,
    pub payload: ArtifactPayload,
}

/// Request handed to the producer backend for one job.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub job: JobDescriptor,
    pub revision: u64,
    pub layer: usize,
    pub attempt: u32,
    /// Input id → resolved value (input payloads, upstream artifact
    /// outputs, blob references).
    pub resolved_inputs: IndexMap<String, serde_json::Value>,
    pub produces: Vec<String>,
}

/// Outcome reported by the producer backend for one job.
#[derive(Debug, Clone)]
pub struct ProduceResult {
    pub status: JobStatus,
    pub artifacts: Vec<ProducedPayload>,
    pub diagnostics: Option<String>,
}

impl ProduceResult {
    pub fn succeeded(artifacts: Vec<ProducedPayload>) -> Self {
        Self { status: JobStatus::Succeeded, artifacts, diagnostics: None }
    }

    pub fn failed(diagnostics: &str) -> Self {
        Self { status: JobStatus::Failed, artifacts: Vec::new(), diagnostics: Some(diagnostics.to_string()) }
    }

    pub fn skipped() -> Self {
        Self { status: JobStatus::Skipped, artifacts: Vec::new(), diagnostics: None }
    }
}

/// The sole seam to the real or mocked provider backend. Retry and backoff
/// live behind this trait; the runner treats each call as one atomic
/// outcome.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self, request: ProduceRequest) -> Result<ProduceResult, String>;
}

/// Backend for structural dry runs: every job is skipped.
pub struct StubProducer;

#[async_trait]
impl Producer for StubProducer {
    async fn produce(&self, _request: ProduceRequest) -> Result<ProduceResult, String> {
        Ok(ProduceResult::skipped())
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Context for executing one plan.
pub struct RunContext<'a> {
    pub store: &'a dyn Store,
    pub project: &'a str,
    /// The manifest the plan was computed against.
    pub base: &'a Manifest,
    /// Input states current for the target revision (base inputs merged
    /// with pending edits, edits stamped with the target revision).
    pub inputs: IndexMap<String, InputState>,
    /// Concurrency bound within one layer.
    pub max_concurrency: usize,
}

/// A lazily foldable view over job outcomes.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: RunStatus,
    pub revision: u64,
    pub jobs: Vec<JobOutcome>,
    base: Manifest,
    inputs: IndexMap<String, InputState>,
}

impl RunResult {
    pub fn counts(&self) -> (u32, u32, u32) {
        let mut succeeded = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for job in &self.jobs {
            match job.status {
                JobStatus::Succeeded => succeeded += 1,
                JobStatus::Failed => failed += 1,
                JobStatus::Skipped => skipped += 1,
            }
        }
        (succeeded, failed, skipped)
    }

    /// Fold every succeeded job's artifacts into a manifest derived from
    /// the plan's base, stamping the target revision. Unaffected branches
    /// are copied forward untouched.
    pub fn build_manifest(&self, created_at: &str) -> Manifest {
        self.fold_into(&self.base, self.revision, created_at)
    }

    /// Fold onto an explicit base — used to rebase after a concurrent
    /// manifest write. Input edits carry the run's target revision and win;
    /// everything else defers to `base`.
    pub fn fold_into(&self, base: &Manifest, revision: u64, created_at: &str) -> Manifest {
        let mut out = base.clone();
        out.base_revision = base.revision;
        out.revision = revision;
        out.created_at = created_at.to_string();

        for (id, state) in &self.inputs {
            if state.revision == self.revision {
                let mut state = state.clone();
                state.revision = revision;
                out.inputs.insert(id.clone(), state);
            } else if !out.inputs.contains_key(id) {
                out.inputs.insert(id.clone(), state.clone());
            }
        }

        for outcome in &self.jobs {
            if outcome.status != JobStatus::Succeeded {
                continue;
            }
            for artifact in &outcome.artifacts {
                out.artefacts.insert(
                    artifact.id.clone(),
                    ArtefactState {
                        inputs_hash: outcome.job.inputs_hash().to_string(),
                        status: JobStatus::Succeeded,
                        output: artifact.output.clone(),
                        produced_by: outcome.job.producer.clone(),
                        revision,
                        created_at: created_at.to_string(),
                    },
                );
            }
        }
        out
    }
}

/// Resolve a job's declared inputs to concrete values: this-run outputs
/// first, then base-manifest artefacts, then input payloads.
fn resolve_inputs(
    job: &JobDescriptor,
    ctx: &RunContext<'_>,
    produced: &IndexMap<String, ArtefactOutput>,
) -> IndexMap<String, serde_json::Value> {
    let mut resolved = IndexMap::new();
    for input in &job.inputs {
        let value = if let Some(output) = produced.get(input) {
            output.as_value()
        } else if let Some(state) = ctx.base.artefacts.get(input) {
            state.output.as_value()
        } else if let Some(state) = ctx.inputs.get(input) {
            state.payload.clone()
        } else if let Some(state) = ctx.inputs.get(ident::base_id(input)) {
            state.payload.clone()
        } else {
            serde_json::Value::Null
        };
        resolved.insert(input.clone(), value);
    }
    resolved
}

/// Convert one producer response into a job outcome, persisting blob
/// payloads into content-addressed storage.
fn fold_outcome(
    job: &JobDescriptor,
    layer: usize,
    response: Result<ProduceResult, String>,
    ctx: &RunContext<'_>,
) -> JobOutcome {
    let result = match response {
        Ok(result) => result,
        Err(diagnostics) => {
            return JobOutcome {
                job: job.clone(),
                layer,
                attempt: 1,
                status: JobStatus::Failed,
                artifacts: Vec::new(),
                diagnostics: Some(diagnostics),
            };
        }
    };

    let mut artifacts = Vec::with_capacity(result.artifacts.len());
    for produced in result.artifacts {
        match produced.payload {
            ArtifactPayload::Inline(value) => artifacts.push(ProducedArtifact {
                id: produced.id,
                output: ArtefactOutput::inline(value),
            }),
            ArtifactPayload::Blob { bytes, mime_type } => {
                match store::write_blob(ctx.store, ctx.project, &bytes) {
                    Ok(hash) => artifacts.push(ProducedArtifact {
                        id: produced.id,
                        output: ArtefactOutput::Blob {
                            blob: BlobRef { hash, size: bytes.len() as u64, mime_type },
                        },
                    }),
                    Err(e) => {
                        return JobOutcome {
                            job: job.clone(),
                            layer,
                            attempt: 1,
                            status: JobStatus::Failed,
                            artifacts: Vec::new(),
                            diagnostics: Some(format!("blob write failed: {}", e)),
                        };
                    }
                }
            }
        }
    }

    JobOutcome {
        job: job.clone(),
        layer,
        attempt: 1,
        status: result.status,
        artifacts,
        diagnostics: result.diagnostics,
    }
}

/// Execute a plan's layers strictly in order. Jobs within a layer are
/// independent by construction and dispatched concurrently up to
/// `ctx.max_concurrency`. The run never aborts early: a failed job fails
/// the run status, a job missing its upstream artifact is skipped.
pub async fn execute(
    plan: &ExecutionPlan,
    ctx: &RunContext<'_>,
    producer: Arc<dyn Producer>,
) -> RunResult {
    let mut outcomes: Vec<JobOutcome> = Vec::new();
    let mut unavailable: FxHashSet<String> = FxHashSet::default();
    let mut produced: IndexMap<String, ArtefactOutput> = IndexMap::new();

    for (layer_index, layer) in plan.layers.iter().enumerate() {
        let semaphore = Arc::new(Semaphore::new(ctx.max_concurrency.max(1)));
        let mut layer_outcomes: Vec<Option<JobOutcome>> = (0..layer.len()).map(|_| None).collect();
        let mut handles = Vec::new();

        for (slot, job) in layer.iter().enumerate() {
            if job.inputs.iter().any(|i| unavailable.contains(i)) {
                layer_outcomes[slot] = Some(JobOutcome {
                    job: job.clone(),
                    layer: layer_index,
                    attempt: 0,
                    status: JobStatus::Skipped,
                    artifacts: Vec::new(),
                    diagnostics: Some("upstream artifact unavailable".to_string()),
                });
                continue;
            }

            let request = ProduceRequest {
                job: job.clone(),
                revision: plan.revision,
                layer: layer_index,
                attempt: 1,
                resolved_inputs: resolve_inputs(job, ctx, &produced),
                produces: job.produces.clone(),
            };
            let producer = Arc::clone(&producer);
            let semaphore = Arc::clone(&semaphore);
            handles.push((
                slot,
                tokio::spawn(async move {
                    match semaphore.acquire_owned().await {
                        Ok(_permit) => producer.produce(request).await,
                        Err(_) => Err("concurrency semaphore closed".to_string()),
                    }
                }),
            ));
        }

        // Layer barrier: collect every outcome before advancing.
        for (slot, handle) in handles {
            let response = match handle.await {
                Ok(response) => response,
                Err(e) => Err(format!("producer task aborted: {}", e)),
            };
            layer_outcomes[slot] = Some(fold_outcome(&layer[slot], layer_index, response, ctx));
        }

        for outcome in layer_outcomes.into_iter().flatten() {
            match outcome.status {
                JobStatus::Succeeded => {
                    for artifact in &outcome.artifacts {
                        produced.insert(artifact.id.clone(), artifact.output.clone());
                    }
                }
                JobStatus::Failed | JobStatus::Skipped => {
                    for id in &outcome.job.produces {
                        unavailable.insert(id.clone());
                    }
                }
            }
            outcomes.push(outcome);
        }
    }

    let status = if outcomes.iter().any(|o| o.status == JobStatus::Failed) {
        RunStatus::Failed
    } else {
        RunStatus::Succeeded
    };

    RunResult {
        status,
        revision: plan.revision,
        jobs: outcomes,
        base: ctx.base.clone(),
        inputs: ctx.inputs.clone(),
    }
}

// ============================================================================
// Apply orchestration
// ============================================================================

/// Configuration for a full apply: plan, execute, commit.
pub struct ApplyOptions<'a> {
    pub store: &'a dyn Store,
    pub project: &'a str,
    pub graph: &'a CanonicalGraph,
    /// Pending input edits: canonical input id → new payload.
    pub edits: IndexMap<String, serde_json::Value>,
    pub edited_by: Option<String>,
    pub context: PlanContext,
    /// Provider backend; absent means a structural run with the stub.
    pub producer: Option<Arc<dyn Producer>>,
    pub max_concurrency: usize,
    /// Compute and execute without persisting anything.
    pub dry_run: bool,
}

/// Summary of one apply.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub revision: u64,
    pub status: RunStatus,
    pub planned_jobs: usize,
    pub jobs_succeeded: u32,
    pub jobs_failed: u32,
    pub jobs_skipped: u32,
    /// Concurrency token of the saved manifest; `None` for dry runs.
    pub manifest_hash: Option<String>,
}

/// Plan against the current manifest, execute, append events, and save the
/// new manifest. A lost compare-and-swap is retried once on the reloaded
/// current state; a second loss is surfaced as fatal.
pub async fn apply(opts: ApplyOptions<'_>) -> Result<ApplyReport, String> {
    let now = eventlog::now_iso8601();

    let loaded = match manifest::load_current(opts.store, opts.project) {
        Ok(loaded) => loaded,
        Err(ManifestError::NotFound { .. }) => {
            manifest::LoadedManifest { manifest: Manifest::empty(&now), hash: None }
        }
        Err(e) => return Err(e.to_string()),
    };
    let revision = loaded.manifest.revision + 1;

    let plan = planner::compute_plan(&PlanRequest {
        graph: opts.graph,
        manifest: &loaded.manifest,
        revision,
        edits: &opts.edits,
        context: &opts.context,
        manifest_hash: loaded.hash.as_deref(),
        created_at: &now,
    })
    .map_err(|e| e.to_string())?;

    if !opts.dry_run {
        planstore::save_plan(opts.store, opts.project, &plan)?;
    }

    // Record edits and merge them over the base inputs.
    let mut inputs = loaded.manifest.inputs.clone();
    for (id, payload) in &opts.edits {
        let hash = hasher::hash_value(payload)?;
        let event = InputEvent {
            id: id.clone(),
            revision,
            payload: payload.clone(),
            hash: hash.clone(),
            edited_by: opts.edited_by.clone(),
            created_at: now.clone(),
        };
        if !opts.dry_run {
            eventlog::append_input(opts.store, opts.project, &event)?;
        }
        inputs.insert(
            id.clone(),
            InputState {
                hash,
                revision,
                payload: payload.clone(),
                edited_by: opts.edited_by.clone(),
                updated_at: now.clone(),
            },
        );
    }

    let producer = opts.producer.unwrap_or_else(|| Arc::new(StubProducer));
    let ctx = RunContext {
        store: opts.store,
        project: opts.project,
        base: &loaded.manifest,
        inputs,
        max_concurrency: opts.max_concurrency,
    };
    let run = execute(&plan, &ctx, producer).await;
    let (jobs_succeeded, jobs_failed, jobs_skipped) = run.counts();

    if !opts.dry_run {
        for outcome in &run.jobs {
            match outcome.status {
                JobStatus::Succeeded => {
                    for artifact in &outcome.artifacts {
                        let event = ArtefactEvent {
                            artefact_id: artifact.id.clone(),
                            revision,
                            inputs_hash: outcome.job.inputs_hash().to_string(),
                            output: artifact.output.clone(),
                            status: JobStatus::Succeeded,
                            produced_by: outcome.job.producer.clone(),
                            created_at: now.clone(),
                            diagnostics: None,
                        };
                        eventlog::append_artefact(opts.store, opts.project, &event)?;
                    }
                }
                JobStatus::Failed => {
                    for id in &outcome.job.produces {
                        let event = ArtefactEvent {
                            artefact_id: id.clone(),
                            revision,
                            inputs_hash: outcome.job.inputs_hash().to_string(),
                            output: ArtefactOutput::inline(serde_json::Value::Null),
                            status: JobStatus::Failed,
                            produced_by: outcome.job.producer.clone(),
                            created_at: now.clone(),
                            diagnostics: outcome.diagnostics.clone(),
                        };
                        eventlog::append_artefact(opts.store, opts.project, &event)?;
                    }
                }
                JobStatus::Skipped => {}
            }
        }
    }

    let manifest_hash = if opts.dry_run {
        None
    } else {
        let built = run.build_manifest(&now);
        match manifest::save_manifest(opts.store, opts.project, &built, loaded.hash.as_deref()) {
            Ok(hash) => Some(hash),
            Err(ManifestError::ConcurrentModification { .. }) => {
                // Reload-and-retry once; the rebased manifest keeps the
                // concurrent writer's state for everything we didn't touch.
                let current =
                    manifest::load_current(opts.store, opts.project).map_err(|e| e.to_string())?;
                let rebased =
                    run.fold_into(&current.manifest, current.manifest.revision + 1, &now);
                let hash =
                    manifest::save_manifest(opts.store, opts.project, &rebased, current.hash.as_deref())
                        .map_err(|e| format!("manifest save lost a second race: {}", e))?;
                Some(hash)
            }
            Err(e) => return Err(e.to_string()),
        }
    };

    Ok(ApplyReport {
        revision,
        status: run.status,
        planned_jobs: plan.job_count(),
        jobs_succeeded,
        jobs_failed,
        jobs_skipped,
        manifest_hash,
    })
}
