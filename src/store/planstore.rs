//! Execution-plan persistence under `runs/<revision>-plan.json`, for audit
//! and re-application without recomputation.

use crate::core::types::ExecutionPlan;
use crate::store::{self, Store};

/// Persist a computed plan. Plans are immutable; saving the same revision
/// twice replaces an identical document.
pub fn save_plan(store: &dyn Store, project: &str, plan: &ExecutionPlan) -> Result<(), String> {
    let bytes =
        serde_json::to_vec_pretty(plan).map_err(|e| format!("plan serialize error: {}", e))?;
    store.write(&store::plan_path(project, plan.revision), &bytes)
}

/// Load a plan by `(project, revision)`. Returns `None` when no plan was
/// persisted for that revision.
pub fn load_plan(
    store: &dyn Store,
    project: &str,
    revision: u64,
) -> Result<Option<ExecutionPlan>, String> {
    let path = store::plan_path(project, revision);
    if !store.exists(&path) {
        return Ok(None);
    }
    let bytes = store.read(&path)?;
    let plan = serde_json::from_slice(&bytes).map_err(|e| format!("corrupt plan {}: {}", path, e))?;
    Ok(Some(plan))
}
