pub mod check;
pub mod filter;
pub mod moderate;
pub mod purge;
pub mod run;
pub mod seed;
pub mod status;

use std::path::PathBuf;

use anyhow::Result;

use crate::cli::StoreArgs;
use crate::pipeline::config::{PipelineConfig, PipelinePaths};
use crate::pipeline::lock::RunLock;
use crate::pipeline::new_run_id;
use crate::store::Stores;

pub fn resolve_paths(args: &StoreArgs) -> PipelinePaths {
    let mut paths = PipelinePaths::under(&args.cache_root);
    if let Some(db_path) = &args.db_path {
        paths.production_db = db_path.clone();
    }
    if let Some(similarity_db_path) = &args.similarity_db_path {
        paths.similarity_db = similarity_db_path.clone();
    }
    paths
}

pub fn open_stores(paths: &PipelinePaths) -> Result<Stores> {
    Stores::open(&paths.production_db, &paths.similarity_db)
}

/// Takes the pipeline run lock for an admin write. Admin writes must not
/// interleave with the merge, index build or similarity stages of a run.
pub fn acquire_admin_lock(
    paths: &PipelinePaths,
    lock_path: Option<&PathBuf>,
    action: &str,
) -> Result<RunLock> {
    let lock_path = lock_path.unwrap_or(&paths.lock_path);
    let stale_after = PipelineConfig::new(&paths.cache_root).lock_stale_after;
    RunLock::acquire(lock_path, &format!("{action}-{}", new_run_id()), stale_after)
}
