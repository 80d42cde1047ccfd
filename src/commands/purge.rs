use anyhow::Result;
use tracing::info;

use crate::cli::PurgeArgs;
use crate::commands::{acquire_admin_lock, open_stores, resolve_paths};
use crate::pipeline::moderation::purge_host;

pub fn run(args: PurgeArgs) -> Result<()> {
    let paths = resolve_paths(&args.store);
    let lock = acquire_admin_lock(&paths, args.lock_path.as_ref(), "purge")?;

    let mut stores = open_stores(&paths)?;
    let counts = purge_host(&mut stores, &args.host)?;
    drop(stores);
    lock.release()?;

    if counts.is_zero() {
        info!(host = %args.host, "nothing to purge");
    } else {
        info!(host = %args.host, rows = counts.total(), "purge completed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cli::StoreArgs;
    use crate::pipeline::error::PipelineError;
    use crate::pipeline::lock::RunLock;

    #[test]
    fn purge_refuses_to_run_while_the_run_lock_is_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StoreArgs {
            cache_root: dir.path().to_path_buf(),
            db_path: None,
            similarity_db_path: None,
        };
        let paths = resolve_paths(&store);
        let held = RunLock::acquire(&paths.lock_path, "run-live", Duration::from_secs(3600))
            .expect("lock");

        let err = run(PurgeArgs {
            store: store.clone(),
            host: "a.example".to_string(),
            lock_path: None,
        })
        .expect_err("purge must not run under a held lock");
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::LockHeld { holder, .. }) => assert_eq!(holder, "run-live"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!paths.production_db.exists());

        drop(held);
        run(PurgeArgs {
            store,
            host: "a.example".to_string(),
            lock_path: None,
        })
        .expect("purge after release");
        assert!(!paths.lock_path.exists());
    }
}
