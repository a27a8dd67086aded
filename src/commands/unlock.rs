//! `watchctl unlock`

use anyhow::{Context as AnyhowContext, Result, bail};
use declarative::StateStore;

use super::Workspace;
use crate::Context;
use crate::ui;

pub fn run(ctx: &Context, force: bool) -> Result<()> {
    let workspace = Workspace::open(ctx)?;
    if unlock(&workspace.store, force)? {
        ui::success("Lock removed");
    } else {
        ui::info("State is not locked");
    }
    Ok(())
}

/// Remove the lock; returns whether a lock was present
fn unlock(store: &StateStore, force: bool) -> Result<bool> {
    let status = store.is_locked().context("Failed to inspect lock")?;
    if status.stale {
        return Ok(true);
    }
    if !status.locked {
        return Ok(false);
    }

    if !force {
        let holder = status.info.as_ref().map_or_else(
            || "an unknown process".to_string(),
            |info| format!("{} (pid {})", info.operation, info.pid),
        );
        bail!("State is locked by {holder}, which is still running. Use --force to remove it anyway.");
    }

    log::warn!("force-removing lock {}", store.lock_path().display());
    store.release_lock().context("Failed to remove lock")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unlock_without_lock() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        assert!(!unlock(&store, false).unwrap());
    }

    #[test]
    fn test_live_lock_needs_force() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let guard = store.acquire_lock("apply").unwrap();

        let err = unlock(&store, false).unwrap_err();
        assert!(err.to_string().contains("--force"));
        assert!(store.lock_path().exists());

        assert!(unlock(&store, true).unwrap());
        assert!(!store.lock_path().exists());
        drop(guard);
    }
}
