pub mod apply;
pub mod plan;
pub mod render;
pub mod status;
pub mod unlock;

use anyhow::{Context as AnyhowContext, Result};
use declarative::StateStore;
use std::path::PathBuf;

use crate::Context;
use crate::config::Config;
use crate::paths;

/// Root directory and state store every command works against
pub struct Workspace {
    pub root: PathBuf,
    pub store: StateStore,
}

impl Workspace {
    pub fn open(ctx: &Context) -> Result<Self> {
        let root = paths::root(ctx.root.as_deref())?;
        let store = StateStore::new(paths::state_dir(&root));
        Ok(Self { root, store })
    }

    /// Locate and load the configuration file
    pub fn load_config(&self, ctx: &Context) -> Result<Config> {
        let path = paths::config_file(&self.root, ctx.config.as_deref())?;
        Config::load(&path).context("Failed to load configuration")
    }
}
