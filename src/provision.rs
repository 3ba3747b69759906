//! Idempotent namespace provisioning.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, info};

use crate::config::ReadinessPolicy;
use crate::error::{
    ConfigError, CreatePathSnafu, InvalidModeSnafu, InvalidTreeSnafu, ListTreeSnafu,
    MissingChildSnafu, NotDirectorySnafu, PermissionMismatchSnafu, ProvisionError,
    SetPermissionsSnafu, StorageNotReadySnafu,
};
use crate::readiness::{StorageProbe, await_ready};
use crate::storage::{Entry, StorageRef, join_path};

/// Root path, required children, and the permission mode applied to all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceTree {
    #[serde(default = "default_root")]
    pub root: String,
    /// Child names relative to `root`, created in any order.
    #[serde(default = "default_children")]
    pub children: Vec<String>,
    /// Octal permission string such as `"775"`.
    #[serde(default = "default_mode")]
    pub mode: String,
}

impl Default for NamespaceTree {
    fn default() -> Self {
        Self {
            root: default_root(),
            children: default_children(),
            mode: default_mode(),
        }
    }
}

fn default_root() -> String {
    "/pipeline".to_string()
}

fn default_children() -> Vec<String> {
    ["streaming", "imported", "raw", "aggregated"]
        .map(String::from)
        .to_vec()
}

fn default_mode() -> String {
    "775".to_string()
}

impl NamespaceTree {
    /// Parse `mode` as octal permission bits.
    pub fn mode_bits(&self) -> Result<u32, ConfigError> {
        let mode = self.mode.trim();
        let bits = u32::from_str_radix(mode, 8).ok().filter(|_| !mode.is_empty());
        match bits {
            Some(bits) if bits <= 0o7777 => Ok(bits),
            _ => InvalidModeSnafu {
                mode: self.mode.clone(),
            }
            .fail(),
        }
    }

    /// Absolute paths of every required child, in declaration order.
    pub fn child_paths(&self) -> Vec<String> {
        self.children
            .iter()
            .map(|c| c.trim().trim_matches('/'))
            .filter(|c| !c.is_empty())
            .map(|c| join_path(&self.root, c))
            .collect()
    }
}

/// Confirmed state of a provisioned tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedTree {
    pub root: String,
    /// Listing entry for every required child, in declaration order.
    pub children: Vec<Entry>,
}

/// Creates the namespace tree and confirms it by re-listing.
pub struct ResourceProvisioner {
    storage: StorageRef,
    readiness: ReadinessPolicy,
}

impl ResourceProvisioner {
    pub fn new(storage: StorageRef, readiness: ReadinessPolicy) -> Self {
        Self { storage, readiness }
    }

    /// Create `tree` if needed, apply its mode, and confirm every child.
    ///
    /// Safe to call repeatedly; existing paths are not an error. Any failing
    /// step aborts the call.
    pub async fn ensure_tree(&self, tree: &NamespaceTree) -> Result<ProvisionedTree, ProvisionError> {
        let mode = tree.mode_bits().context(InvalidTreeSnafu)?;
        let children = tree.child_paths();

        let probe = StorageProbe::new(self.storage.clone());
        await_ready(
            &probe,
            self.readiness.max_attempts,
            self.readiness.interval(),
        )
        .await
        .context(StorageNotReadySnafu)?;

        self.storage
            .mkdir_recursive(&tree.root)
            .await
            .context(CreatePathSnafu { path: &tree.root })?;

        try_join_all(children.iter().map(|path| async move {
            debug!(path = %path, "Creating directory");
            self.storage
                .mkdir_recursive(path)
                .await
                .context(CreatePathSnafu { path })
        }))
        .await?;

        self.storage
            .set_permissions(&tree.root, mode, true)
            .await
            .context(SetPermissionsSnafu { path: &tree.root })?;

        let confirmed = self.confirm(&tree.root, &children, mode).await?;
        info!(
            root = %tree.root,
            children = confirmed.len(),
            mode = %format!("{mode:o}"),
            "Namespace ready"
        );

        Ok(ProvisionedTree {
            root: tree.root.clone(),
            children: confirmed,
        })
    }

    /// Re-list the subtree and check each child independently of creation.
    async fn confirm(
        &self,
        root: &str,
        children: &[String],
        mode: u32,
    ) -> Result<Vec<Entry>, ProvisionError> {
        let listing = self
            .storage
            .list(root, true)
            .await
            .context(ListTreeSnafu { path: root })?;

        let mut confirmed = Vec::with_capacity(children.len());
        for path in children {
            let entry = listing
                .iter()
                .find(|e| &e.path == path)
                .context(MissingChildSnafu { path })?;
            ensure!(entry.is_dir, NotDirectorySnafu { path });
            ensure!(
                entry.mode & !mode == 0,
                PermissionMismatchSnafu {
                    path,
                    actual: entry.mode,
                    requested: mode,
                }
            );
            confirmed.push(entry.clone());
        }
        Ok(confirmed)
    }
}
