//! Manifests written into the harness workspace.
//!
//! The harness owns only the file names and when they are written; the
//! documents themselves come from a [`ManifestTemplates`] implementation.

use std::path::{Path, PathBuf};

use crate::error::{HarnessError, Result};

/// File name of the implicit application manifest.
pub const APP_MANIFEST: &str = "app.yaml";
/// File name of the queue manifest, written only when queues are configured.
pub const QUEUE_MANIFEST: &str = "queue.yaml";

/// Produces the text of the workspace manifests.
pub trait ManifestTemplates: Send + Sync {
    /// Application manifest for `app_id`, declaring module `module`.
    fn app_manifest(&self, app_id: &str, module: &str) -> String;

    /// Queue manifest declaring every queue in `queues`.
    fn queue_manifest(&self, queues: &[String]) -> String;
}

/// The stock templates: a catch-all Go app and a fixed-rate queue per name.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTemplates;

impl ManifestTemplates for DefaultTemplates {
    fn app_manifest(&self, app_id: &str, module: &str) -> String {
        format!(
            "application: {app_id}\n\
             version: 1\n\
             runtime: go\n\
             api_version: go1\n\
             module: {module}\n\
             \n\
             handlers:\n\
             - url: /.*\n  script: _go_app\n"
        )
    }

    fn queue_manifest(&self, queues: &[String]) -> String {
        let mut out = String::from("total_storage_limit: 120M\nqueue:\n");
        for queue in queues {
            out.push_str(&format!("- name: {queue}\n  rate: 35/s\n"));
        }
        out
    }
}

/// Write the manifests into `workspace` and return the app manifest path.
pub fn write_manifests(
    templates: &dyn ManifestTemplates,
    workspace: &Path,
    app_id: &str,
    module: &str,
    queues: &[String],
) -> Result<PathBuf> {
    if !queues.is_empty() {
        let queue_path = workspace.join(QUEUE_MANIFEST);
        std::fs::write(&queue_path, templates.queue_manifest(queues))
            .map_err(|e| HarnessError::workspace(&queue_path, e))?;
    }

    let app_path = workspace.join(APP_MANIFEST);
    std::fs::write(&app_path, templates.app_manifest(app_id, module))
        .map_err(|e| HarnessError::workspace(&app_path, e))?;
    Ok(app_path)
}
