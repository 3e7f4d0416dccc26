//! Remedies — idempotent corrective actions mapped to failure patterns.
//!
//! Every remedy must be safe against an already-healthy daemon: detection
//! is not race-free against concurrent self-recovery, so applying a remedy
//! to a daemon that just fixed itself has to be a no-op or a benign
//! restart.

use crate::supervisor::daemon::{DaemonDescriptor, DaemonHandle};
use crate::supervisor::patterns::Observation;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

/// Everything a remedy may consult while applying itself.
pub struct RemedyContext<'a> {
    pub descriptor: &'a DaemonDescriptor,
    pub handle: &'a dyn DaemonHandle,
    pub observation: &'a Observation,
}

/// An idempotent corrective action.
#[async_trait]
pub trait Remedy: Send + Sync {
    /// Stable name recorded on heal events.
    fn name(&self) -> &str;

    /// Apply the remedy. Command success is distinct from whether the
    /// underlying condition is fixed — the supervisor verifies separately.
    async fn apply(&self, ctx: &RemedyContext<'_>) -> Result<()>;
}

// ============================================================================
// Built-in remedies
// ============================================================================

/// Plain restart through the daemon's start command.
#[derive(Debug, Default)]
pub struct RestartDaemon;

#[async_trait]
impl Remedy for RestartDaemon {
    fn name(&self) -> &str {
        "restart"
    }

    async fn apply(&self, ctx: &RemedyContext<'_>) -> Result<()> {
        ctx.handle.restart().await
    }
}

/// Remove the daemon's lock file if present, then restart.
///
/// Removing an already-absent lock is a no-op, which keeps this safe to
/// apply to a daemon that cleaned up on its own.
#[derive(Debug, Default)]
pub struct ClearStaleLock;

#[async_trait]
impl Remedy for ClearStaleLock {
    fn name(&self) -> &str {
        "clear_stale_lock"
    }

    async fn apply(&self, ctx: &RemedyContext<'_>) -> Result<()> {
        if let Some(lock_path) = &ctx.descriptor.lock_file {
            match tokio::fs::remove_file(lock_path).await {
                Ok(()) => {
                    info!(daemon = %ctx.descriptor.name, path = %lock_path.display(), "Removed stale lock file")
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to remove lock file {:?}", lock_path)
                    });
                }
            }
        }
        ctx.handle.restart().await
    }
}

/// Truncate oversized log files to their tail, freeing disk space.
///
/// Rotates `<name>.log` to `<name>.log.old` and keeps roughly the last
/// tenth of the content, so recent context survives the rotation.
#[derive(Debug)]
pub struct RotateLogs {
    /// Files larger than this are rotated (bytes).
    pub max_bytes: u64,
    /// Fraction of the file (from the end) kept after rotation.
    pub keep_ratio: f64,
}

impl Default for RotateLogs {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            keep_ratio: 0.1,
        }
    }
}

#[async_trait]
impl Remedy for RotateLogs {
    fn name(&self) -> &str {
        "rotate_logs"
    }

    async fn apply(&self, ctx: &RemedyContext<'_>) -> Result<()> {
        // Rotate next to the daemon's export/lock artifacts; without any
        // declared artifact there is nothing safe to rotate.
        let Some(dir) = ctx
            .descriptor
            .export_file
            .as_ref()
            .or(ctx.descriptor.lock_file.as_ref())
            .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        else {
            warn!(daemon = %ctx.descriptor.name, "No artifact directory declared — nothing to rotate");
            return Ok(());
        };

        let mut rotated = 0usize;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to read log directory {:?}", dir))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e != "log").unwrap_or(true) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.len() <= self.max_bytes {
                continue;
            }

            let contents = tokio::fs::read(&path).await?;
            let keep_from = contents
                .len()
                .saturating_sub((contents.len() as f64 * self.keep_ratio) as usize);
            let old_path = path.with_extension("log.old");
            tokio::fs::rename(&path, &old_path).await?;
            tokio::fs::write(&path, &contents[keep_from..]).await?;
            rotated += 1;
        }

        info!(daemon = %ctx.descriptor.name, rotated, dir = %dir.display(), "Log rotation complete");
        Ok(())
    }
}

/// Deliberately does nothing: the matched condition needs an operator.
///
/// Used for patterns (permission errors) where any automatic action would
/// be worse than surfacing the failure.
#[derive(Debug, Default)]
pub struct ManualIntervention;

#[async_trait]
impl Remedy for ManualIntervention {
    fn name(&self) -> &str {
        "manual_intervention"
    }

    async fn apply(&self, ctx: &RemedyContext<'_>) -> Result<()> {
        warn!(
            daemon = %ctx.descriptor.name,
            "Condition requires manual intervention — no automatic remedy applied"
        );
        Ok(())
    }
}

/// Run an arbitrary command as the remedy.
#[derive(Debug)]
pub struct CommandRemedy {
    name: String,
    command: Vec<String>,
}

impl CommandRemedy {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }
}

#[async_trait]
impl Remedy for CommandRemedy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, _ctx: &RemedyContext<'_>) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .context("remedy has an empty command")?;
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .with_context(|| format!("failed to run remedy command '{}'", program))?;
        if !status.success() {
            anyhow::bail!("remedy command '{}' exited with {}", program, status);
        }
        Ok(())
    }
}
