//! Tablet mode control through the vendor tools.
//!
//! Tablets are reconfigured with `xsetwacom` (pointer mode) and `xinput`
//! (enable/disable), addressed by the tool identifier the detector looked
//! up. Both commands run behind the [`ModeCommandRunner`] seam so the
//! forward transforms and their restoration can be tested with a recording
//! fake instead of an X session.

use std::io;
use std::process::Command;
use std::sync::Arc;

use tracing::debug;

/// Seam for running the vendor command-line tools.
pub trait ModeCommandRunner: Send + Sync {
    /// Runs `program` with `args` and returns its stdout on success.
    ///
    /// # Errors
    ///
    /// Returns the spawn error, or an error carrying stderr when the
    /// command exits non-zero.
    fn run(&self, program: &str, args: &[&str]) -> io::Result<String>;
}

/// Production runner: spawns the real processes.
pub struct SystemCommandRunner;

impl ModeCommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<String> {
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "{program} exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Mode controller for one tablet.
#[derive(Clone)]
pub struct TabletControl {
    tool_id: String,
    runner: Arc<dyn ModeCommandRunner>,
}

impl TabletControl {
    pub fn new(tool_id: impl Into<String>, runner: Arc<dyn ModeCommandRunner>) -> Self {
        Self {
            tool_id: tool_id.into(),
            runner,
        }
    }

    /// The current pointer mode (`"Absolute"` or `"Relative"`), when the
    /// tool can report it.
    pub fn current_mode(&self) -> Option<String> {
        let out = self
            .runner
            .run("xsetwacom", &["--get", &self.tool_id, "Mode"])
            .ok()?;
        let mode = out.trim();
        if mode.is_empty() {
            None
        } else {
            Some(mode.to_string())
        }
    }

    /// Sets the pointer mode.
    ///
    /// # Errors
    ///
    /// Propagates the tool failure.
    pub fn set_mode(&self, mode: &str) -> io::Result<()> {
        debug!(tool = %self.tool_id, mode, "setting tablet mode");
        self.runner
            .run("xsetwacom", &["--set", &self.tool_id, "Mode", mode])
            .map(|_| ())
    }

    /// Detaches the tablet from the local pointer.
    ///
    /// # Errors
    ///
    /// Propagates the tool failure.
    pub fn disable_local(&self) -> io::Result<()> {
        debug!(tool = %self.tool_id, "disabling local input");
        self.runner.run("xinput", &["disable", &self.tool_id]).map(|_| ())
    }

    /// Re-attaches the tablet to the local pointer.
    ///
    /// # Errors
    ///
    /// Propagates the tool failure.
    pub fn enable_local(&self) -> io::Result<()> {
        debug!(tool = %self.tool_id, "re-enabling local input");
        self.runner.run("xinput", &["enable", &self.tool_id]).map(|_| ())
    }
}

/// Finds the vendor-tool identifier for a tablet by display name.
///
/// Tries `xsetwacom --list devices` first (lines look like
/// `Wacom Intuos S Pen stylus    id: 9   type: STYLUS`) and prefers the
/// stylus tool whose name shares a prefix with the device. Falls back to
/// `xinput list --name-only` and a wacom/pen substring match. Absence is
/// not an error; sharing still works, only the mode transforms are skipped.
pub fn lookup_tool_id(runner: &dyn ModeCommandRunner, display_name: &str) -> Option<String> {
    if let Ok(out) = runner.run("xsetwacom", &["--list", "devices"]) {
        let name_lower = display_name.to_lowercase();
        let mut fallback = None;
        for line in out.lines() {
            let Some((tool_name, rest)) = line.split_once("id:") else {
                continue;
            };
            let Some(id) = rest.split_whitespace().next().map(str::to_string) else {
                continue;
            };
            let tool_lower = tool_name.trim().to_lowercase();
            if tool_lower.starts_with(&name_lower) || name_lower.starts_with(&tool_lower) {
                return Some(id);
            }
            if line.contains("STYLUS") && fallback.is_none() {
                fallback = Some(id);
            }
        }
        if fallback.is_some() {
            return fallback;
        }
    }

    if let Ok(out) = runner.run("xinput", &["list", "--name-only"]) {
        for line in out.lines() {
            let lower = line.to_lowercase();
            if lower.contains("wacom") || lower.contains("pen") {
                return Some(line.trim().to_string());
            }
        }
    }
    None
}

// ── Tests ─────────────────────────────────────────────────────────────────────
