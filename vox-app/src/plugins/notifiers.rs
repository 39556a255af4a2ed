//! Lifecycle and audit notifiers.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tracing::{debug, error, info, warn};
use vox_core::{Notification, NotifierPlugin, Params, Phase, Result};

use super::{param_str, required};

/// Writes notifications to the `tracing` log.
pub struct LogNotifier;

impl NotifierPlugin for LogNotifier {
    fn notify(&mut self, notification: &Notification) -> Result<()> {
        match notification {
            Notification::Lifecycle(ev) => {
                let detail = ev.detail.as_deref().unwrap_or("");
                match ev.phase {
                    Phase::Failed | Phase::TimedOut => {
                        warn!(component = %ev.component, phase = ?ev.phase, "{detail}")
                    }
                    Phase::Exhausted => {
                        error!(component = %ev.component, "restart budget exhausted: {detail}")
                    }
                    Phase::Ignored => debug!(component = %ev.component, "ignored {detail}"),
                    _ => info!(component = %ev.component, role = %ev.role, phase = ?ev.phase, "lifecycle"),
                }
            }
            Notification::Command(cmd) => {
                info!(command_id = %cmd.id, source = %cmd.source, text = %cmd.text, "command")
            }
            Notification::Response(resp) => {
                info!(command_id = %resp.command, status = ?resp.status, "response")
            }
        }
        Ok(())
    }
}

/// Appends each notification as one JSON line.
pub struct JsonlNotifier {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlNotifier {
    /// Params: `path` (required).
    pub fn from_params(params: &Params) -> Result<Self> {
        let path = required(param_str(params, "path")?, "path")?;
        Ok(Self {
            path: PathBuf::from(path),
            writer: None,
        })
    }
}

impl NotifierPlugin for JsonlNotifier {
    fn start(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        debug!(path = %self.path.display(), "jsonl notifier opened");
        Ok(())
    }

    fn notify(&mut self, notification: &Notification) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(vox_core::VoxError::plugin("jsonl notifier is not started"));
        };
        serde_json::to_writer(&mut *writer, notification)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
