//! Response outputs.

use std::io::{self, Write};
use std::str::FromStr;

use tracing::Level;
use vox_core::{OutputPlugin, Params, Response, Result, VoxError};

use super::param_str;

/// Renders each response through `tracing` at a configured level.
#[derive(Debug)]
pub struct LogOutput {
    level: Level,
}

impl LogOutput {
    /// Params: `level` (`TRACE`..`ERROR`, default `INFO`).
    pub fn from_params(params: &Params) -> Result<Self> {
        let level = match param_str(params, "level")? {
            Some(raw) => Level::from_str(raw.trim())
                .map_err(|_| VoxError::Configuration(format!("unknown log level '{raw}'")))?,
            None => Level::INFO,
        };
        Ok(Self { level })
    }

    pub fn level(&self) -> Level {
        self.level
    }
}

impl OutputPlugin for LogOutput {
    fn deliver(&mut self, response: &Response) -> Result<()> {
        let text = response.render();
        let command_id = response.command;
        let status = response.status;
        match self.level {
            Level::TRACE => tracing::trace!(%command_id, ?status, "{text}"),
            Level::DEBUG => tracing::debug!(%command_id, ?status, "{text}"),
            Level::INFO => tracing::info!(%command_id, ?status, "{text}"),
            Level::WARN => tracing::warn!(%command_id, ?status, "{text}"),
            _ => tracing::error!(%command_id, ?status, "{text}"),
        }
        Ok(())
    }
}

/// Prints each response on stdout.
pub struct ConsoleOutput;

impl OutputPlugin for ConsoleOutput {
    fn deliver(&mut self, response: &Response) -> Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{}", response.render())?;
        out.flush()?;
        Ok(())
    }
}
