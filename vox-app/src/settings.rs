//! Where the manifest lives.
//!
//! Resolution order: first CLI argument, then `VOX_CONFIG`, then the
//! platform data directory.

use std::ffi::OsString;
use std::path::PathBuf;

pub const CONFIG_ENV: &str = "VOX_CONFIG";

/// Default `RUST_LOG`-style filter when the environment sets none.
pub const DEFAULT_LOG_FILTER: &str = "vox=info,vox_core=info,vox_app=info";

pub fn default_manifest_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Vox")
            .join("manifest.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("vox")
            .join("manifest.json")
    }
}

pub fn resolve_manifest_path(cli_arg: Option<OsString>) -> PathBuf {
    resolve_from(cli_arg, std::env::var_os(CONFIG_ENV))
}

fn resolve_from(cli_arg: Option<OsString>, env: Option<OsString>) -> PathBuf {
    cli_arg
        .filter(|a| !a.is_empty())
        .or_else(|| env.filter(|e| !e.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(default_manifest_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_argument_wins_over_environment() {
        let path = resolve_from(Some("cli.json".into()), Some("env.json".into()));
        assert_eq!(path, PathBuf::from("cli.json"));
    }

    #[test]
    fn environment_is_used_without_cli_argument() {
        let path = resolve_from(None, Some("env.json".into()));
        assert_eq!(path, PathBuf::from("env.json"));
    }

    #[test]
    fn empty_values_fall_back_to_data_dir() {
        let path = resolve_from(Some(OsString::new()), Some(OsString::new()));
        assert_eq!(path, default_manifest_path());
        assert!(path.ends_with("manifest.json"));
    }
}
