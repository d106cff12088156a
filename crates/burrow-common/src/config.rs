//! Runtime configuration resolved from the process environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{APP_NAME, EPHEMERAL_DIR, FALLBACK_RUNTIME_PARENT, SYSTEM_LAYER_DIR};
use crate::error::{BurrowError, Result};

/// Where burrow keeps layers and per-container runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Layer storage. Relative overlay paths and per-container configuration
    /// files are resolved against it.
    pub layer_dir: PathBuf,
    /// Directory holding one pid record per named container.
    pub runtime_dir: PathBuf,
}

impl RuntimeConfig {
    /// Resolves the configuration from the process environment.
    ///
    /// `layer_override` (the `--layer` flag) wins over `$LAYERPATH`, which
    /// wins over the XDG data directory.
    #[must_use]
    pub fn from_env(layer_override: Option<PathBuf>) -> Self {
        Self::resolve(layer_override, |key| std::env::var_os(key).map(PathBuf::from))
    }

    /// Resolves the configuration with an explicit environment lookup.
    pub fn resolve(
        layer_override: Option<PathBuf>,
        env: impl Fn(&str) -> Option<PathBuf>,
    ) -> Self {
        let layer_dir = layer_override
            .or_else(|| env("LAYERPATH"))
            .or_else(|| env("XDG_DATA_HOME").map(|d| d.join(APP_NAME)))
            .or_else(|| env("HOME").map(|h| h.join(".local/share").join(APP_NAME)))
            .unwrap_or_else(|| PathBuf::from(SYSTEM_LAYER_DIR));

        let runtime_dir = env("XDG_RUNTIME_DIR")
            .unwrap_or_else(|| PathBuf::from(FALLBACK_RUNTIME_PARENT))
            .join(APP_NAME);

        Self {
            layer_dir,
            runtime_dir,
        }
    }

    /// Mount point of the ephemeral tmpfs layer.
    #[must_use]
    pub fn ephemeral_dir(&self) -> PathBuf {
        self.layer_dir.join(EPHEMERAL_DIR)
    }

    /// Resolves an overlay path given on the command line: absolute paths
    /// are kept, relative ones live under the layer storage.
    #[must_use]
    pub fn layer_path(&self, arg: &Path) -> PathBuf {
        if arg.is_absolute() {
            arg.to_path_buf()
        } else {
            self.layer_dir.join(arg)
        }
    }

    /// Creates the layer storage and its ephemeral mount point.
    ///
    /// # Errors
    ///
    /// Returns an error if either directory cannot be created.
    pub fn ensure_layer_dir(&self) -> Result<()> {
        for dir in [self.layer_dir.clone(), self.ephemeral_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| BurrowError::io(dir, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<PathBuf> {
        let owned: Vec<(String, PathBuf)> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), PathBuf::from(v)))
            .collect();
        move |key| owned.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn layer_flag_beats_environment() {
        let cfg = RuntimeConfig::resolve(
            Some("/srv/layers".into()),
            env_of(&[("LAYERPATH", "/env/layers")]),
        );
        assert_eq!(cfg.layer_dir, PathBuf::from("/srv/layers"));
    }

    #[test]
    fn layerpath_beats_xdg() {
        let cfg = RuntimeConfig::resolve(
            None,
            env_of(&[("LAYERPATH", "/env/layers"), ("XDG_DATA_HOME", "/xdg")]),
        );
        assert_eq!(cfg.layer_dir, PathBuf::from("/env/layers"));
    }

    #[test]
    fn falls_back_through_xdg_and_home() {
        let xdg = RuntimeConfig::resolve(None, env_of(&[("XDG_DATA_HOME", "/xdg")]));
        assert_eq!(xdg.layer_dir, PathBuf::from("/xdg/burrow"));

        let home = RuntimeConfig::resolve(None, env_of(&[("HOME", "/home/ada")]));
        assert_eq!(home.layer_dir, PathBuf::from("/home/ada/.local/share/burrow"));

        let none = RuntimeConfig::resolve(None, env_of(&[]));
        assert_eq!(none.layer_dir, PathBuf::from(SYSTEM_LAYER_DIR));
    }

    #[test]
    fn runtime_dir_prefers_xdg_runtime_dir() {
        let cfg = RuntimeConfig::resolve(None, env_of(&[("XDG_RUNTIME_DIR", "/run/user/1000")]));
        assert_eq!(cfg.runtime_dir, PathBuf::from("/run/user/1000/burrow"));

        let cfg = RuntimeConfig::resolve(None, env_of(&[]));
        assert_eq!(cfg.runtime_dir, PathBuf::from("/tmp/burrow"));
    }

    #[test]
    fn relative_layers_resolve_under_layer_dir() {
        let cfg = RuntimeConfig::resolve(Some("/layers".into()), env_of(&[]));
        assert_eq!(cfg.layer_path(Path::new("abc")), PathBuf::from("/layers/abc"));
        assert_eq!(cfg.layer_path(Path::new("/abs")), PathBuf::from("/abs"));
    }

    #[test]
    fn ensure_layer_dir_creates_ephemeral_mount_point() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = RuntimeConfig::resolve(Some(dir.path().join("layers")), env_of(&[]));
        cfg.ensure_layer_dir().expect("create");
        assert!(cfg.ephemeral_dir().is_dir());
        cfg.ensure_layer_dir().expect("idempotent");
    }
}
