//! Virtual environment resolution
//!
//! Locates the `site-packages` directory of an existing virtualenv. The
//! environment itself is never created or modified.

use std::fs;
use std::path::{Path, PathBuf};

/// Errors for virtualenv resolution
#[derive(Debug, thiserror::Error)]
pub enum VenvError {
    #[error("no virtualenv found (looked in {0})")]
    NoVenv(String),

    #[error("virtualenv directory does not exist: {0}")]
    Missing(PathBuf),

    #[error("no site-packages directory under {0}")]
    NotFound(PathBuf),

    #[error("several Python versions under {venv}: {candidates:?}")]
    Ambiguous {
        venv: PathBuf,
        candidates: Vec<PathBuf>,
    },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Places a virtualenv may come from, highest precedence first
#[derive(Debug, Clone, Default)]
pub struct VenvSources {
    /// `--venv` on the command line
    pub cli: Option<PathBuf>,
    /// `layer.venv` from configuration
    pub config: Option<PathBuf>,
    /// `$VIRTUAL_ENV` of the calling shell
    pub virtual_env: Option<PathBuf>,
}

/// Pick the virtualenv directory to package
///
/// Explicit sources must exist. Without any, `<cwd>/.venv` is used when
/// present.
pub fn locate_venv(cwd: &Path, sources: &VenvSources) -> Result<PathBuf, VenvError> {
    let explicit = sources
        .cli
        .as_ref()
        .or(sources.config.as_ref())
        .or(sources.virtual_env.as_ref());

    if let Some(path) = explicit {
        let path = if path.is_absolute() {
            path.clone()
        } else {
            cwd.join(path)
        };
        if !path.is_dir() {
            return Err(VenvError::Missing(path));
        }
        return Ok(path);
    }

    let fallback = cwd.join(".venv");
    if fallback.is_dir() {
        Ok(fallback)
    } else {
        Err(VenvError::NoVenv(fallback.display().to_string()))
    }
}

/// The `site-packages` directory of `venv`
///
/// Accepts the POSIX layout (`lib/python3.X/site-packages`) and the
/// Windows layout (`Lib/site-packages`).
pub fn site_packages(venv: &Path) -> Result<PathBuf, VenvError> {
    if !venv.is_dir() {
        return Err(VenvError::Missing(venv.to_path_buf()));
    }

    let windows = venv.join("Lib").join("site-packages");
    if windows.is_dir() {
        return Ok(windows);
    }

    let lib = venv.join("lib");
    if !lib.is_dir() {
        return Err(VenvError::NotFound(venv.to_path_buf()));
    }

    let entries = fs::read_dir(&lib).map_err(|source| VenvError::Io {
        path: lib.clone(),
        source,
    })?;
    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| VenvError::Io {
            path: lib.clone(),
            source,
        })?;
        let name = entry.file_name();
        let is_python3 = name
            .to_str()
            .map(|n| n.starts_with("python3"))
            .unwrap_or(false);
        let site = entry.path().join("site-packages");
        if is_python3 && site.is_dir() {
            candidates.push(site);
        }
    }
    candidates.sort();

    match candidates.len() {
        0 => Err(VenvError::NotFound(venv.to_path_buf())),
        1 => Ok(candidates.remove(0)),
        _ => Err(VenvError::Ambiguous {
            venv: venv.to_path_buf(),
            candidates,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_posix_layout() {
        let dir = TempDir::new().unwrap();
        let site = dir.path().join("lib/python3.12/site-packages");
        fs::create_dir_all(&site).unwrap();

        assert_eq!(site_packages(dir.path()).unwrap(), site);
    }

    #[test]
    fn test_windows_layout() {
        let dir = TempDir::new().unwrap();
        let site = dir.path().join("Lib/site-packages");
        fs::create_dir_all(&site).unwrap();

        assert_eq!(site_packages(dir.path()).unwrap(), site);
    }

    #[test]
    fn test_missing_site_packages() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("lib/python3.11")).unwrap();

        assert!(matches!(
            site_packages(dir.path()),
            Err(VenvError::NotFound(_))
        ));
    }

    #[test]
    fn test_ambiguous_python_versions() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("lib/python3.11/site-packages")).unwrap();
        fs::create_dir_all(dir.path().join("lib/python3.12/site-packages")).unwrap();

        match site_packages(dir.path()) {
            Err(VenvError::Ambiguous { candidates, .. }) => assert_eq!(candidates.len(), 2),
            other => panic!("Expected Ambiguous, got {:?}", other),
        }
    }

    #[test]
    fn test_python2_ignored() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("lib/python2.7/site-packages")).unwrap();
        let site = dir.path().join("lib/python3.9/site-packages");
        fs::create_dir_all(&site).unwrap();

        assert_eq!(site_packages(dir.path()).unwrap(), site);
    }

    #[test]
    fn test_locate_precedence() {
        let dir = TempDir::new().unwrap();
        for name in ["cli", "conf", "env", ".venv"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }

        let mut sources = VenvSources {
            cli: Some(PathBuf::from("cli")),
            config: Some(PathBuf::from("conf")),
            virtual_env: Some(dir.path().join("env")),
        };
        assert_eq!(locate_venv(dir.path(), &sources).unwrap(), dir.path().join("cli"));

        sources.cli = None;
        assert_eq!(locate_venv(dir.path(), &sources).unwrap(), dir.path().join("conf"));

        sources.config = None;
        assert_eq!(locate_venv(dir.path(), &sources).unwrap(), dir.path().join("env"));

        sources.virtual_env = None;
        assert_eq!(locate_venv(dir.path(), &sources).unwrap(), dir.path().join(".venv"));
    }

    #[test]
    fn test_locate_missing() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            locate_venv(dir.path(), &VenvSources::default()),
            Err(VenvError::NoVenv(_))
        ));

        let sources = VenvSources {
            cli: Some(PathBuf::from("nope")),
            ..Default::default()
        };
        assert!(matches!(
            locate_venv(dir.path(), &sources),
            Err(VenvError::Missing(_))
        ));
    }
}
