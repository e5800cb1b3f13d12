//! Locating the interpreter and the dev server script on the host.

use std::path::PathBuf;

use crate::error::{HarnessError, Result};

/// File name of the dev server script looked up on `PATH`.
pub const APP_SERVER_FILE_NAME: &str = "dev_appserver.py";

/// Environment variables that override the dev server lookup, in priority order.
pub const APP_SERVER_ENV_VARS: [&str; 2] = ["DEVHARNESS_DEV_APPSERVER", "APPENGINE_DEV_APPSERVER"];

/// Interpreter names tried in order; first hit wins.
pub const INTERPRETER_CANDIDATES: [&str; 2] = ["python2.7", "python"];

/// Resolved interpreter plus the server it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub interpreter: PathBuf,
    pub server: PathBuf,
}

impl Toolchain {
    /// Use explicit paths. Nothing is checked until the child is spawned.
    pub fn new(interpreter: impl Into<PathBuf>, server: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            server: server.into(),
        }
    }

    /// Discover both executables from the environment and `PATH`.
    pub fn discover() -> Result<Self> {
        let interpreter = find_interpreter(&INTERPRETER_CANDIDATES)?;
        let server = find_server(|name| std::env::var(name).ok())?;
        Ok(Self {
            interpreter,
            server,
        })
    }
}

/// First candidate found on `PATH`.
pub fn find_interpreter(candidates: &[&str]) -> Result<PathBuf> {
    let mut last_err = None;
    for name in candidates {
        match which::which(name) {
            Ok(path) => return Ok(path),
            Err(e) => last_err = Some(e),
        }
    }
    Err(HarnessError::DependencyNotFound {
        what: "python interpreter",
        detail: match last_err {
            Some(e) => format!("tried {}: {e}", candidates.join(", ")),
            None => "no candidates given".to_string(),
        },
    })
}

/// Dev server path: an env override (which must exist) beats `PATH`.
///
/// `lookup_env` is injected so tests do not have to mutate the process
/// environment.
pub fn find_server(lookup_env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    for var in APP_SERVER_ENV_VARS {
        if let Some(value) = lookup_env(var).filter(|v| !v.is_empty()) {
            let path = PathBuf::from(&value);
            if path.exists() {
                return Ok(path);
            }
            return Err(HarnessError::DependencyNotFound {
                what: "dev server",
                detail: format!("invalid {var} environment variable; path {value:?} doesn't exist"),
            });
        }
    }
    which::which(APP_SERVER_FILE_NAME).map_err(|e| HarnessError::DependencyNotFound {
        what: "dev server",
        detail: format!("{APP_SERVER_FILE_NAME} not on PATH: {e}"),
    })
}
