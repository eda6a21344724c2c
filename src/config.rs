//! Relay wiring for one worker process
//!
//! The spawning side exports these settings as environment variables; the
//! worker reads them back with [`RelayConfig::from_env`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::hierarchy;
use crate::protocol::{Registration, Role};

/// Socket of the group relay the worker registers with
pub const SOCKET_ENV: &str = "CABAL_RELAY_SOCKET";
/// Socket of the relay a coordinator hosts for its own sub-swarm
pub const HOSTED_SOCKET_ENV: &str = "CABAL_RELAY_HOST_SOCKET";
pub const NAME_ENV: &str = "CABAL_AGENT_NAME";
pub const ROLE_ENV: &str = "CABAL_AGENT_ROLE";
pub const SWARM_ENV: &str = "CABAL_SWARM";
pub const CODE_ENV: &str = "CABAL_HIERARCHY_CODE";

/// Everything a worker needs to join the relay hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay of the group this worker belongs to
    pub socket_path: PathBuf,
    /// Relay this worker hosts for its children (coordinators only)
    #[serde(default)]
    pub hosted_socket_path: Option<PathBuf>,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub swarm: Option<String>,
    /// Position in the spawn tree
    #[serde(default)]
    pub code: Option<String>,
}

impl RelayConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary variable lookup
    ///
    /// Empty values count as unset. A missing socket path falls back to
    /// [`default_socket_path`] for the worker's swarm.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let name = get(NAME_ENV)
            .ok_or_else(|| RelayError::Config(format!("{NAME_ENV} is not set")))?;
        let role = match get(ROLE_ENV) {
            Some(role) => role
                .parse::<Role>()
                .map_err(|e| RelayError::Config(format!("{ROLE_ENV}: {e}")))?,
            None => Role::Agent,
        };
        let swarm = get(SWARM_ENV);
        let socket_path = get(SOCKET_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_socket_path(swarm.as_deref()));

        let config = Self {
            socket_path,
            hosted_socket_path: get(HOSTED_SOCKET_ENV).map(PathBuf::from),
            name,
            role,
            swarm,
            code: get(CODE_ENV),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.registration()
            .check()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        if let Some(code) = &self.code {
            if !hierarchy::is_valid_code(code) {
                return Err(RelayError::Config(format!(
                    "invalid hierarchy code '{code}'"
                )));
            }
        }
        Ok(())
    }

    /// The `register` payload for this worker
    pub fn registration(&self) -> Registration {
        Registration::new(self.name.clone(), self.role, self.swarm.clone())
    }

    /// Depth in the spawn tree, if a code was assigned
    pub fn depth(&self) -> Option<usize> {
        self.code.as_deref().map(hierarchy::depth)
    }

    /// Environment variables that reproduce this configuration
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (SOCKET_ENV, self.socket_path.display().to_string()),
            (NAME_ENV, self.name.clone()),
            (ROLE_ENV, self.role.to_string()),
        ];
        if let Some(path) = &self.hosted_socket_path {
            vars.push((HOSTED_SOCKET_ENV, path.display().to_string()));
        }
        if let Some(swarm) = &self.swarm {
            vars.push((SWARM_ENV, swarm.clone()));
        }
        if let Some(code) = &self.code {
            vars.push((CODE_ENV, code.clone()));
        }
        vars
    }
}

/// Per-swarm socket path under `$XDG_RUNTIME_DIR`, or `/tmp`
pub fn default_socket_path(swarm: Option<&str>) -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    let file = match swarm {
        Some(swarm) => format!("cabal-relay-{}.sock", sanitize(swarm)),
        None => "cabal-relay.sock".to_string(),
    };
    PathBuf::from(runtime_dir).join(file)
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
