//! Scope resolution
//!
//! A [`ScopeKey`] identifies which registry entry a request maps to: the
//! scope level, the enclosing test unit at that level, and a fingerprint of
//! the merged configuration so incompatible configurations never share a
//! cluster.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{ClusterConfig, ClusterOverrides, ConfigError};

/// Granularity at which a cluster is shared between test units
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Session,
    Module,
    Class,
    Function,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Session => "session",
            Scope::Module => "module",
            Scope::Class => "class",
            Scope::Function => "function",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "session" => Ok(Scope::Session),
            "module" => Ok(Scope::Module),
            "class" => Ok(Scope::Class),
            "function" => Ok(Scope::Function),
            other => Err(ConfigError::Invalid(format!(
                "unknown scope '{}', expected session, module, class or function",
                other
            ))),
        }
    }
}

/// Identity of the test unit requesting a cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestUnit {
    pub session: String,
    pub module: Option<String>,
    pub class: Option<String>,
    pub function: Option<String>,
}

impl TestUnit {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            module: None,
            class: None,
            function: None,
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    /// Identity of the enclosing unit at the given scope level
    ///
    /// Levels the unit does not have (a function outside any class, say)
    /// fall back to the nearest enclosing level that it does have.
    pub fn discriminator(&self, scope: Scope) -> String {
        let mut parts = vec![self.session.as_str()];

        if scope >= Scope::Module {
            if let Some(module) = &self.module {
                parts.push(module);
            }
        }
        if scope >= Scope::Class {
            if let Some(class) = &self.class {
                parts.push(class);
            }
        }
        if scope >= Scope::Function {
            if let Some(function) = &self.function {
                parts.push(function);
            }
        }

        parts.join("::")
    }
}

/// Registry key for one shared cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub scope: Scope,
    pub discriminator: String,
    pub fingerprint: String,
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.scope, self.discriminator, self.fingerprint)
    }
}

/// Fingerprint of a merged configuration (first 16 hex chars of SHA-256)
pub fn fingerprint(config: &ClusterConfig) -> Result<String, ConfigError> {
    let canonical = serde_json::to_vec(config).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    let digest = Sha256::digest(&canonical);
    Ok(digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// Merge the configuration layers and compute the scope key
///
/// Precedence, lowest to highest: `defaults` < `global` < `per_call`.
pub fn resolve(
    defaults: &ClusterConfig,
    global: &ClusterOverrides,
    per_call: &ClusterOverrides,
    unit: &TestUnit,
) -> Result<(ScopeKey, ClusterConfig), ConfigError> {
    let mut merged = defaults.clone();
    merged.apply(global);
    merged.apply(per_call);
    merged.validate()?;

    let key = ScopeKey {
        scope: merged.scope,
        discriminator: unit.discriminator(merged.scope),
        fingerprint: fingerprint(&merged)?,
    };

    Ok((key, merged))
}
