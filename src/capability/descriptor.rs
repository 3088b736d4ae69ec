use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Tag accepted by providers that serve every project kind.
pub const ANY_TAG: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderSource {
    Manifest { path: PathBuf },
    #[default]
    InProcess,
}

/// Static description of a capability provider, as read from a manifest or
/// supplied by an in-process registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Project tags (`rust`, `python`, ...) this provider handles.
    #[serde(default)]
    pub supports: BTreeSet<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub source: ProviderSource,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            supports: BTreeSet::new(),
            is_default: false,
            source: ProviderSource::InProcess,
        }
    }

    pub fn supporting(mut self, tags: &[&str]) -> Self {
        self.supports.extend(tags.iter().map(|t| t.to_string()));
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn supports(&self, tag: &str) -> bool {
        self.supports.contains(tag) || self.supports.contains(ANY_TAG)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.id.trim().is_empty() {
            return Err(AppError::InvalidInputArgument("provider id must not be empty".to_string()));
        }
        if matches!(self.source, ProviderSource::Manifest { .. })
            && self.command.as_deref().map_or(true, |c| c.trim().is_empty())
        {
            return Err(AppError::InvalidInputArgument(format!(
                "provider '{}' manifest has no command",
                self.id
            )));
        }
        Ok(())
    }
}

/// Parses one `*.json` manifest. The file name stands in for a missing `id`.
pub fn load_manifest(path: &Path, contents: &str) -> AppResult<ProviderDescriptor> {
    let mut value: serde_json::Value = serde_json::from_str(contents)?;
    if value.get("id").is_none() {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("id".to_string(), serde_json::Value::String(stem));
        }
    }
    let mut descriptor: ProviderDescriptor = serde_json::from_value(value)?;
    if descriptor.name.is_empty() {
        descriptor.name = descriptor.id.clone();
    }
    descriptor.source = ProviderSource::Manifest { path: path.to_path_buf() };
    descriptor.validate()?;
    Ok(descriptor)
}
