use crate::context::{DeploymentContext, Placeholders};
use crate::error::IslectlError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    pub current_context: String,
    pub contexts: Vec<DeploymentContext>,
    pub placeholders: Placeholders,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            current_context: String::new(),
            contexts: Vec::new(),
            placeholders: Placeholders::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Added,
    Updated,
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("ISLECTL_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".islectl");
    base.push("config.yaml");
    base
}

impl Config {
    pub fn template() -> Result<Self, IslectlError> {
        Ok(serde_yaml::from_str(DEFAULT_CONFIG_YAML)?)
    }

    /// A missing file loads as the embedded template.
    pub fn load(path: &Path) -> Result<Self, IslectlError> {
        if !path.exists() {
            tracing::debug!(config = %path.display(), "config file missing; using template");
            return Self::template();
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Self::template();
        }
        serde_yaml::from_str(&content).map_err(|err| {
            IslectlError::Config(format!("invalid config file {}: {}", path.display(), err))
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), IslectlError> {
        let content = serde_yaml::to_string(self)?;
        write_atomic_text_file(path, &content, Some(0o600))
    }

    pub fn find(&self, name: &str) -> Option<&DeploymentContext> {
        self.contexts.iter().find(|ctx| ctx.name == name)
    }

    /// Looks up `name`, or the current context when no name is given.
    pub fn context(&self, name: Option<&str>) -> Result<DeploymentContext, IslectlError> {
        let name = match name {
            Some(name) if !name.trim().is_empty() => name,
            _ if self.current_context.is_empty() => {
                return Err(IslectlError::Config(
                    "no current context set. Have you run `islectl config set-context`?".to_string(),
                ))
            }
            _ => self.current_context.as_str(),
        };
        self.find(name).cloned().ok_or_else(|| {
            IslectlError::Config(format!(
                "context '{name}' not found. Have you run `islectl config set-context {name}`?"
            ))
        })
    }

    /// Adds or replaces the context by name. The first context saved, or one
    /// saved with `set_default`, becomes current.
    pub fn save_context(
        &mut self,
        ctx: DeploymentContext,
        set_default: bool,
    ) -> Result<SaveOutcome, IslectlError> {
        ctx.validate()?;
        let name = ctx.name.clone();
        let outcome = match self.contexts.iter_mut().find(|existing| existing.name == name) {
            Some(existing) => {
                *existing = ctx;
                SaveOutcome::Updated
            }
            None => {
                self.contexts.push(ctx);
                SaveOutcome::Added
            }
        };
        if set_default || self.current_context.is_empty() {
            self.current_context = name;
        }
        Ok(outcome)
    }

    pub fn use_context(&mut self, name: &str) -> Result<(), IslectlError> {
        if self.find(name).is_none() {
            return Err(IslectlError::Config(format!("context '{name}' not found")));
        }
        self.current_context = name.to_string();
        Ok(())
    }

    pub fn delete_context(&mut self, name: &str) -> Result<(), IslectlError> {
        if self.current_context == name {
            return Err(IslectlError::Config(
                "cannot delete the current context. Switch with `islectl config use-context` or update it with `islectl config set-context`".to_string(),
            ));
        }
        let before = self.contexts.len();
        self.contexts.retain(|ctx| ctx.name != name);
        if self.contexts.len() == before {
            return Err(IslectlError::Config(format!("context '{name}' not found")));
        }
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<(), IslectlError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub(crate) fn write_atomic_text_file(path: &Path, content: &str, mode: Option<u32>) -> Result<(), IslectlError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "islectl".to_string()),
        std::process::id(),
        ts
    ));

    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Locality;
    use tempfile::tempdir;

    fn local(name: &str) -> DeploymentContext {
        DeploymentContext {
            name: name.to_string(),
            project_dir: format!("/srv/{name}"),
            ..DeploymentContext::default()
        }
    }

    #[test]
    fn template_parses_with_default_placeholders() {
        let cfg = Config::template().unwrap();
        assert!(cfg.contexts.is_empty());
        assert!(cfg.current_context.is_empty());
        assert_eq!(cfg.placeholders, Placeholders::default());
    }

    #[test]
    fn missing_file_loads_template() {
        let dir = tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(cfg, Config::template().unwrap());
    }

    #[test]
    fn first_context_becomes_current_and_save_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.yaml");
        let mut cfg = Config::default();
        assert_eq!(cfg.save_context(local("dev"), false).unwrap(), SaveOutcome::Added);
        assert_eq!(cfg.save_context(local("prod"), false).unwrap(), SaveOutcome::Added);
        assert_eq!(cfg.current_context, "dev");
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.context(None).unwrap().name, "dev");
        assert_eq!(loaded.context(Some("prod")).unwrap().project_dir, "/srv/prod");

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn saving_existing_name_replaces_in_place() {
        let mut cfg = Config::default();
        cfg.save_context(local("dev"), false).unwrap();
        cfg.save_context(local("prod"), true).unwrap();
        let mut changed = local("dev");
        changed.profile = "prod".to_string();
        assert_eq!(cfg.save_context(changed, false).unwrap(), SaveOutcome::Updated);
        assert_eq!(cfg.contexts.len(), 2);
        assert_eq!(cfg.contexts[0].profile, "prod");
        assert_eq!(cfg.current_context, "prod");
    }

    #[test]
    fn invalid_context_is_not_saved() {
        let mut cfg = Config::default();
        let remote = DeploymentContext {
            name: "prod".to_string(),
            locality: Locality::Remote,
            ..DeploymentContext::default()
        };
        assert!(cfg.save_context(remote, false).is_err());
        assert!(cfg.contexts.is_empty());
    }

    #[test]
    fn current_context_cannot_be_deleted() {
        let mut cfg = Config::default();
        cfg.save_context(local("dev"), false).unwrap();
        cfg.save_context(local("prod"), false).unwrap();
        assert!(cfg.delete_context("dev").is_err());
        cfg.delete_context("prod").unwrap();
        assert!(cfg.delete_context("prod").is_err());
        assert_eq!(cfg.contexts.len(), 1);
    }

    #[test]
    fn use_context_requires_known_name() {
        let mut cfg = Config::default();
        cfg.save_context(local("dev"), false).unwrap();
        cfg.save_context(local("prod"), false).unwrap();
        cfg.use_context("prod").unwrap();
        assert_eq!(cfg.current_context, "prod");
        assert!(cfg.use_context("staging").is_err());
        assert_eq!(cfg.current_context, "prod");
    }

    #[test]
    fn missing_current_context_is_a_config_error() {
        let cfg = Config::default();
        let err = cfg.context(None).expect_err("no current context");
        assert!(err.to_string().contains("set-context"));
        assert!(cfg.context(Some("ghost")).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "current-context: dev\nbogus: 1\n").unwrap();
        let err = Config::load(&path).expect_err("unknown key");
        assert!(matches!(err, IslectlError::Config(_)));
    }
}
