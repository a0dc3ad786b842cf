use crate::config::write_atomic_text_file;
use crate::context::DeploymentContext;
use crate::error::IslectlError;
use crate::runner::{runner_for, Echo, ExecutionResult};
use crate::ssh::RemoteSession;
use std::path::{Path, PathBuf};

pub const SETUP_SCRIPT_URL: &str =
    "https://raw.githubusercontent.com/Islandora-Devops/isle-site-template/support-flags/setup.sh";
pub const REMOTE_SETUP_PATH: &str = "/tmp/isle-setup.sh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteOptions {
    pub buildkit_tag: String,
    pub starter_site: String,
}

impl SiteOptions {
    pub fn flags(&self, ctx: &DeploymentContext) -> Vec<String> {
        vec![
            format!("--buildkit-tag={}", self.buildkit_tag),
            format!("--starter-site-branch={}", self.starter_site),
            format!("--site-name={}", ctx.project_name),
        ]
    }
}

/// Where the setup script ends up and runs.
pub trait SetupHost {
    /// Makes the downloaded script reachable on the install host and
    /// returns its path there.
    fn stage_script(&self, local: &Path) -> Result<String, IslectlError>;
    fn run(&self, install_ctx: &DeploymentContext, argv: &[String]) -> Result<ExecutionResult, IslectlError>;
}

pub struct ContextHost<'a> {
    ctx: &'a DeploymentContext,
    echo: Echo,
}

impl<'a> ContextHost<'a> {
    pub fn new(ctx: &'a DeploymentContext, echo: Echo) -> Self {
        Self { ctx, echo }
    }
}

impl SetupHost for ContextHost<'_> {
    fn stage_script(&self, local: &Path) -> Result<String, IslectlError> {
        if !self.ctx.is_remote() {
            return Ok(local.to_string_lossy().to_string());
        }
        let session = RemoteSession::open(self.ctx)?;
        session.upload_file(local, Path::new(REMOTE_SETUP_PATH))?;
        Ok(REMOTE_SETUP_PATH.to_string())
    }

    fn run(&self, install_ctx: &DeploymentContext, argv: &[String]) -> Result<ExecutionResult, IslectlError> {
        runner_for(install_ctx, self.echo).run(argv)
    }
}

pub fn setup_script_path() -> PathBuf {
    std::env::temp_dir().join(format!("isle-setup-{}.sh", std::process::id()))
}

pub fn download_setup_script(url: &str, path: &Path) -> Result<(), IslectlError> {
    tracing::info!(url, file = %path.display(), "downloading setup script");
    let client = reqwest::blocking::Client::new();
    let response = client.get(url).header("User-Agent", "islectl").send()?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(IslectlError::Config(format!(
            "download failed: {} (HTTP {} {})",
            url,
            status,
            body.trim()
        )));
    }
    let script = response.text()?;
    write_atomic_text_file(path, &script, Some(0o755))
}

/// The context the installer runs in: the site directory does not exist yet,
/// so commands start from its parent.
pub fn install_context(ctx: &DeploymentContext) -> DeploymentContext {
    let mut install = ctx.clone();
    if let Some(parent) = ctx.project_dir().parent() {
        install.project_dir = parent.to_string_lossy().to_string();
    }
    install
}

pub fn setup_argv(script: &str, flags: &[String]) -> Vec<String> {
    let mut argv = vec!["bash".to_string(), "-l".to_string(), script.to_string()];
    argv.extend(flags.iter().cloned());
    argv
}

/// Stages the downloaded script and runs it beside the new project directory.
pub fn install_site(
    ctx: &DeploymentContext,
    options: &SiteOptions,
    host: &dyn SetupHost,
    script: &Path,
) -> Result<ExecutionResult, IslectlError> {
    let staged = host.stage_script(script)?;
    let install = install_context(ctx);
    let argv = setup_argv(&staged, &options.flags(ctx));
    tracing::info!(context = %ctx.name, dir = %install.project_dir, "installing site");
    host.run(&install, &argv)
}
