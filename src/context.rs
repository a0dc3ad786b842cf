use crate::error::IslectlError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    #[default]
    Local,
    Remote,
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locality::Local => f.write_str("local"),
            Locality::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct DeploymentContext {
    pub name: String,
    #[serde(rename = "type")]
    pub locality: Locality,
    pub docker_socket: String,
    pub project_name: String,
    pub profile: String,
    pub project_dir: String,
    pub site: String,
    pub env_file: Vec<String>,
    pub sudo: bool,
    pub ssh_hostname: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    #[serde(rename = "ssh-key")]
    pub ssh_key_path: String,
}

impl Default for DeploymentContext {
    fn default() -> Self {
        Self {
            name: String::new(),
            locality: Locality::Local,
            docker_socket: "/var/run/docker.sock".to_string(),
            project_name: "isle-site-template".to_string(),
            profile: "dev".to_string(),
            project_dir: String::new(),
            site: "default".to_string(),
            env_file: Vec::new(),
            sudo: false,
            ssh_hostname: "islandora.dev".to_string(),
            ssh_port: 2222,
            ssh_user: "nginx".to_string(),
            ssh_key_path: String::new(),
        }
    }
}

/// Example values shipped as flag defaults. A remote context still carrying
/// one of these almost certainly means the operator forgot to override it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Placeholders {
    pub ssh_hostname: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub profile: String,
    pub project_name: String,
}

impl Default for Placeholders {
    fn default() -> Self {
        Self {
            ssh_hostname: "islandora.dev".to_string(),
            ssh_user: "nginx".to_string(),
            ssh_port: 2222,
            profile: "dev".to_string(),
            project_name: "isle-site-template".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextField {
    SshHostname,
    SshUser,
    SshPort,
    SshKeyPath,
    Profile,
    ProjectName,
}

impl ContextField {
    pub fn label(self) -> &'static str {
        match self {
            ContextField::SshHostname => "ssh-hostname",
            ContextField::SshUser => "ssh-user",
            ContextField::SshPort => "ssh-port",
            ContextField::SshKeyPath => "ssh-key",
            ContextField::Profile => "profile",
            ContextField::ProjectName => "project-name",
        }
    }

    fn affects_connection(self) -> bool {
        matches!(
            self,
            ContextField::SshHostname
                | ContextField::SshUser
                | ContextField::SshPort
                | ContextField::SshKeyPath
        )
    }
}

impl DeploymentContext {
    pub fn is_remote(&self) -> bool {
        self.locality == Locality::Remote
    }

    pub fn project_dir(&self) -> &Path {
        Path::new(&self.project_dir)
    }

    pub fn secret_path(&self, name: &str) -> PathBuf {
        self.project_dir().join("secrets").join(name)
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.ssh_key_path))
    }

    /// `known_hosts` lives next to the private key.
    pub fn known_hosts_path(&self) -> PathBuf {
        let key = self.ssh_key_path();
        key.parent()
            .map(|dir| dir.join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("known_hosts"))
    }

    pub fn ssh_addr(&self) -> String {
        format!("{}:{}", self.ssh_hostname, self.ssh_port)
    }

    pub fn container_name(&self, service: &str, tooling: bool) -> String {
        if tooling || self.profile.is_empty() {
            format!("{}-{}-1", self.project_name, service)
        } else {
            format!("{}-{}-{}-1", self.project_name, service, self.profile)
        }
    }

    /// Compose service name for profile-suffixed services (`drupal-prod`).
    pub fn compose_service(&self, service: &str) -> String {
        if self.profile.is_empty() {
            service.to_string()
        } else {
            format!("{}-{}", service, self.profile)
        }
    }

    pub fn default_network(&self) -> String {
        format!("{}_default", self.project_name)
    }

    pub fn database_name(&self) -> String {
        format!("drupal_{}", self.site)
    }

    pub fn validate(&self) -> Result<(), IslectlError> {
        if self.name.trim().is_empty() {
            return Err(IslectlError::Config("context name is empty".to_string()));
        }
        if self.project_name.trim().is_empty() {
            return Err(IslectlError::Config(format!(
                "context '{}' has no project-name",
                self.name
            )));
        }
        if self.is_remote() {
            let missing: Vec<&str> = [
                (self.ssh_hostname.trim().is_empty(), "ssh-hostname"),
                (self.ssh_user.trim().is_empty(), "ssh-user"),
                (self.ssh_key_path.trim().is_empty(), "ssh-key"),
            ]
            .into_iter()
            .filter(|(missing, _)| *missing)
            .map(|(_, label)| label)
            .collect();
            if !missing.is_empty() {
                return Err(IslectlError::Config(format!(
                    "remote context '{}' is missing {}",
                    self.name,
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }
}

pub fn expand_home(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn default_ssh_key_path() -> String {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("id_rsa"))
        .unwrap_or_else(|| PathBuf::from("~/.ssh/id_rsa"))
        .to_string_lossy()
        .to_string()
}

/// Remote fields still holding an example value or left empty, in the
/// order an operator should be asked about them.
pub fn pending_remote_inputs(ctx: &DeploymentContext, placeholders: &Placeholders) -> Vec<ContextField> {
    if !ctx.is_remote() {
        return Vec::new();
    }
    let mut fields = Vec::new();
    if ctx.ssh_hostname.trim().is_empty() || ctx.ssh_hostname == placeholders.ssh_hostname {
        fields.push(ContextField::SshHostname);
    }
    if ctx.ssh_user.trim().is_empty() || ctx.ssh_user == placeholders.ssh_user {
        fields.push(ContextField::SshUser);
    }
    if ctx.ssh_port == 0 || ctx.ssh_port == placeholders.ssh_port {
        fields.push(ContextField::SshPort);
    }
    if ctx.ssh_key_path.trim().is_empty() {
        fields.push(ContextField::SshKeyPath);
    }
    if ctx.profile == placeholders.profile {
        fields.push(ContextField::Profile);
    }
    if ctx.project_name == placeholders.project_name {
        fields.push(ContextField::ProjectName);
    }
    fields
}

pub trait Prompter {
    /// Returns the trimmed answer; an empty answer means "keep the default".
    fn ask(&self, question: &[String], default: Option<&str>) -> Result<String, IslectlError>;
}

pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn ask(&self, question: &[String], default: Option<&str>) -> Result<String, IslectlError> {
        let theme = dialoguer::theme::ColorfulTheme::default();
        let (last, intro) = match question.split_last() {
            Some(parts) => parts,
            None => return Ok(String::new()),
        };
        for line in intro {
            println!("{}", dialoguer::console::style(line).dim());
        }
        let mut input = dialoguer::Input::<String>::with_theme(&theme)
            .with_prompt(last)
            .allow_empty(true);
        if let Some(default) = default {
            input = input.default(default.to_string()).show_default(true);
        }
        Ok(input.interact_text()?.trim().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verification {
    pub prompted: bool,
    pub tested_ssh: bool,
}

/// Drives `prompter` through every pending field, then runs `connect` once if
/// any connection parameter changed.
pub fn verify_remote_context<P, F>(
    ctx: &mut DeploymentContext,
    placeholders: &Placeholders,
    existing_site: bool,
    prompter: &P,
    connect: F,
) -> Result<Verification, IslectlError>
where
    P: Prompter + ?Sized,
    F: FnOnce(&DeploymentContext) -> Result<(), IslectlError>,
{
    let pending = pending_remote_inputs(ctx, placeholders);
    let mut outcome = Verification::default();
    if pending.is_empty() {
        return Ok(outcome);
    }
    outcome.prompted = true;
    let mut test_ssh = false;

    for field in pending {
        tracing::debug!(field = field.label(), context = %ctx.name, "prompting for context field");
        match field {
            ContextField::SshHostname => {
                let question = if existing_site {
                    vec!["What is the hostname the site is installed at? (e.g. isle.example.com)".to_string()]
                } else {
                    vec![
                        format!("You should not be setting SSH hostname to {}", placeholders.ssh_hostname),
                        "You may have forgot to pass --ssh-hostname".to_string(),
                        "Instead you can enter the remote server domain name here".to_string(),
                    ]
                };
                let answer = prompter.ask(&question, None)?;
                if answer.is_empty() {
                    return Err(IslectlError::Config(
                        "ssh-hostname is required for remote contexts".to_string(),
                    ));
                }
                ctx.ssh_hostname = answer;
            }
            ContextField::SshUser => {
                let fallback = current_username().unwrap_or_default();
                let question = vec![format!(
                    "What username do you use to SSH into {}?",
                    ctx.ssh_hostname
                )];
                let answer = prompter.ask(&question, Some(&fallback).filter(|u| !u.is_empty()).map(String::as_str))?;
                ctx.ssh_user = if answer.is_empty() { fallback } else { answer };
                if ctx.ssh_user.is_empty() {
                    return Err(IslectlError::Config(
                        "ssh-user is required for remote contexts".to_string(),
                    ));
                }
            }
            ContextField::SshPort => {
                let (question, fallback) = if existing_site {
                    (
                        vec![format!(
                            "If you use a non-standard port to connect to {} over SSH enter it here",
                            ctx.ssh_hostname
                        )],
                        22,
                    )
                } else {
                    (
                        vec![
                            "You may have forgot to pass --ssh-port".to_string(),
                            format!(
                                "The default value is {}, which is a good default for local contexts",
                                placeholders.ssh_port
                            ),
                            "You can enter the port to connect to".to_string(),
                        ],
                        placeholders.ssh_port,
                    )
                };
                let answer = prompter.ask(&question, Some(&fallback.to_string()))?;
                ctx.ssh_port = if answer.is_empty() {
                    fallback
                } else {
                    answer.parse::<u16>().map_err(|err| {
                        IslectlError::Config(format!("unable to convert port {answer:?} to an integer: {err}"))
                    })?
                };
            }
            ContextField::SshKeyPath => {
                let fallback = default_ssh_key_path();
                let question = vec![
                    "Path to your SSH private key".to_string(),
                    format!("Used when you run ssh {}@{}", ctx.ssh_user, ctx.ssh_hostname),
                    "Enter the full path here".to_string(),
                ];
                let answer = prompter.ask(&question, Some(&fallback))?;
                ctx.ssh_key_path = if answer.is_empty() { fallback } else { answer };
                let key = ctx.ssh_key_path();
                if !key.exists() {
                    return Err(IslectlError::Config(format!(
                        "SSH key does not exist: {}",
                        key.display()
                    )));
                }
            }
            ContextField::Profile => {
                let question = if existing_site {
                    vec!["Enter the name of the docker compose profile you're using (e.g. prod). Enter nothing if you're not using profiles".to_string()]
                } else {
                    vec![
                        format!(
                            "Are you sure you want {:?} for the docker compose profile on the remote context?",
                            placeholders.profile
                        ),
                        "Enter the profile here, enter nothing if you are not using profiles".to_string(),
                    ]
                };
                ctx.profile = prompter.ask(&question, None)?;
            }
            ContextField::ProjectName => {
                let question = vec![
                    "What is the docker compose project name (COMPOSE_PROJECT_NAME in your .env)?".to_string(),
                ];
                let answer = prompter.ask(&question, Some(&placeholders.project_name))?;
                if !answer.is_empty() {
                    ctx.project_name = answer;
                }
            }
        }
        if field.affects_connection() {
            test_ssh = true;
        }
    }

    ctx.validate()?;
    if test_ssh {
        connect(ctx).map_err(|err| match err {
            IslectlError::HostVerification { .. } => err,
            other => IslectlError::Config(format!("ssh config does not seem correct: {other}")),
        })?;
        tracing::info!(host = %ctx.ssh_hostname, "tested SSH connection");
        outcome.tested_ssh = true;
    }
    Ok(outcome)
}

fn current_username() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|name| !name.trim().is_empty())
}
