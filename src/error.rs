use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IslectlError {
    #[error("config error: {0}")]
    Config(String),
    #[error("{}", host_verification_message(.host, .port, .user, .want, .got))]
    HostVerification {
        host: String,
        port: u16,
        user: String,
        want: Vec<String>,
        got: String,
    },
    #[error("error dialing SSH at {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("error running command `{command}`: {cause}")]
    Command {
        command: String,
        cause: String,
        output: Vec<String>,
    },
    #[error("no running container named {container} for service '{service}'")]
    ServiceNotFound { service: String, container: String },
    #[error("network {network:?} not found in container {container:?}")]
    NetworkNotFound { network: String, container: String },
    #[error("docker engine error: {0}")]
    Engine(String),
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

fn host_verification_message(
    host: &str,
    port: &u16,
    user: &str,
    want: &[String],
    got: &str,
) -> String {
    let mut message = if want.is_empty() {
        format!(
            "The host key for {host} is not known.\n\
This means your SSH known_hosts file doesn't have an entry for this host."
        )
    } else {
        format!(
            "The host key for {host} does not match the expected key.\n\
This might indicate that the host's key has changed or that there could be a security issue.\n\
Please verify the new key with your host administrator.\n\
If the change is legitimate, update your known_hosts file by removing the old key and adding the new one.\n\
Offered key: {got}"
        )
    };
    message.push_str(&format!(
        "\nHint: {}",
        ssh_retry_hint(host, *port, user)
    ));
    message
}

pub fn ssh_retry_hint(host: &str, port: u16, user: &str) -> String {
    format!("Try running `ssh -p {port} -t {user}@{host}` and trying again")
}

impl IslectlError {
    pub fn error_code(&self) -> &'static str {
        match self {
            IslectlError::Config(_) => "config_invalid",
            IslectlError::HostVerification { want, .. } if want.is_empty() => "ssh_host_unknown",
            IslectlError::HostVerification { .. } => "ssh_host_key_mismatch",
            IslectlError::Connection { .. } => "ssh_connection_failed",
            IslectlError::Command { .. } => "process_command_failed",
            IslectlError::ServiceNotFound { .. } => "service_not_found",
            IslectlError::NetworkNotFound { .. } => "network_not_found",
            IslectlError::Engine(_) => "docker_engine_error",
            IslectlError::Ssh(_) => "ssh_error",
            IslectlError::Io(_) => "io_error",
            IslectlError::Prompt(_) => "prompt_error",
            IslectlError::Yaml(_) => "yaml_error",
            IslectlError::Json(_) => "json_error",
            IslectlError::Http(_) => "http_error",
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            IslectlError::HostVerification {
                host, port, user, ..
            } => Some(ssh_retry_hint(host, *port, user)),
            IslectlError::ServiceNotFound { .. } => Some(
                "Check that the stack is up (`islectl compose ps`) and that the context's project-name and profile match."
                    .to_string(),
            ),
            IslectlError::NetworkNotFound { .. } => Some(
                "The container is not attached to the compose project's default network; check project-name."
                    .to_string(),
            ),
            IslectlError::Engine(_) => Some(
                "Docker daemon is unreachable. Start Docker (or check docker-socket in your context) and retry."
                    .to_string(),
            ),
            _ => None,
        }
    }

    pub fn details(&self) -> ErrorDetails {
        ErrorDetails {
            error_code: self.error_code().to_string(),
            hint: self.hint(),
            command: match self {
                IslectlError::Command { command, .. } => Some(command.clone()),
                _ => None,
            },
        }
    }
}
