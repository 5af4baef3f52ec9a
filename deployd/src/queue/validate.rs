//! Allow-list validation of deployment intents
//!
//! Every field that ends up in a filesystem path, a git argument or a shell
//! command line is checked against a strict character allow-list. The agent
//! runs the same checks again before touching the host.

use url::Url;

use crate::errors::DeployError;
use crate::models::NewTask;

const MAX_TARGET_LEN: usize = 63;
const MAX_BRANCH_LEN: usize = 255;
const MAX_COMMAND_LEN: usize = 1024;
const MAX_APP_ID_LEN: usize = 64;

/// Validate a complete intent
pub fn validate_task(task: &NewTask) -> Result<(), DeployError> {
    validate_app_id(&task.app_id)?;
    validate_target_name(&task.target_name)?;
    validate_repo_url(&task.repo_url)?;
    validate_branch(&task.branch)?;
    validate_build_command(&task.build_command)?;
    validate_port(task.target_port)?;
    Ok(())
}

/// Application ids become part of an OS user name
pub fn validate_app_id(app_id: &str) -> Result<(), DeployError> {
    if app_id.is_empty() || app_id.len() > MAX_APP_ID_LEN {
        return Err(invalid("app_id", "must be 1-64 characters"));
    }
    if !app_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(invalid("app_id", "only [A-Za-z0-9-] allowed"));
    }
    Ok(())
}

/// Target names become a directory under the web root and a service name
pub fn validate_target_name(name: &str) -> Result<(), DeployError> {
    if name.is_empty() || name.len() > MAX_TARGET_LEN {
        return Err(invalid("target_name", "must be 1-63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(invalid("target_name", "only [a-z0-9.-] allowed"));
    }
    if name.starts_with('.') || name.starts_with('-') || name.contains("..") {
        return Err(invalid("target_name", "path traversal sequence"));
    }
    Ok(())
}

/// Branch names follow a conservative subset of git ref rules
pub fn validate_branch(branch: &str) -> Result<(), DeployError> {
    if branch.is_empty() || branch.len() > MAX_BRANCH_LEN {
        return Err(invalid("branch", "must be 1-255 characters"));
    }
    if !branch
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(invalid("branch", "only [A-Za-z0-9-_./] allowed"));
    }
    if branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("//")
    {
        return Err(invalid("branch", "not a valid ref name"));
    }
    Ok(())
}

/// Build commands are handed to `sh -c`, so no shell metacharacters at all
pub fn validate_build_command(command: &str) -> Result<(), DeployError> {
    if command.trim().is_empty() || command.len() > MAX_COMMAND_LEN {
        return Err(invalid("build_command", "must be 1-1024 characters"));
    }
    if !command.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || matches!(c, ' ' | '-' | '_' | '.' | '/' | '=' | ':' | '@' | '+' | ',')
    }) {
        return Err(invalid("build_command", "shell metacharacters are not allowed"));
    }
    if command.contains("..") {
        return Err(invalid("build_command", "path traversal sequence"));
    }
    Ok(())
}

/// Repository urls: https/ssh/git urls or scp-like `user@host:path`. Nothing
/// that resolves to the agent host's own filesystem is accepted.
pub fn validate_repo_url(repo_url: &str) -> Result<(), DeployError> {
    if repo_url.is_empty() || repo_url.starts_with('-') {
        return Err(invalid("repo_url", "empty or option-like"));
    }
    if repo_url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("repo_url", "whitespace is not allowed"));
    }

    match Url::parse(repo_url) {
        Ok(url) => match url.scheme() {
            "https" | "ssh" | "git" => Ok(()),
            other => Err(invalid("repo_url", &format!("unsupported scheme '{}'", other))),
        },
        Err(_) => validate_scp_like(repo_url),
    }
}

fn validate_scp_like(repo_url: &str) -> Result<(), DeployError> {
    let Some((host_part, path)) = repo_url.split_once(':') else {
        return Err(invalid("repo_url", "not a url"));
    };
    let host_ok = !host_part.is_empty()
        && host_part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '-' | '_'));
    let path_ok = !path.is_empty()
        && !path.starts_with('/')
        && !path.contains("..")
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | '~'));
    if host_ok && path_ok {
        Ok(())
    } else {
        Err(invalid("repo_url", "not a url"))
    }
}

pub fn validate_port(port: u16) -> Result<(), DeployError> {
    if port == 0 {
        return Err(invalid("target_port", "must be 1-65535"));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> DeployError {
    DeployError::ValidationError(format!("{}: {}", field, reason))
}
