use crate::prelude::*;
use proctrace::CommandBuilder;
use std::{
    io::IsTerminal,
    process::{Command, Stdio},
};

pub fn is_root_user() -> bool {
    nix::unistd::Uid::effective().is_root()
}

fn is_sudo_available() -> bool {
    Command::new("sudo")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Validate sudo access, prompting the user for their password if necessary
///
/// Must run before the dashboard takes over the terminal.
pub fn validate_sudo_access() -> Result<()> {
    let needs_password = Command::new("sudo")
        .arg("--non-interactive") // Fail if password is required
        .arg("true")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| !status.success())
        .unwrap_or(true);

    if !needs_password {
        return Ok(());
    }
    if !std::io::stdin().is_terminal() {
        bail!("Sudo requires a password but stdin is not a terminal, run pst as root instead");
    }

    eprintln!("Sudo privileges are required to attach the tracers. Please enter your password.");
    let auth_status = Command::new("sudo")
        .arg("--validate") // Validate and extend the timeout
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|_| anyhow!("Failed to authenticate with sudo"))?;

    if !auth_status.success() {
        bail!("Failed to authenticate with sudo");
    }
    Ok(())
}

/// Arguments given to sudo in front of `cmd_builder`
fn sudo_args(cmd_builder: &CommandBuilder) -> Vec<String> {
    // Password prompt must not appear here, the tracer has no terminal
    let mut args = vec!["--non-interactive".to_string()];
    // sudo resets the environment, variables set on the builder have to be kept explicitly
    let preserved = cmd_builder
        .env_keys()
        .map(|key| key.to_string_lossy().into_owned())
        .join(",");
    if !preserved.is_empty() {
        args.push(format!("--preserve-env={preserved}"));
    }
    args
}

/// Wrap with sudo if not running as root
///
/// Credentials are expected to be cached already, see [`validate_sudo_access`].
pub fn wrap_with_sudo(mut cmd_builder: CommandBuilder) -> Result<CommandBuilder> {
    if is_root_user() {
        Ok(cmd_builder)
    } else if is_sudo_available() {
        debug!("Wrapping with sudo: {}", cmd_builder.as_command_line());
        let args = sudo_args(&cmd_builder);
        cmd_builder.wrap("sudo", args);
        Ok(cmd_builder)
    } else {
        bail!(
            "Sudo is not available to run the command: {}",
            cmd_builder.as_command_line()
        );
    }
}
