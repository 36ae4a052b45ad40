use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use crate::error::{PublishError, PublishResult};

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Run the configured pre-build command to completion with the terminal's
/// stdout and stderr.
pub async fn run_custom_build(command: &str, cwd: &Path) -> PublishResult<()> {
    info!("Running custom build: {}", command);
    let status = shell(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await?;

    if !status.success() {
        return Err(PublishError::CustomBuild {
            command: command.to_string(),
            status,
        });
    }
    Ok(())
}
