//! Validating and reloading the running proxy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ProxyError, ProxyResult};

#[async_trait]
pub trait ProxyController: Send + Sync {
    /// Check the on-disk configuration after `changed` was rewritten,
    /// without applying it.
    async fn validate(&self, changed: &Path) -> ProxyResult<()>;

    /// Make the running proxy pick up the on-disk configuration.
    async fn reload(&self) -> ProxyResult<()>;
}

/// Drives the `caddy` CLI against the main Caddyfile.
pub struct CaddyController {
    binary: String,
    main_config: PathBuf,
    reload_command: Option<Vec<String>>,
    timeout: Duration,
}

impl CaddyController {
    pub fn new(
        binary: &str,
        main_config: &Path,
        reload_command: Option<Vec<String>>,
        timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.to_string(),
            main_config: main_config.to_path_buf(),
            reload_command,
            timeout,
        }
    }

    pub fn validate_args(&self, config: &Path) -> Vec<String> {
        vec![
            self.binary.clone(),
            "validate".to_string(),
            "--config".to_string(),
            config.display().to_string(),
            "--adapter".to_string(),
            "caddyfile".to_string(),
        ]
    }

    pub fn reload_args(&self) -> Vec<String> {
        match &self.reload_command {
            Some(command) if !command.is_empty() => command.clone(),
            _ => vec![
                self.binary.clone(),
                "reload".to_string(),
                "--config".to_string(),
                self.main_config.display().to_string(),
                "--adapter".to_string(),
                "caddyfile".to_string(),
            ],
        }
    }

    /// Run argv; returns stderr on a non-zero exit.
    async fn run(&self, argv: &[String]) -> ProxyResult<Result<(), String>> {
        let command = argv.join(" ");
        let Some((program, args)) = argv.split_first() else {
            return Err(ProxyError::Command {
                command,
                reason: "empty command".to_string(),
            });
        };
        debug!(%command, "running proxy command");
        let output = Command::new(program).args(args).kill_on_drop(true).output();
        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProxyError::Command {
                    command,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ProxyError::Command {
                    command,
                    reason: format!("timed out after {}s", self.timeout.as_secs()),
                });
            }
        };
        if output.status.success() {
            Ok(Ok(()))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Ok(Err(stderr))
        }
    }
}

#[async_trait]
impl ProxyController for CaddyController {
    /// The site file on its own first, so errors point at it, then the
    /// main config that imports every site.
    async fn validate(&self, changed: &Path) -> ProxyResult<()> {
        for config in [changed, self.main_config.as_path()] {
            self.run(&self.validate_args(config)).await?.map_err(|stderr| {
                ProxyError::ConfigRejected(format!("{}: {stderr}", config.display()))
            })?;
        }
        Ok(())
    }

    async fn reload(&self) -> ProxyResult<()> {
        match self.run(&self.reload_args()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(stderr)) => Err(ProxyError::ReloadFailed(stderr)),
            Err(e) => Err(ProxyError::ReloadFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_commands_use_caddyfile_adapter() {
        let controller = CaddyController::new(
            "caddy",
            Path::new("/etc/caddy/Caddyfile"),
            None,
            Duration::from_secs(30),
        );
        assert_eq!(
            controller
                .validate_args(Path::new("/etc/caddy/sites/shop-production.caddy"))
                .join(" "),
            "caddy validate --config /etc/caddy/sites/shop-production.caddy --adapter caddyfile"
        );
        assert_eq!(
            controller.reload_args().join(" "),
            "caddy reload --config /etc/caddy/Caddyfile --adapter caddyfile"
        );
    }

    #[test]
    fn reload_override() {
        let controller = CaddyController::new(
            "caddy",
            Path::new("/etc/caddy/Caddyfile"),
            Some(vec!["systemctl".to_string(), "reload".to_string(), "caddy".to_string()]),
            Duration::from_secs(30),
        );
        assert_eq!(controller.reload_args().join(" "), "systemctl reload caddy");
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let controller = CaddyController::new(
            "slipway-no-such-caddy",
            Path::new("/nonexistent"),
            None,
            Duration::from_secs(5),
        );
        assert!(matches!(
            controller.validate(Path::new("/nonexistent/site.caddy")).await,
            Err(ProxyError::Command { .. })
        ));
        assert!(matches!(
            controller.reload().await,
            Err(ProxyError::ReloadFailed(_))
        ));
    }
}
