//! Port-forward subprocess backing a forwarded tunnel.
//!
//! The subprocess (by default `kubectl port-forward`) is considered ready
//! once it prints its first stdout line. After that a background task keeps
//! draining stdout and stderr so a full pipe can never stall the forwarder.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Program and argument template for the forward subprocess.
///
/// Arguments may contain `{namespace}`, `{pod}`, `{local}` and `{remote}`.
#[derive(Debug, Clone)]
pub struct ForwardCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ForwardCommand {
    pub fn render(&self, namespace: &str, pod: &str, local: u16, remote: u16) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{namespace}", namespace)
                    .replace("{pod}", pod)
                    .replace("{local}", &local.to_string())
                    .replace("{remote}", &remote.to_string())
            })
            .collect()
    }
}

pub struct ForwardedTunnel {
    local_port: u16,
    child: Mutex<Child>,
    cancel: CancellationToken,
}

impl ForwardedTunnel {
    /// Spawn the forwarder for `namespace/pod` and wait for its readiness line.
    pub async fn spawn(
        command: &ForwardCommand,
        namespace: &str,
        pod: &str,
        local_port: u16,
        remote_port: u16,
        ready_timeout: Duration,
    ) -> Result<Self> {
        let args = command.render(namespace, pod, local_port, remote_port);
        debug!("Spawning {} {}", command.program, args.join(" "));

        let mut child = Command::new(&command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", command.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("Failed to take stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Spawn("Failed to take stderr pipe".to_string()))?;
        let mut stdout_lines = BufReader::new(stdout).lines();

        match tokio::time::timeout(ready_timeout, stdout_lines.next_line()).await {
            Ok(Ok(Some(line))) => debug!("Forwarder on :{local_port} ready: {line}"),
            Ok(Ok(None)) => {
                let _ = child.start_kill();
                return Err(Error::Spawn(format!(
                    "forwarder for {pod} exited before becoming ready"
                )));
            }
            Ok(Err(e)) => {
                let _ = child.start_kill();
                return Err(Error::Spawn(format!("reading forwarder output: {e}")));
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(Error::Spawn(format!(
                    "forwarder for {pod} not ready after {}s",
                    ready_timeout.as_secs()
                )));
            }
        }

        let cancel = CancellationToken::new();
        let drain_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stderr_lines = BufReader::new(stderr).lines();
            let mut stdout_open = true;
            let mut stderr_open = true;
            while stdout_open || stderr_open {
                tokio::select! {
                    () = drain_cancel.cancelled() => break,
                    line = stdout_lines.next_line(), if stdout_open => match line {
                        Ok(Some(l)) => debug!("forward :{local_port}: {l}"),
                        _ => stdout_open = false,
                    },
                    line = stderr_lines.next_line(), if stderr_open => match line {
                        Ok(Some(l)) => warn!("forward :{local_port}: {l}"),
                        _ => stderr_open = false,
                    },
                }
            }
        });

        Ok(Self {
            local_port,
            child: Mutex::new(child),
            cancel,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether the subprocess is still running.
    pub fn is_alive(&self) -> bool {
        let Ok(mut child) = self.child.lock() else {
            return false;
        };
        matches!(child.try_wait(), Ok(None))
    }

    /// Kill the subprocess and stop draining its output.
    pub fn close(&self) {
        self.cancel.cancel();
        if let Ok(mut child) = self.child.lock() {
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ForwardCommand {
        ForwardCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[test]
    fn test_render_placeholders() {
        let cmd = ForwardCommand {
            program: "kubectl".into(),
            args: vec![
                "port-forward".into(),
                "-n".into(),
                "{namespace}".into(),
                "pod/{pod}".into(),
                "{local}:{remote}".into(),
            ],
        };
        assert_eq!(
            cmd.render("ns", "job-1-0", 31000, 5900),
            vec!["port-forward", "-n", "ns", "pod/job-1-0", "31000:5900"]
        );
    }

    #[tokio::test]
    async fn test_ready_then_close() {
        let tunnel = ForwardedTunnel::spawn(
            &sh("echo Forwarding from 127.0.0.1:{local}; exec sleep 30"),
            "ns",
            "pod",
            31001,
            5900,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(tunnel.is_alive());
        assert_eq!(tunnel.local_port(), 31001);

        tunnel.close();
        for _ in 0..100 {
            if !tunnel.is_alive() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("forwarder still alive after close");
    }

    #[tokio::test]
    async fn test_exit_before_ready_is_spawn_error() {
        let err = ForwardedTunnel::spawn(
            &sh("exit 3"),
            "ns",
            "pod",
            31002,
            5900,
            Duration::from_secs(5),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[tokio::test]
    async fn test_ready_timeout() {
        let err = ForwardedTunnel::spawn(
            &sh("exec sleep 30"),
            "ns",
            "pod",
            31003,
            5900,
            Duration::from_millis(100),
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("not ready"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let cmd = ForwardCommand {
            program: "/nonexistent/forwarder".into(),
            args: vec![],
        };
        let err = ForwardedTunnel::spawn(&cmd, "ns", "pod", 31004, 5900, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "SPAWN_FAILED");
    }
}
