//! Restart loop for `natfwd supervise`.
//!
//! Runs `natfwd serve` as a child process and restarts it with exponential
//! backoff when it dies. A clean exit (code 0) stops the supervisor. SIGINT
//! and SIGTERM are passed on to the child, which then drains its sessions
//! and exits cleanly.

use std::io;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;

/// Delay before the next restart.
#[derive(Debug)]
struct Backoff {
    current: u64,
    max: u64,
    stable: Duration,
}

impl Backoff {
    fn new(config: &SupervisorConfig) -> Self {
        Self {
            current: 1,
            max: config.max_backoff.max(1),
            stable: Duration::from_secs(config.stable_threshold),
        }
    }

    /// Delay to wait now; a child that stayed up past the threshold resets it.
    fn next(&mut self, uptime: Duration) -> Duration {
        if uptime >= self.stable {
            self.current = 1;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Duration::from_secs(delay)
    }
}

/// Supervise the forwarder until it exits cleanly.
pub async fn run_supervisor(config_path: Option<&str>, config: &SupervisorConfig) -> io::Result<()> {
    let exe = std::env::current_exe()?;
    let mut backoff = Backoff::new(config);

    loop {
        let started = Instant::now();
        let mut cmd = Command::new(&exe);
        cmd.arg("serve");
        if let Some(path) = config_path {
            cmd.args(["--config", path]);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        info!(pid, "Supervisor: started forwarder");
        let forwarder = tokio::spawn(forward_signals(pid));

        let status = child.wait().await;
        forwarder.abort();
        let uptime = started.elapsed();

        match status {
            Ok(s) if s.success() => {
                info!("Forwarder exited cleanly, supervisor stopping");
                return Ok(());
            }
            Ok(s) => {
                let delay = backoff.next(uptime);
                warn!(
                    "Forwarder exited: {s} (uptime {:.1}s), restarting in {}s",
                    uptime.as_secs_f64(),
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                let delay = backoff.next(uptime);
                error!(
                    "Forwarder wait error: {e} (uptime {:.1}s), restarting in {}s",
                    uptime.as_secs_f64(),
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Relay the first SIGINT or SIGTERM to the child.
async fn forward_signals(pid: Option<u32>) {
    let (Ok(mut sigint), Ok(mut sigterm)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        warn!("Supervisor: cannot register signal handlers");
        return;
    };
    let sig = tokio::select! {
        _ = sigint.recv() => libc::SIGINT,
        _ = sigterm.recv() => libc::SIGTERM,
    };
    info!(signal = sig, "Supervisor: forwarding signal to forwarder");
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe {
            libc::kill(pid, sig);
        }
    }
}
