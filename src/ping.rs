//! ICMP reachability probe for registered addresses.

use std::net::IpAddr;
use std::process::Command;

use thiserror::Error;
use tracing::debug;

use crate::config::PingConfig;

#[derive(Debug, Error)]
pub enum PingError {
    #[error("Failed to run {command}: {reason}")]
    Spawn { command: String, reason: String },
}

/// Runs the system `ping` binary against single addresses.
#[derive(Debug, Clone)]
pub struct Pinger {
    config: PingConfig,
}

impl Pinger {
    pub fn new(config: PingConfig) -> Self {
        Self { config }
    }

    fn args(&self, addr: IpAddr) -> Vec<String> {
        let mut args = Vec::with_capacity(6);
        if addr.is_ipv6() {
            args.push("-6".to_string());
        }
        args.extend([
            "-c".to_string(),
            self.config.count.to_string(),
            "-W".to_string(),
            self.config.timeout_secs.to_string(),
            addr.to_string(),
        ]);
        args
    }

    /// Probe `addr`. Blocks until the command exits.
    pub fn ping(&self, addr: IpAddr) -> Result<bool, PingError> {
        let args = self.args(addr);
        debug!(command = %self.config.command, args = ?args, "Running ping");

        let output = Command::new(&self.config.command)
            .args(&args)
            .output()
            .map_err(|e| PingError::Spawn {
                command: self.config.command.clone(),
                reason: e.to_string(),
            })?;

        let reachable = output.status.success();
        debug!(address = %addr, reachable, "Ping finished");
        Ok(reachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pinger(command: &str) -> Pinger {
        Pinger::new(PingConfig {
            command: command.to_string(),
            count: 2,
            timeout_secs: 3,
        })
    }

    #[test]
    fn test_args() {
        let p = pinger("ping");
        assert_eq!(
            p.args("192.0.2.1".parse().unwrap()),
            vec!["-c", "2", "-W", "3", "192.0.2.1"]
        );
        assert_eq!(p.args("2001:db8::1".parse().unwrap())[0], "-6");
    }

    #[test]
    fn test_exit_status_decides() {
        let addr = "192.0.2.1".parse().unwrap();
        assert!(pinger("true").ping(addr).unwrap());
        assert!(!pinger("false").ping(addr).unwrap());
    }

    #[test]
    fn test_missing_binary() {
        let addr = "192.0.2.1".parse().unwrap();
        assert!(matches!(
            pinger("/nonexistent/ping").ping(addr),
            Err(PingError::Spawn { .. })
        ));
    }
}
