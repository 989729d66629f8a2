//! Best-effort port reclamation: when `bind()` fails with `AddrInUse`, try
//! to kill whatever process is holding the port before giving up. This is
//! a narrow, OS-specific collaborator behind a single boolean function so
//! the broker engine itself stays free of process-management concerns.
//!
//! Non-Linux platforms always return `false`: there's no portable way to
//! find a port's owning process without a dependency the rest of this
//! crate has no other use for.

use mdp_core::endpoint::Endpoint;

/// Attempt to free `endpoint` by killing whatever process is bound to it.
/// Returns `true` if a reclamation attempt was made and reported success;
/// the caller should retry its bind regardless, since "reported success"
/// doesn't guarantee the OS has released the socket yet.
#[must_use]
pub fn try_reclaim(endpoint: &Endpoint) -> bool {
    let Endpoint::Tcp(addr) = endpoint else {
        return false;
    };
    imp::kill_port(addr.port())
}

#[cfg(target_os = "linux")]
mod imp {
    use std::process::Command;
    use tracing::warn;

    pub(super) fn kill_port(port: u16) -> bool {
        match Command::new("fuser")
            .arg("-k")
            .arg(format!("{port}/tcp"))
            .status()
        {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(error = %e, port, "port reclamation via fuser failed to run");
                false
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    pub(super) fn kill_port(_port: u16) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_tcp_endpoints_are_never_reclaimed() {
        let endpoint = Endpoint::parse("ipc:///tmp/mdp-test.sock").unwrap();
        assert!(!try_reclaim(&endpoint));
    }
}
