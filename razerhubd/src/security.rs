//! Privilege inspection and control-socket permissions.
//!
//! The daemon runs either as root (system service) or as a user in the
//! `input` group. Helpers here answer which of the two we are and tighten
//! the IPC socket accordingly.

use nix::unistd::{chown, getuid, Gid, Group};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, warn};

const UINPUT_PATH: &str = "/dev/uinput";

pub fn is_root() -> bool {
    getuid().is_root()
}

/// Whether we can create the virtual output device. Checked once at
/// startup so a misconfigured system fails with one clear message instead
/// of an opaque uinput error later.
pub fn has_input_access() -> bool {
    fs::OpenOptions::new().write(true).open(UINPUT_PATH).is_ok()
}

/// Restrict the control socket. As root the socket is opened up to the
/// `input` group (mode 0660) so desktop clients can reach the daemon;
/// otherwise it stays owner-only (0600).
pub fn set_socket_permissions(path: &Path) -> io::Result<()> {
    if !is_root() {
        return apply_mode(path, 0o600);
    }
    match input_group() {
        Some(gid) => {
            chown(path, None, Some(gid)).map_err(io::Error::from)?;
            debug!("Socket {} assigned to group input ({})", path.display(), gid);
            apply_mode(path, 0o660)
        }
        None => {
            // Without the group the group bits would open nothing useful.
            warn!("Group 'input' not found, keeping socket owner-only");
            apply_mode(path, 0o600)
        }
    }
}

fn input_group() -> Option<Gid> {
    match Group::from_name("input") {
        Ok(Some(group)) => Some(group.gid),
        Ok(None) => None,
        Err(e) => {
            warn!("Lookup of group 'input' failed: {}", e);
            None
        }
    }
}

fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn socket_mode_is_restricted() {
        let file = NamedTempFile::new().unwrap();
        set_socket_permissions(file.path()).unwrap();

        let mode = fs::metadata(file.path()).unwrap().permissions().mode() & 0o777;
        if is_root() {
            // Group assignment depends on the host having an input group.
            assert!(mode == 0o660 || mode == 0o600);
        } else {
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn missing_socket_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("razerhub.sock");
        assert!(set_socket_permissions(&gone).is_err());
    }
}
