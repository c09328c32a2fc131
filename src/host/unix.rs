use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::{Host, resolve_data_dir};

pub struct NativeHost;

fn signal_group(pid: u32, signal: Signal) -> std::io::Result<()> {
    let pgid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => Ok(()),
        // Group already gone.
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

impl Host for NativeHost {
    fn data_dir() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        resolve_data_dir(home.join(".botdeck"))
    }

    fn restrict_dir_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
    }

    fn restrict_file_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }

    fn isolate_process_group(cmd: &mut tokio::process::Command) {
        cmd.process_group(0);
    }

    fn terminate_group(pid: u32) -> std::io::Result<()> {
        signal_group(pid, Signal::SIGTERM)
    }

    fn kill_group(pid: u32) -> std::io::Result<()> {
        signal_group(pid, Signal::SIGKILL)
    }
}
