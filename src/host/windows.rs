use std::path::{Path, PathBuf};

use super::{Host, resolve_data_dir};

pub struct NativeHost;

const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

fn taskkill(pid: u32, force: bool) -> std::io::Result<()> {
    let pid = pid.to_string();
    let mut args = vec!["/PID", pid.as_str(), "/T"];
    if force {
        args.push("/F");
    }
    std::process::Command::new("taskkill").args(&args).output()?;
    Ok(())
}

impl Host for NativeHost {
    fn data_dir() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        resolve_data_dir(base.join("botdeck"))
    }

    fn restrict_dir_permissions(_path: &Path) {
        // Windows uses ACLs; no simple equivalent to Unix mode bits.
    }

    fn restrict_file_permissions(_path: &Path) {
        // Windows uses ACLs; no simple equivalent to Unix mode bits.
    }

    fn isolate_process_group(cmd: &mut tokio::process::Command) {
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    fn terminate_group(pid: u32) -> std::io::Result<()> {
        taskkill(pid, false)
    }

    fn kill_group(pid: u32) -> std::io::Result<()> {
        taskkill(pid, true)
    }
}
