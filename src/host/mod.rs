use std::path::{Path, PathBuf};

/// Host operating system operations behind a common interface, so the
/// supervisor and store stay free of `#[cfg]` blocks.
pub trait Host {
    /// Root data directory for botdeck.
    /// Unix: `~/.botdeck`, Windows: `%APPDATA%\botdeck`.
    fn data_dir() -> PathBuf;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Put the child in its own process group so signals reach the whole tree.
    fn isolate_process_group(cmd: &mut tokio::process::Command);

    /// Ask the process group led by `pid` to shut down gracefully.
    fn terminate_group(pid: u32) -> std::io::Result<()>;

    /// Forcefully kill the process group led by `pid`.
    fn kill_group(pid: u32) -> std::io::Result<()>;
}

/// `BOTDECK_DATA_DIR` overrides the per-host default.
pub fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var_os("BOTDECK_DATA_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativeHost;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativeHost;
