//! Host environment checks.
//!
//! Locates external programs on PATH and checks network interfaces without
//! going through a shell.

use std::path::{Path, PathBuf};

/// Sysfs directory listing network interfaces.
const SYS_CLASS_NET: &str = "/sys/class/net";

/// Find an executable.
///
/// A program containing a path separator is checked directly; otherwise each
/// directory on PATH is searched in order.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

/// Check whether a path is an executable regular file.
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Check whether a network interface exists on the host.
pub fn interface_exists(name: &str) -> bool {
    interface_exists_in(Path::new(SYS_CLASS_NET), name)
}

fn interface_exists_in(sysfs: &Path, name: &str) -> bool {
    // Reject anything that would escape the sysfs directory.
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return false;
    }
    sysfs.join(name).exists()
}
