//! Boot media and firmware discovery.
//!
//! This module scans the disk and ROM directories for bootable images,
//! creates a default disk when none exists, and materializes the UEFI
//! variable store next to the firmware code image.
//!
//! Scan results are sorted lexicographically, so the primary boot disk and
//! primary boot CD are always the first match in name order.

use crate::config::PathsConfig;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Extensions recognized as disk images.
pub const DISK_EXTENSIONS: &[&str] = &["qcow2", "img", "raw", "vdi", "vmdk"];

/// Extension recognized as an optical image.
pub const ISO_EXTENSION: &str = "iso";

/// Default disk created with the disk-image tool.
pub const DEFAULT_DISK_FILENAME: &str = "disk.qcow2";

/// Default disk written directly when the disk-image tool is unavailable.
pub const FALLBACK_DISK_FILENAME: &str = "disk.img";

/// Size of a synthesized UEFI variable store (64 MiB).
pub const SYNTHESIZED_VARS_SIZE: u64 = 64 * 1024 * 1024;

const GIB: u64 = 1024 * 1024 * 1024;

/// Disk image format passed to QEMU's `format=` drive option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    /// Raw image (`.img`, `.raw`).
    Raw,
    /// VirtualBox image (`.vdi`).
    Vdi,
    /// VMware image (`.vmdk`).
    Vmdk,
    /// QEMU copy-on-write image; also the fallback for unknown extensions.
    Qcow2,
}

impl DiskFormat {
    /// Infer the format from a path's extension.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("img") | Some("raw") => DiskFormat::Raw,
            Some("vdi") => DiskFormat::Vdi,
            Some("vmdk") => DiskFormat::Vmdk,
            _ => DiskFormat::Qcow2,
        }
    }

    /// QEMU format token.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Vdi => "vdi",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Qcow2 => "qcow2",
        }
    }
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bootable media discovered at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaSet {
    /// Disk images; the first is the primary boot disk.
    pub disks: Vec<PathBuf>,
    /// ISO images; the first is the primary boot CD.
    pub isos: Vec<PathBuf>,
}

/// How the VM will boot given the discovered media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// ISO boots first, disks persist the installation.
    Install,
    /// ISO only, nothing persists.
    LiveIso,
    /// Disk boot.
    Disk,
}

impl std::fmt::Display for BootMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootMode::Install => write!(f, "ISO Installation with persistent disk(s)"),
            BootMode::LiveIso => write!(f, "Live ISO (no persistent storage)"),
            BootMode::Disk => write!(f, "Disk boot"),
        }
    }
}

impl MediaSet {
    /// Scan the configured disk and ROM directories.
    pub fn scan(paths: &PathsConfig) -> Result<Self> {
        Ok(Self {
            disks: scan_disks(&paths.disk_dir)?,
            isos: scan_isos(&paths.rom_dir)?,
        })
    }

    /// Returns true when there is nothing to boot from.
    pub fn is_empty(&self) -> bool {
        self.disks.is_empty() && self.isos.is_empty()
    }

    /// Boot mode, or `None` when the set is empty.
    pub fn boot_mode(&self) -> Option<BootMode> {
        match (self.disks.is_empty(), self.isos.is_empty()) {
            (false, false) => Some(BootMode::Install),
            (true, false) => Some(BootMode::LiveIso),
            (false, true) => Some(BootMode::Disk),
            (true, true) => None,
        }
    }
}

/// List disk images in `dir`, sorted by path.
///
/// A missing directory yields an empty list.
pub fn scan_disks(dir: &Path) -> Result<Vec<PathBuf>> {
    scan_dir(dir, DISK_EXTENSIONS)
}

/// List ISO images in `dir`, sorted by path.
///
/// A missing directory yields an empty list.
pub fn scan_isos(dir: &Path) -> Result<Vec<PathBuf>> {
    scan_dir(dir, &[ISO_EXTENSION])
}

fn scan_dir(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::storage(format!("scan {}", dir.display()), e.to_string()))?;

    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && has_extension(p, extensions))
        .collect();
    found.sort();

    for path in &found {
        tracing::debug!(path = %path.display(), "found media");
    }

    Ok(found)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|x| ext.eq_ignore_ascii_case(x)))
}

/// Create the directory layout the launcher expects.
pub fn ensure_layout(paths: &PathsConfig) -> Result<()> {
    let mut dirs = vec![paths.disk_dir.clone(), paths.rom_dir.clone()];
    for file in [&paths.firmware_code, &paths.firmware_vars, &paths.web_dir] {
        if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
            dirs.push(parent.to_path_buf());
        }
    }

    for dir in dirs {
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::storage(format!("create {}", dir.display()), e.to_string()))?;
    }

    Ok(())
}

/// Create a default disk in `dir` unless a disk image already exists there.
///
/// Returns `Ok(None)` without touching the filesystem when any recognized
/// disk exists. Otherwise a `size_gb` disk is created with `tool`
/// (`qemu-img`) as `disk.qcow2`, or, when no tool is available, written
/// directly as a sparse raw `disk.img`.
pub fn ensure_default_disk(dir: &Path, size_gb: u64, tool: Option<&Path>) -> Result<Option<PathBuf>> {
    if !scan_disks(dir)?.is_empty() {
        return Ok(None);
    }

    std::fs::create_dir_all(dir)
        .map_err(|e| Error::storage("create disk directory", e.to_string()))?;

    let path = match tool {
        Some(tool) => {
            let path = dir.join(DEFAULT_DISK_FILENAME);
            create_with_tool(tool, &path, size_gb)?;
            path
        }
        None => {
            let path = dir.join(FALLBACK_DISK_FILENAME);
            create_sparse_disk(&path, size_gb * GIB)?;
            path
        }
    };

    Ok(Some(path))
}

/// Run `qemu-img create -f qcow2 <path> <size>G`.
fn create_with_tool(tool: &Path, path: &Path, size_gb: u64) -> Result<()> {
    tracing::info!(tool = %tool.display(), path = %path.display(), size_gb, "creating qcow2 disk");

    let output = Command::new(tool)
        .arg("create")
        .arg("-f")
        .arg("qcow2")
        .arg(path)
        .arg(format!("{}G", size_gb))
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::storage("run disk tool", e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::storage(
            "create default disk",
            format!("{} exited with {}: {}", tool.display(), output.status, stderr.trim()),
        ));
    }

    Ok(())
}

/// Create a sparse disk image file.
fn create_sparse_disk(path: &Path, size_bytes: u64) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    if size_bytes == 0 {
        return Err(Error::storage("create sparse disk", "disk size must be greater than 0"));
    }

    tracing::info!(path = %path.display(), size_gb = size_bytes / GIB, "creating sparse raw disk");

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| Error::storage("create sparse disk", e.to_string()))?;
    file.seek(SeekFrom::Start(size_bytes - 1))?;
    file.write_all(&[0])?;
    file.sync_all()?;

    Ok(())
}

/// UEFI firmware code and variable store attached as pflash drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePair {
    /// Read-only firmware code.
    pub code: PathBuf,
    /// Read-write variable store.
    pub vars: PathBuf,
}

/// Where the variable store came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarsOrigin {
    /// The file was already present.
    Existing,
    /// Copied from a system template.
    Copied(PathBuf),
    /// Zero-filled placeholder. UEFI may not persist settings.
    Synthesized,
}

/// Make sure the UEFI variable store at `path` exists.
///
/// Copies the first existing template from `candidates`; if none can be
/// copied, writes a 64 MiB zero-filled file.
pub fn ensure_firmware_vars(path: &Path, candidates: &[PathBuf]) -> Result<VarsOrigin> {
    if path.exists() {
        return Ok(VarsOrigin::Existing);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::storage("create firmware directory", e.to_string()))?;
    }

    for source in candidates.iter().filter(|c| c.is_file()) {
        match std::fs::copy(source, path) {
            Ok(_) => return Ok(VarsOrigin::Copied(source.clone())),
            Err(e) => {
                tracing::debug!(source = %source.display(), error = %e, "failed to copy vars template");
            }
        }
    }

    let file = std::fs::File::create(path)
        .map_err(|e| Error::storage("create vars file", e.to_string()))?;
    file.set_len(SYNTHESIZED_VARS_SIZE)
        .map_err(|e| Error::storage("size vars file", e.to_string()))?;

    Ok(VarsOrigin::Synthesized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_disk_format_inference() {
        let cases = [
            ("a.vdi", "vdi"),
            ("a.img", "raw"),
            ("a.raw", "raw"),
            ("a.vmdk", "vmdk"),
            ("a.qcow2", "qcow2"),
            ("a.bin", "qcow2"),
            ("noext", "qcow2"),
            ("A.VDI", "vdi"),
        ];
        for (path, expected) in cases {
            assert_eq!(
                DiskFormat::from_path(Path::new(path)).as_str(),
                expected,
                "{}",
                path
            );
        }
    }

    #[test]
    fn test_scan_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "zeta.qcow2");
        touch(dir.path(), "alpha.vdi");
        touch(dir.path(), "notes.txt");
        touch(dir.path(), "mid.img");
        touch(dir.path(), "cd.iso");
        std::fs::create_dir(dir.path().join("folder.qcow2")).unwrap();

        let disks = scan_disks(dir.path()).unwrap();
        let names: Vec<_> = disks
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, ["alpha.vdi", "mid.img", "zeta.qcow2"]);

        // Re-scanning an unchanged directory gives the same sequence
        assert_eq!(scan_disks(dir.path()).unwrap(), disks);

        let isos = scan_isos(dir.path()).unwrap();
        assert_eq!(isos, vec![dir.path().join("cd.iso")]);
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_disks(&dir.path().join("nope")).unwrap().is_empty());
        assert!(scan_isos(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_boot_mode() {
        let mut media = MediaSet::default();
        assert!(media.is_empty());
        assert_eq!(media.boot_mode(), None);

        media.isos.push(PathBuf::from("a.iso"));
        assert_eq!(media.boot_mode(), Some(BootMode::LiveIso));

        media.disks.push(PathBuf::from("a.qcow2"));
        assert_eq!(media.boot_mode(), Some(BootMode::Install));

        media.isos.clear();
        assert_eq!(media.boot_mode(), Some(BootMode::Disk));
    }

    #[test]
    fn test_default_disk_noop_when_disk_exists() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "existing.vmdk");

        let created = ensure_default_disk(dir.path(), 1, None).unwrap();
        assert!(created.is_none());

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_default_disk_sparse_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let disk_dir = dir.path().join("disk");

        let created = ensure_default_disk(&disk_dir, 1, None).unwrap().unwrap();
        assert_eq!(created, disk_dir.join(FALLBACK_DISK_FILENAME));
        assert_eq!(std::fs::metadata(&created).unwrap().len(), GIB);
        assert_eq!(scan_disks(&disk_dir).unwrap(), vec![created]);
    }

    #[test]
    fn test_default_disk_with_tool() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("qemu-img");
        // create -f qcow2 <path> <size>
        std::fs::write(&tool, "#!/bin/sh\n: > \"$4\"\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let disk_dir = dir.path().join("disk");
        let created = ensure_default_disk(&disk_dir, 30, Some(&tool)).unwrap().unwrap();
        assert_eq!(created, disk_dir.join(DEFAULT_DISK_FILENAME));
        assert!(created.exists());
    }

    #[test]
    fn test_default_disk_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("qemu-img");
        std::fs::write(&tool, "#!/bin/sh\necho nope >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = ensure_default_disk(&dir.path().join("disk"), 30, Some(&tool)).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_firmware_vars_existing() {
        let dir = tempfile::tempdir().unwrap();
        let vars = touch(dir.path(), "OVMF_VARS.fd");
        assert_eq!(ensure_firmware_vars(&vars, &[]).unwrap(), VarsOrigin::Existing);
    }

    #[test]
    fn test_firmware_vars_copied_from_first_existing() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.fd");
        std::fs::write(&template, b"vars").unwrap();
        let vars = dir.path().join("fw").join("OVMF_VARS.fd");

        let candidates = vec![dir.path().join("missing.fd"), template.clone()];
        let origin = ensure_firmware_vars(&vars, &candidates).unwrap();
        assert_eq!(origin, VarsOrigin::Copied(template));
        assert_eq!(std::fs::read(&vars).unwrap(), b"vars");
    }

    #[test]
    fn test_firmware_vars_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let vars = dir.path().join("OVMF_VARS.fd");

        let origin = ensure_firmware_vars(&vars, &[dir.path().join("missing.fd")]).unwrap();
        assert_eq!(origin, VarsOrigin::Synthesized);
        assert_eq!(std::fs::metadata(&vars).unwrap().len(), SYNTHESIZED_VARS_SIZE);
    }

    #[test]
    fn test_ensure_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let paths = PathsConfig {
            disk_dir: root.join("devices/disk"),
            rom_dir: root.join("devices/rom"),
            firmware_code: root.join("boot/firmware/OVMF_CODE.fd"),
            firmware_vars: root.join("boot/firmware/OVMF_VARS.fd"),
            web_dir: root.join("libraries/noVNC"),
            vars_templates: vec![],
        };

        ensure_layout(&paths).unwrap();
        assert!(root.join("devices/disk").is_dir());
        assert!(root.join("devices/rom").is_dir());
        assert!(root.join("boot/firmware").is_dir());
        assert!(root.join("libraries").is_dir());
        assert!(!root.join("libraries/noVNC").exists());
    }
}
