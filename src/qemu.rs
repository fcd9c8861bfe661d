//! QEMU command construction.
//!
//! [`build`] turns a configuration and the discovered media into the
//! `qemu-system-x86_64` argument vector. Apart from the camera probe, the
//! result depends only on its inputs: identical inputs produce identical
//! arguments.
//!
//! ```text
//! -enable-kvm -cpu host -smp 4 -m 4G -vga virtio -display none -vnc :1
//! [-drive if=pflash,... x2] [-drive file=<disk>,... ]* [-cdrom <iso>] ...
//! [-audiodev ... -device intel-hda -device hda-*] -netdev ... -device virtio-net-pci,...
//! -device qemu-xhci,id=xhci -device usb-tablet [-device usb-host,...]
//! -rtc ... -boot order=dc|c,menu=on -machine type=q35,accel=kvm
//! ```

use crate::config::{Config, DisplayMode, NetworkMode};
use crate::media::{DiskFormat, FirmwarePair, MediaSet};
use crate::usb::CameraProbe;
use std::path::{Path, PathBuf};

/// Fixed MAC address of the guest NIC.
pub const GUEST_MAC: &str = "52:54:00:12:34:56";

/// Severity of a build note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteLevel {
    /// A feature was enabled.
    Success,
    /// Progress information.
    Info,
    /// Extra detail.
    Detail,
    /// A list entry (attached media).
    Item,
    /// A feature was disabled or degraded.
    Warning,
}

/// A user-facing message produced while building the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    /// Severity.
    pub level: NoteLevel,
    /// Message text.
    pub message: String,
}

/// A complete hypervisor invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuCommand {
    /// Hypervisor executable.
    pub program: PathBuf,
    /// Arguments, excluding the program.
    pub args: Vec<String>,
    /// Messages describing what was attached.
    pub notes: Vec<Note>,
}

impl QemuCommand {
    /// Full argv including the program.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Value following the first occurrence of `flag`.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .windows(2)
            .find(|w| w[0] == flag)
            .map(|w| w[1].as_str())
    }
}

impl std::fmt::Display for QemuCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let argv = self.argv();
        let quoted: Vec<String> = argv
            .iter()
            .map(|a| {
                if a.is_empty() || a.contains(char::is_whitespace) {
                    format!("'{}'", a.replace('\'', r"'\''"))
                } else {
                    a.clone()
                }
            })
            .collect();
        f.write_str(&quoted.join(" "))
    }
}

/// Accumulates arguments and notes.
struct Builder {
    args: Vec<String>,
    notes: Vec<Note>,
}

impl Builder {
    fn arg(&mut self, flag: &str, value: impl Into<String>) -> &mut Self {
        self.args.push(flag.to_string());
        self.args.push(value.into());
        self
    }

    fn flag(&mut self, flag: &str) -> &mut Self {
        self.args.push(flag.to_string());
        self
    }

    fn note(&mut self, level: NoteLevel, message: impl Into<String>) {
        self.notes.push(Note {
            level,
            message: message.into(),
        });
    }
}

/// Build the hypervisor command.
///
/// Firmware drives are attached only when `firmware` is given. When the
/// camera is enabled, `probe` is consulted once; a failed or empty probe
/// omits the passthrough device and adds a warning note.
pub fn build(
    config: &Config,
    media: &MediaSet,
    firmware: Option<&FirmwarePair>,
    probe: &dyn CameraProbe,
) -> QemuCommand {
    let vm = &config.vm;
    let mut b = Builder {
        args: Vec::new(),
        notes: Vec::new(),
    };

    b.flag("-enable-kvm");
    b.arg("-cpu", vm.cpu_model.as_str())
        .arg("-smp", vm.cpus.to_string());
    b.arg("-m", format!("{}G", vm.ram_gb));

    b.arg("-vga", "virtio");
    match vm.display {
        DisplayMode::Remote => {
            b.arg("-display", "none")
                .arg("-vnc", format!(":{}", config.launch.vnc_display));
        }
        DisplayMode::Local => {
            b.arg("-display", "gtk,gl=on");
        }
    }

    if let Some(fw) = firmware {
        b.arg(
            "-drive",
            format!("if=pflash,format=raw,readonly=on,file={}", option_path(&fw.code)),
        );
        b.arg("-drive", format!("if=pflash,format=raw,file={}", option_path(&fw.vars)));
    }

    add_disks(&mut b, &media.disks);
    add_isos(&mut b, &media.isos);

    if vm.audio {
        b.arg("-audiodev", "alsa,id=audio0")
            .arg("-device", "intel-hda");
        if vm.microphone {
            b.arg("-device", "hda-duplex,audiodev=audio0");
            b.note(NoteLevel::Success, "Audio & Microphone enabled!");
        } else {
            b.arg("-device", "hda-output,audiodev=audio0");
            b.note(NoteLevel::Success, "Audio enabled (no microphone)");
            b.note(NoteLevel::Warning, "Microphone is disabled!");
        }
    } else {
        b.note(NoteLevel::Warning, "Audio is disabled!");
    }

    match vm.network {
        NetworkMode::Bridged => {
            b.arg("-netdev", format!("bridge,id=net0,br={}", vm.bridge));
            b.note(
                NoteLevel::Success,
                format!("Network: Bridge mode ({})", vm.bridge),
            );
        }
        NetworkMode::Nat => {
            b.arg("-netdev", "user,id=net0");
            b.note(NoteLevel::Success, "Network: NAT mode");
        }
    }
    b.arg("-device", format!("virtio-net-pci,netdev=net0,mac={}", GUEST_MAC));

    b.arg("-device", "qemu-xhci,id=xhci")
        .arg("-device", "usb-tablet");

    if vm.camera {
        add_camera(&mut b, probe);
    } else {
        b.note(NoteLevel::Warning, "Camera is disabled!");
    }

    b.arg("-rtc", "base=localtime,clock=host,driftfix=slew");

    let boot_order = if media.isos.is_empty() { "c" } else { "dc" };
    b.arg("-boot", format!("order={},menu=on", boot_order));

    b.arg("-machine", "type=q35,accel=kvm");

    QemuCommand {
        program: PathBuf::from(&config.launch.hypervisor),
        args: b.args,
        notes: b.notes,
    }
}

/// Path as a value inside a QEMU option string, where `,` separates keys.
fn option_path(path: &Path) -> String {
    path.display().to_string().replace(',', ",,")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn add_disks(b: &mut Builder, disks: &[PathBuf]) {
    if disks.is_empty() {
        return;
    }

    b.note(NoteLevel::Info, format!("Attaching {} disk(s):", disks.len()));
    for (i, disk) in disks.iter().enumerate() {
        let format = DiskFormat::from_path(disk);
        b.arg(
            "-drive",
            format!("file={},format={},if=virtio,cache=writeback", option_path(disk), format),
        );

        let tag = if i == 0 { " [PRIMARY BOOT]" } else { "" };
        b.note(NoteLevel::Item, format!("{}{}", file_name(disk), tag));
    }
}

fn add_isos(b: &mut Builder, isos: &[PathBuf]) {
    if isos.is_empty() {
        return;
    }

    b.note(NoteLevel::Info, format!("Attaching {} ISO(s):", isos.len()));
    for (i, iso) in isos.iter().enumerate() {
        if i == 0 {
            b.arg("-cdrom", iso.display().to_string());
            b.note(
                NoteLevel::Item,
                format!("{} [CDROM - BOOT PRIORITY]", file_name(iso)),
            );
        } else {
            b.arg(
                "-drive",
                format!("file={},media=cdrom,readonly=on,if=ide,index={}", option_path(iso), i),
            );
            b.note(NoteLevel::Item, format!("{} [CDROM {}]", file_name(iso), i));
        }
    }
}

fn add_camera(b: &mut Builder, probe: &dyn CameraProbe) {
    match probe.find_camera() {
        Ok(Some(cam)) => {
            b.arg(
                "-device",
                format!("usb-host,vendorid=0x{},productid=0x{}", cam.vendor, cam.product),
            );
            b.note(NoteLevel::Success, format!("Camera enabled: {}", cam.name));
            b.note(
                NoteLevel::Detail,
                format!("Camera IDs: {}:{}", cam.vendor, cam.product),
            );
        }
        Ok(None) => {
            b.note(NoteLevel::Warning, "No camera device found! Camera disabled.");
        }
        Err(e) => {
            tracing::debug!(error = %e, "camera probe failed");
            b.note(
                NoteLevel::Warning,
                format!("Could not detect camera ({}). Camera disabled.", e),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::usb::{FixedProbe, UsbDevice};

    struct FailingProbe;

    impl CameraProbe for FailingProbe {
        fn find_camera(&self) -> Result<Option<UsbDevice>> {
            Err(Error::Probe("lsusb not installed".into()))
        }
    }

    fn media(disks: &[&str], isos: &[&str]) -> MediaSet {
        MediaSet {
            disks: disks.iter().map(PathBuf::from).collect(),
            isos: isos.iter().map(PathBuf::from).collect(),
        }
    }

    fn values<'a>(cmd: &'a QemuCommand, flag: &str) -> Vec<&'a str> {
        cmd.args
            .windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    fn position(cmd: &QemuCommand, flag: &str) -> usize {
        cmd.args.iter().position(|a| a == flag).unwrap()
    }

    fn camera() -> UsbDevice {
        UsbDevice {
            vendor: "04f2".into(),
            product: "b6dd".into(),
            name: "Integrated Camera".into(),
        }
    }

    #[test]
    fn test_default_command_structure() {
        let config = Config::default();
        let fw = FirmwarePair {
            code: PathBuf::from("fw/CODE.fd"),
            vars: PathBuf::from("fw/VARS.fd"),
        };
        let cmd = build(
            &config,
            &media(&["d/a.qcow2"], &[]),
            Some(&fw),
            &FixedProbe(Some(camera())),
        );

        assert_eq!(cmd.program, PathBuf::from("qemu-system-x86_64"));
        assert_eq!(cmd.args[0], "-enable-kvm");
        assert_eq!(cmd.value_of("-cpu"), Some("host"));
        assert_eq!(cmd.value_of("-smp"), Some("4"));
        assert_eq!(cmd.value_of("-m"), Some("4G"));
        assert_eq!(cmd.value_of("-vga"), Some("virtio"));
        assert_eq!(cmd.value_of("-display"), Some("none"));
        assert_eq!(cmd.value_of("-vnc"), Some(":1"));
        assert_eq!(
            values(&cmd, "-drive"),
            [
                "if=pflash,format=raw,readonly=on,file=fw/CODE.fd",
                "if=pflash,format=raw,file=fw/VARS.fd",
                "file=d/a.qcow2,format=qcow2,if=virtio,cache=writeback",
            ]
        );
        assert_eq!(cmd.value_of("-netdev"), Some("bridge,id=net0,br=virbr0"));
        assert_eq!(
            values(&cmd, "-device"),
            [
                "intel-hda",
                "hda-duplex,audiodev=audio0",
                "virtio-net-pci,netdev=net0,mac=52:54:00:12:34:56",
                "qemu-xhci,id=xhci",
                "usb-tablet",
                "usb-host,vendorid=0x04f2,productid=0xb6dd",
            ]
        );
        assert_eq!(cmd.value_of("-rtc"), Some("base=localtime,clock=host,driftfix=slew"));
        assert_eq!(cmd.value_of("-boot"), Some("order=c,menu=on"));
        assert_eq!(cmd.args[cmd.args.len() - 2..], ["-machine", "type=q35,accel=kvm"]);

        // Section ordering
        assert!(position(&cmd, "-m") < position(&cmd, "-vga"));
        assert!(position(&cmd, "-vnc") < position(&cmd, "-drive"));
        assert!(position(&cmd, "-audiodev") < position(&cmd, "-netdev"));
        assert!(position(&cmd, "-netdev") < position(&cmd, "-rtc"));
        assert!(position(&cmd, "-rtc") < position(&cmd, "-boot"));
    }

    #[test]
    fn test_no_firmware_no_pflash() {
        let cmd = build(
            &Config::default(),
            &media(&["a.img"], &[]),
            None,
            &FixedProbe(None),
        );
        assert!(!cmd.args.iter().any(|a| a.contains("pflash")));
        assert_eq!(
            values(&cmd, "-drive"),
            ["file=a.img,format=raw,if=virtio,cache=writeback"]
        );
    }

    #[test]
    fn test_isos_and_boot_order() {
        let cmd = build(
            &Config::default(),
            &media(&["a.vdi", "b.vmdk"], &["x.iso", "y.iso", "z.iso"]),
            None,
            &FixedProbe(None),
        );

        assert_eq!(cmd.value_of("-cdrom"), Some("x.iso"));
        assert_eq!(
            values(&cmd, "-drive"),
            [
                "file=a.vdi,format=vdi,if=virtio,cache=writeback",
                "file=b.vmdk,format=vmdk,if=virtio,cache=writeback",
                "file=y.iso,media=cdrom,readonly=on,if=ide,index=1",
                "file=z.iso,media=cdrom,readonly=on,if=ide,index=2",
            ]
        );
        assert_eq!(cmd.value_of("-boot"), Some("order=dc,menu=on"));
    }

    #[test]
    fn test_commas_in_paths_are_escaped() {
        let fw = FirmwarePair {
            code: PathBuf::from("fw,1/CODE.fd"),
            vars: PathBuf::from("fw,1/VARS.fd"),
        };
        let cmd = build(
            &Config::default(),
            &media(&["d/a,b.qcow2"], &["first,cd.iso", "y,z.iso"]),
            Some(&fw),
            &FixedProbe(None),
        );

        assert_eq!(
            values(&cmd, "-drive"),
            [
                "if=pflash,format=raw,readonly=on,file=fw,,1/CODE.fd",
                "if=pflash,format=raw,file=fw,,1/VARS.fd",
                "file=d/a,,b.qcow2,format=qcow2,if=virtio,cache=writeback",
                "file=y,,z.iso,media=cdrom,readonly=on,if=ide,index=1",
            ]
        );
        // -cdrom takes a bare file name, not an option string
        assert_eq!(cmd.value_of("-cdrom"), Some("first,cd.iso"));
    }

    #[test]
    fn test_local_display_nat_no_audio() {
        let mut config = Config::default();
        config.vm.display = DisplayMode::Local;
        config.vm.network = NetworkMode::Nat;
        config.vm.audio = false;
        config.vm.camera = false;
        config.vm.cpus = 2;
        config.vm.ram_gb = 8;

        let cmd = build(&config, &media(&[], &["live.iso"]), None, &FixedProbe(Some(camera())));

        assert_eq!(cmd.value_of("-display"), Some("gtk,gl=on"));
        assert!(cmd.value_of("-vnc").is_none());
        assert!(cmd.value_of("-audiodev").is_none());
        assert_eq!(cmd.value_of("-netdev"), Some("user,id=net0"));
        assert!(!cmd.args.iter().any(|a| a.starts_with("usb-host")));
        assert_eq!(cmd.value_of("-smp"), Some("2"));
        assert_eq!(cmd.value_of("-m"), Some("8G"));
        assert!(cmd
            .notes
            .iter()
            .any(|n| n.level == NoteLevel::Warning && n.message == "Camera is disabled!"));
    }

    #[test]
    fn test_microphone_disabled_uses_output_only() {
        let mut config = Config::default();
        config.vm.microphone = false;
        let cmd = build(&config, &media(&["a.qcow2"], &[]), None, &FixedProbe(None));
        assert!(values(&cmd, "-device").contains(&"hda-output,audiodev=audio0"));
        assert!(!values(&cmd, "-device").contains(&"hda-duplex,audiodev=audio0"));
    }

    #[test]
    fn test_failed_probe_omits_camera_and_warns() {
        let cmd = build(
            &Config::default(),
            &media(&["a.qcow2"], &[]),
            None,
            &FailingProbe,
        );
        assert!(!cmd.args.iter().any(|a| a.starts_with("usb-host")));
        assert!(cmd
            .notes
            .iter()
            .any(|n| n.level == NoteLevel::Warning && n.message.contains("lsusb not installed")));
    }

    #[test]
    fn test_build_is_deterministic() {
        let config = Config::default();
        let media = media(&["a.qcow2", "b.raw"], &["c.iso"]);
        let probe = FixedProbe(Some(camera()));

        let first = build(&config, &media, None, &probe);
        let second = build(&config, &media, None, &probe);
        assert_eq!(first.args, second.args);

        // Only the probe result changes the arguments
        let without_camera = build(&config, &media, None, &FixedProbe(None));
        let diff: Vec<_> = first
            .args
            .iter()
            .filter(|a| !without_camera.args.contains(a))
            .collect();
        assert_eq!(diff, ["usb-host,vendorid=0x04f2,productid=0xb6dd"]);
    }

    #[test]
    fn test_display_quotes_whitespace() {
        let cmd = QemuCommand {
            program: PathBuf::from("qemu"),
            args: vec!["-cdrom".into(), "my disc.iso".into()],
            notes: vec![],
        };
        assert_eq!(cmd.to_string(), "qemu -cdrom 'my disc.iso'");
    }
}
