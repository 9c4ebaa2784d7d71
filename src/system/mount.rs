use log::debug;
use nix::mount::{umount2, MntFlags, MsFlags};
use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

use super::{MountEntry, UnmountMode};

/// Parsed mount options: kernel flags plus filesystem-specific data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountOptions {
    pub flags: MsFlags,
    pub data: Option<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            flags: MsFlags::MS_RDONLY,
            data: None,
        }
    }
}

/// Parse comma separated mount options.
///
/// The result is always read-only. Unknown words go to the filesystem driver.
pub fn parse_mount_options(options: &str) -> Result<MountOptions> {
    let mut flags = MsFlags::MS_RDONLY;
    let mut data = Vec::new();

    for word in options.split(',').map(str::trim).filter(|w| !w.is_empty()) {
        match word {
            "ro" | "defaults" | "loop" => {}
            w if w.starts_with("loop=") => {}
            "rw" => {
                return Err(Error::configuration(
                    "mount option 'rw' is not supported: volume copies are mounted read-only",
                ))
            }
            "bind" | "rbind" | "move" | "remount" => {
                return Err(Error::configuration(format!(
                    "mount option '{}' is not supported",
                    word
                )))
            }
            "async" => flags.remove(MsFlags::MS_SYNCHRONOUS),
            "sync" => flags.insert(MsFlags::MS_SYNCHRONOUS),
            "atime" => flags.remove(MsFlags::MS_NOATIME),
            "noatime" => flags.insert(MsFlags::MS_NOATIME),
            "dev" => flags.remove(MsFlags::MS_NODEV),
            "nodev" => flags.insert(MsFlags::MS_NODEV),
            "diratime" => flags.remove(MsFlags::MS_NODIRATIME),
            "nodiratime" => flags.insert(MsFlags::MS_NODIRATIME),
            "dirsync" => flags.insert(MsFlags::MS_DIRSYNC),
            "exec" => flags.remove(MsFlags::MS_NOEXEC),
            "noexec" => flags.insert(MsFlags::MS_NOEXEC),
            "suid" => flags.remove(MsFlags::MS_NOSUID),
            "nosuid" => flags.insert(MsFlags::MS_NOSUID),
            "relatime" => flags.insert(MsFlags::MS_RELATIME),
            "norelatime" => flags.remove(MsFlags::MS_RELATIME),
            "strictatime" => flags.insert(MsFlags::MS_STRICTATIME),
            "lazytime" => flags.insert(MsFlags::MS_LAZYTIME),
            other => data.push(other),
        }
    }

    Ok(MountOptions {
        flags,
        data: if data.is_empty() {
            None
        } else {
            Some(data.join(","))
        },
    })
}

/// Parse `/proc/self/mounts` content.
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                source: PathBuf::from(unescape(source)),
                target: PathBuf::from(unescape(target)),
                fs_type: unescape(fs_type).to_string_lossy().into_owned(),
            })
        })
        .collect()
}

/// Decode octal escapes (`\040` for space etc.) used in the mount table.
///
/// Decoded bytes need not be UTF-8.
fn unescape(field: &str) -> OsString {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    OsString::from_vec(out)
}

pub(super) fn mount(
    source: &Path,
    target: &Path,
    fs_type: &str,
    options: &MountOptions,
) -> Result<()> {
    debug!(
        "mount {} at {} (type {}, flags {:?}, data {:?})",
        source.display(),
        target.display(),
        fs_type,
        options.flags,
        options.data
    );
    nix::mount::mount(
        Some(source),
        target,
        Some(fs_type),
        options.flags,
        options.data.as_deref(),
    )
    .map_err(|errno| {
        Error::from_errno(
            format!("mount {} at {}", source.display(), target.display()),
            errno,
        )
    })
}

pub(super) fn unmount(target: &Path, mode: UnmountMode) -> Result<()> {
    let flags = match mode {
        UnmountMode::Normal => MntFlags::empty(),
        UnmountMode::Lazy => MntFlags::MNT_DETACH,
        UnmountMode::Force => MntFlags::MNT_FORCE | MntFlags::MNT_DETACH,
    };
    debug!("unmount {} ({:?})", target.display(), mode);
    umount2(target, flags)
        .map_err(|errno| Error::from_errno(format!("unmount {}", target.display()), errno))
}

#[cfg(test)]
mod tests {
    use super::{parse_mount_options, parse_mount_table, unescape};
    use crate::system::mount_at;
    use crate::ErrorKind;
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;
    use anyhow::Result;
    use nix::mount::MsFlags;
    use std::path::Path;

    #[test]
    fn test_parse_options_flags_and_data() -> Result<()> {
        let opts = parse_mount_options("ro,noatime,nodev,loop,norecovery,errors=continue")?;
        assert!(opts.flags.contains(MsFlags::MS_RDONLY));
        assert!(opts.flags.contains(MsFlags::MS_NOATIME));
        assert!(opts.flags.contains(MsFlags::MS_NODEV));
        assert_eq!(opts.data.as_deref(), Some("norecovery,errors=continue"));
        Ok(())
    }

    #[test]
    fn test_parse_options_always_read_only() -> Result<()> {
        let opts = parse_mount_options("")?;
        assert_eq!(opts.flags, MsFlags::MS_RDONLY);
        assert_eq!(opts.data, None);

        let opts = parse_mount_options("nosuid,suid,loop=/dev/loop3")?;
        assert_eq!(opts.flags, MsFlags::MS_RDONLY);
        Ok(())
    }

    #[test]
    fn test_parse_options_rejects_rw_and_bind() {
        for opts in ["rw", "ro,bind", "remount"] {
            let err = parse_mount_options(opts).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{}", opts);
        }
    }

    #[test]
    fn test_parse_mount_table() {
        let table = "\
/dev/sda1 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/loop7 /mnt/vc\\0401 ext4 ro,relatime 0 0
broken-line
";
        let mounts = parse_mount_table(table);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[2].source, Path::new("/dev/loop7"));
        assert_eq!(mounts[2].target, Path::new("/mnt/vc 1"));
        assert_eq!(mounts[2].fs_type, "ext4");
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("/a\\011b"), "/a\tb");
        assert_eq!(unescape("/a\\\\b"), "/a\\\\b");
        assert_eq!(unescape("/trailing\\04"), "/trailing\\04");
        assert_eq!(unescape("/big\\777"), "/big\\777");
    }

    #[test]
    fn test_non_utf8_mount_point() {
        let table = "/dev/loop4 /mnt/caf\\351 ext4 ro,relatime 0 0\n";
        let entries = parse_mount_table(table);
        let expected = OsString::from_vec(b"/mnt/caf\xe9".to_vec());
        assert_eq!(entries[0].target.as_os_str(), expected.as_os_str());
        assert!(mount_at(&entries, Path::new(&expected)).is_some());
    }
}
