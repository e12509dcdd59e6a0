//! Early-boot mounts for the virtual filesystems the daemon needs.
use std::ffi::CString;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("Mount {target} failed: {source}")]
    MountFailed {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Mount {target} has fstype {found}, expected {expected}")]
    FstypeMismatch {
        target: String,
        expected: String,
        found: String,
    },

    #[error("Reading /proc/mounts failed: {0}")]
    ProcMounts(#[source] io::Error),
}

struct MountSpec {
    source: &'static str,
    target: &'static str,
    fstype: &'static str,
    flags: libc::c_ulong,
    data: &'static str,
}

const NOSUID: libc::c_ulong = libc::MS_NOSUID;
const NODEV: libc::c_ulong = libc::MS_NODEV;
const NOEXEC: libc::c_ulong = libc::MS_NOEXEC;

/// Mounted in order; `/proc` first so the verification pass can read it.
const MOUNTS: &[MountSpec] = &[
    MountSpec { source: "proc", target: "/proc", fstype: "proc", flags: NOSUID | NODEV | NOEXEC, data: "" },
    MountSpec { source: "sysfs", target: "/sys", fstype: "sysfs", flags: NOSUID | NODEV | NOEXEC, data: "" },
    MountSpec { source: "securityfs", target: "/sys/kernel/security", fstype: "securityfs", flags: NOSUID | NODEV | NOEXEC, data: "" },
    MountSpec { source: "debugfs", target: "/sys/kernel/debug", fstype: "debugfs", flags: NOSUID | NODEV | NOEXEC, data: "" },
    MountSpec { source: "tracefs", target: "/sys/kernel/tracing", fstype: "tracefs", flags: NOSUID | NODEV | NOEXEC, data: "" },
    MountSpec { source: "cgroup2", target: "/sys/fs/cgroup", fstype: "cgroup2", flags: NOSUID | NODEV | NOEXEC, data: "nsdelegate,memory_recursiveprot" },
    MountSpec { source: "pstore", target: "/sys/fs/pstore", fstype: "pstore", flags: NOSUID | NODEV | NOEXEC, data: "" },
    MountSpec { source: "bpf", target: "/sys/fs/bpf", fstype: "bpf", flags: NOSUID | NODEV | NOEXEC, data: "mode=700" },
    MountSpec { source: "devtmpfs", target: "/dev", fstype: "devtmpfs", flags: NOSUID, data: "mode=755" },
    MountSpec { source: "mqueue", target: "/dev/mqueue", fstype: "mqueue", flags: NOSUID | NODEV | NOEXEC, data: "" },
    MountSpec { source: "tmpfs", target: "/dev/shm", fstype: "tmpfs", flags: NOSUID | NODEV, data: "" },
    MountSpec { source: "devpts", target: "/dev/pts", fstype: "devpts", flags: NOSUID | NOEXEC, data: "gid=5,mode=620" },
    MountSpec { source: "tmpfs", target: "/run", fstype: "tmpfs", flags: NOSUID | NODEV, data: "" },
    MountSpec { source: "tmpfs", target: "/tmp", fstype: "tmpfs", flags: NOSUID | NODEV, data: "" },
];

/// Mount the standard virtual filesystems, then verify against
/// `/proc/mounts`. An already-present mount with the right fstype is fine;
/// the wrong fstype on an expected target is fatal.
pub fn bootstrap() -> Result<(), MountError> {
    for spec in MOUNTS {
        mount_one(spec)?;
    }
    let mounts = std::fs::read_to_string("/proc/mounts").map_err(MountError::ProcMounts)?;
    verify(&mounts)
}

fn mount_one(spec: &MountSpec) -> Result<(), MountError> {
    let _ = std::fs::create_dir_all(spec.target);
    let source = CString::new(spec.source).expect("static source");
    let target = CString::new(spec.target).expect("static target");
    let fstype = CString::new(spec.fstype).expect("static fstype");
    let data = CString::new(spec.data).expect("static data");

    let rc = unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            spec.flags,
            data.as_ptr().cast(),
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        // EBUSY means the target is already mounted; verification decides
        // whether what is there is acceptable.
        if err.raw_os_error() != Some(libc::EBUSY) {
            return Err(MountError::MountFailed {
                target: spec.target.to_string(),
                source: err,
            });
        }
    }
    Ok(())
}

/// Check every expected target against the given `/proc/mounts` content.
fn verify(proc_mounts: &str) -> Result<(), MountError> {
    for spec in MOUNTS {
        let found = proc_mounts
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let _source = fields.next()?;
                let target = fields.next()?;
                let fstype = fields.next()?;
                (target == spec.target).then(|| fstype.to_string())
            })
            .next_back();
        if let Some(found) = found
            && found != spec.fstype
        {
            return Err(MountError::FstypeMismatch {
                target: spec.target.to_string(),
                expected: spec.fstype.to_string(),
                found,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_matching_table() {
        let table = "proc /proc proc rw 0 0\nsysfs /sys sysfs rw 0 0\n";
        assert!(verify(table).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_fstype() {
        let table = "tmpfs /proc tmpfs rw 0 0\n";
        let err = verify(table).unwrap_err();
        assert!(matches!(err, MountError::FstypeMismatch { .. }));
    }

    #[test]
    fn verify_ignores_missing_targets() {
        assert!(verify("").is_ok());
    }

    #[test]
    fn later_mount_wins_verification() {
        let table = "tmpfs /tmp ext4 rw 0 0\ntmpfs /tmp tmpfs rw 0 0\n";
        assert!(verify(table).is_ok());
    }
}
