use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, info};

use super::{InjectOutcome, ProxyInjector, patch_proxy_assignment};
use crate::cmd::Cmd;
use crate::error::LifecycleError;
use crate::sandbox::profile::OsFamily;
use crate::sandbox::proxy::ProxyUrl;

const GUESTFISH_TIMEOUT: Duration = Duration::from_secs(600);

/// Patches one file inside a qcow2 image offline with libguestfs.
pub struct LinuxInjector {
    pub disk: PathBuf,
    /// Absolute path of the file inside the guest.
    pub guest_path: String,
    pub variable: String,
}

impl LinuxInjector {
    fn target(&self) -> String {
        self.disk.display().to_string()
    }

    fn guestfish(&self, action: &str, guest: &str, local: &Path) -> Result<(), LifecycleError> {
        let disk = self.target();
        let local = local.display().to_string();
        debug!(disk = %disk, action, guest, "inject:guestfish");
        let output = Cmd::new("guestfish")
            .args(["--rw", "-a", disk.as_str(), "-i", action])
            .args(guest_and_local(action, guest, &local))
            .env("LIBGUESTFS_BACKEND", "direct")
            .timeout(GUESTFISH_TIMEOUT)
            .output()
            .map_err(|e| LifecycleError::injection(&disk, format!("{:#}", e)))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if looks_locked(&stderr) {
            return Err(LifecycleError::ImageLocked {
                path: self.disk.clone(),
            });
        }
        Err(LifecycleError::injection(
            &disk,
            format!("guestfish {} {} failed: {}", action, guest, stderr),
        ))
    }
}

/// `download` takes (guest, local); `upload` takes (local, guest).
fn guest_and_local(action: &str, guest: &str, local: &str) -> [String; 2] {
    if action == "upload" {
        [local.to_string(), guest.to_string()]
    } else {
        [guest.to_string(), local.to_string()]
    }
}

/// qemu refuses a second writer with a "Failed to get ... lock" message.
fn looks_locked(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("failed to get") && s.contains("lock")
        || s.contains("is another process using the image")
}

/// Take an exclusive advisory lock on the image for the duration of the edit.
fn lock_image(path: &Path) -> Result<Flock<std::fs::File>, LifecycleError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| LifecycleError::precondition(path.display(), e.to_string()))?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| match errno {
        Errno::EWOULDBLOCK => LifecycleError::ImageLocked {
            path: path.to_path_buf(),
        },
        other => LifecycleError::injection(path.display(), format!("flock failed: {}", other)),
    })
}

impl ProxyInjector for LinuxInjector {
    fn family(&self) -> OsFamily {
        OsFamily::Linux
    }

    fn inject(&self, proxy: &ProxyUrl) -> Result<InjectOutcome, LifecycleError> {
        if !self.disk.is_file() {
            return Err(LifecycleError::precondition(
                self.disk.display(),
                "disk image does not exist",
            ));
        }
        if which::which("guestfish").is_err() {
            return Err(LifecycleError::precondition(
                "guestfish",
                "libguestfs tools are not installed",
            ));
        }

        let _lock = lock_image(&self.disk)?;
        info!(disk = %self.disk.display(), guest = %self.guest_path, "inject:linux locked image");

        let scratch = tempfile::tempdir()
            .context("Failed to create scratch directory")
            .map_err(|e| LifecycleError::injection(self.target(), format!("{:#}", e)))?;
        let local = scratch.path().join("guest-config");

        self.guestfish("download", &self.guest_path, &local)?;
        let content = std::fs::read_to_string(&local)
            .map_err(|e| LifecycleError::injection(&self.guest_path, e))?;
        let (patched, count) = patch_proxy_assignment(&content, &self.variable, proxy.as_str())
            .map_err(|e| LifecycleError::injection(&self.guest_path, e))?;
        std::fs::write(&local, patched).map_err(|e| LifecycleError::injection(&self.guest_path, e))?;
        self.guestfish("upload", &self.guest_path, &local)?;

        info!(
            disk = %self.disk.display(),
            guest = %self.guest_path,
            assignments = count,
            "inject:linux patched"
        );
        Ok(InjectOutcome {
            artifact: self.disk.clone(),
            in_place: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_reports_image_locked() {
        let temp = TempDir::new().unwrap();
        let disk = temp.path().join("Ubuntu.qcow2");
        std::fs::write(&disk, b"qcow").unwrap();

        let _held = lock_image(&disk).unwrap();
        match lock_image(&disk) {
            Err(LifecycleError::ImageLocked { path }) => assert_eq!(path, disk),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp = TempDir::new().unwrap();
        let disk = temp.path().join("Ubuntu.qcow2");
        std::fs::write(&disk, b"qcow").unwrap();
        drop(lock_image(&disk).unwrap());
        assert!(lock_image(&disk).is_ok());
    }

    #[test]
    fn test_missing_disk_is_precondition() {
        let injector = LinuxInjector {
            disk: PathBuf::from("/nonexistent/Ubuntu.qcow2"),
            guest_path: "/home/user/server/main.py".into(),
            variable: "PROXY_URL".into(),
        };
        let proxy = ProxyUrl::parse("http://10.1.8.5:23128").unwrap();
        assert!(matches!(
            injector.inject(&proxy),
            Err(LifecycleError::Precondition { .. })
        ));
    }

    #[test]
    fn test_qemu_lock_message_detected() {
        assert!(looks_locked(
            "qemu-img: Failed to get \"write\" lock\nIs another process using the image [/x.qcow2]?"
        ));
        assert!(!looks_locked("guestfish: no such file /home/user/server/main.py"));
    }

    #[test]
    fn test_upload_argument_order() {
        assert_eq!(
            guest_and_local("upload", "/g", "/l"),
            ["/l".to_string(), "/g".to_string()]
        );
        assert_eq!(
            guest_and_local("download", "/g", "/l"),
            ["/g".to_string(), "/l".to_string()]
        );
    }
}
