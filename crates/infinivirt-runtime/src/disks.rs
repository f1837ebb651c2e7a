//! Disk-image creation, delegated to an external service.
//!
//! Images are created at VM create and never deleted by this system; the
//! user disposes of them explicitly.

use std::path::Path;

use anyhow::{Context, Result};

use infinivirt_host::exec;

use crate::control::BoxFuture;

pub trait DiskImageService: Send + Sync {
    /// Create a disk image of `size_gb` at `path`. Must be a no-op when the
    /// image already exists.
    fn create_image<'a>(&'a self, path: &'a Path, size_gb: u32) -> BoxFuture<'a, Result<()>>;
}

/// Production implementation over qemu-img.
pub struct QemuImgService;

impl DiskImageService for QemuImgService {
    fn create_image<'a>(&'a self, path: &'a Path, size_gb: u32) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if path.exists() {
                return Ok(());
            }
            let path_str = path.display().to_string();
            let size = format!("{}G", size_gb);
            exec::run_ok(
                "qemu-img",
                &[
                    "create",
                    "-f",
                    "qcow2",
                    "-o",
                    "preallocation=metadata",
                    &path_str,
                    &size,
                ],
            )
            .await
            .with_context(|| format!("Failed to create disk image {}", path_str))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infinivirt_host::exec_mock::{MockResponse, mock};

    #[tokio::test]
    async fn test_create_image_invokes_qemu_img() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm-abc123.qcow2");
        let (_guard, calls) = mock().install();

        QemuImgService.create_image(&path, 50).await.unwrap();
        let log = calls.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].starts_with("qemu-img create -f qcow2 -o preallocation=metadata"));
        assert!(log[0].ends_with("vm-abc123.qcow2 50G"));
    }

    #[tokio::test]
    async fn test_existing_image_is_not_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm-abc123.qcow2");
        std::fs::write(&path, "existing").unwrap();
        let (_guard, calls) = mock().install();

        QemuImgService.create_image(&path, 50).await.unwrap();
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "existing");
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let (_guard, _calls) = mock()
            .on("qemu-img create", MockResponse::err(1, "No space left on device"))
            .install();

        let err = QemuImgService
            .create_image(&dir.path().join("x.qcow2"), 10)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("No space left"));
    }
}
