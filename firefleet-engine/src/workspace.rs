//! Per-user, per-VM directory layout.
//!
//! ```text
//! {base_dir}/vm_for_users_{owner}/vm_{id}/
//!     kernel/<file name>   staged kernel
//!     rootfs/<file name>   staged rootfs
//!     disk.ext4            derived root disk (written by the storage collaborator)
//!     vm_config.json       hypervisor config
//!     metrics.json         metrics sink
//!     console.log          serial console
//!     firecracker.log      hypervisor stderr
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use firefleet_core::{OwnerId, VmId, VmTemplate};

use crate::firecracker::FirecrackerConfig;
use crate::EngineError;

const USER_DIR_PREFIX: &str = "vm_for_users_";
const VM_DIR_PREFIX: &str = "vm_";
const KERNEL_DIR: &str = "kernel";
const ROOTFS_DIR: &str = "rootfs";

/// Every path owned by one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLayout {
    pub vm_dir: PathBuf,
    pub kernel_image: PathBuf,
    pub rootfs_image: PathBuf,
    pub disk_image: PathBuf,
    pub config_path: PathBuf,
    pub metrics_path: PathBuf,
    pub console_log: PathBuf,
    pub hypervisor_log: PathBuf,
}

/// A per-VM directory found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDirEntry {
    pub owner: OwnerId,
    pub vm_id: VmId,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    #[must_use]
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    #[must_use]
    pub fn user_dir(&self, owner: OwnerId) -> PathBuf {
        self.base_dir.join(format!("{USER_DIR_PREFIX}{owner}"))
    }

    #[must_use]
    pub fn vm_dir(&self, owner: OwnerId, id: VmId) -> PathBuf {
        self.user_dir(owner).join(format!("{VM_DIR_PREFIX}{id}"))
    }

    /// Compute the layout without touching the filesystem.
    ///
    /// Each image keeps its file name inside its own role directory, so no
    /// image can land on another image or on a generated file.
    ///
    /// # Errors
    /// Returns [`EngineError::Workspace`] if a template image path has no
    /// file name.
    pub fn layout(
        &self,
        owner: OwnerId,
        id: VmId,
        template: &VmTemplate,
    ) -> Result<VmLayout, EngineError> {
        let vm_dir = self.vm_dir(owner, id);
        let staged = |role: &str, source: &Path| {
            source.file_name().map(|name| vm_dir.join(role).join(name)).ok_or_else(|| {
                EngineError::workspace(
                    source,
                    std::io::Error::new(ErrorKind::InvalidInput, "image path has no file name"),
                )
            })
        };

        Ok(VmLayout {
            kernel_image: staged(KERNEL_DIR, &template.kernel_image)?,
            rootfs_image: staged(ROOTFS_DIR, &template.rootfs_image)?,
            disk_image: vm_dir.join("disk.ext4"),
            config_path: vm_dir.join("vm_config.json"),
            metrics_path: vm_dir.join("metrics.json"),
            console_log: vm_dir.join("console.log"),
            hypervisor_log: vm_dir.join("firecracker.log"),
            vm_dir,
        })
    }

    /// Create the directory tree and stage the template images into it.
    ///
    /// # Errors
    /// Returns [`EngineError::Workspace`] naming the path that failed, which
    /// is the source path when an image is missing.
    pub async fn materialize(
        &self,
        layout: &VmLayout,
        template: &VmTemplate,
    ) -> Result<(), EngineError> {
        for dir in [KERNEL_DIR, ROOTFS_DIR] {
            let path = layout.vm_dir.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| EngineError::workspace(&path, e))?;
        }

        stage(&template.kernel_image, &layout.kernel_image).await?;
        stage(&template.rootfs_image, &layout.rootfs_image).await?;

        tokio::fs::write(&layout.metrics_path, b"")
            .await
            .map_err(|e| EngineError::workspace(&layout.metrics_path, e))?;

        tracing::debug!(vm_dir = %layout.vm_dir.display(), "workspace materialized");
        Ok(())
    }

    /// Serialize `config` to the layout's config path.
    ///
    /// # Errors
    /// Returns [`EngineError::Workspace`] if the file cannot be written.
    pub async fn write_config(
        &self,
        layout: &VmLayout,
        config: &FirecrackerConfig,
    ) -> Result<(), EngineError> {
        let body = serde_json::to_vec_pretty(config).map_err(|e| {
            EngineError::workspace(&layout.config_path, std::io::Error::new(ErrorKind::InvalidData, e))
        })?;
        tokio::fs::write(&layout.config_path, body)
            .await
            .map_err(|e| EngineError::workspace(&layout.config_path, e))
    }

    /// Remove a VM's directory tree. Absent trees are not an error.
    ///
    /// # Errors
    /// Returns [`EngineError::Workspace`] if the tree exists but cannot be
    /// removed.
    pub async fn destroy(&self, vm_dir: &Path) -> Result<(), EngineError> {
        match tokio::fs::remove_dir_all(vm_dir).await {
            Ok(()) => {
                tracing::debug!(vm_dir = %vm_dir.display(), "workspace destroyed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::workspace(vm_dir, e)),
        }
    }

    /// Every `vm_for_users_*/vm_*` directory under the base directory.
    /// Entries whose names do not parse are skipped.
    ///
    /// # Errors
    /// Returns [`EngineError::Workspace`] if a directory cannot be read.
    pub async fn list_vm_dirs(&self) -> Result<Vec<VmDirEntry>, EngineError> {
        let mut found = Vec::new();
        let mut users = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(users) => users,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(EngineError::workspace(&self.base_dir, e)),
        };

        while let Some(user) = next_entry(&mut users, &self.base_dir).await? {
            let Some(owner) = parse_suffix(&user.file_name(), USER_DIR_PREFIX) else {
                continue;
            };
            let user_path = user.path();
            if !user_path.is_dir() {
                continue;
            }
            let mut vms = tokio::fs::read_dir(&user_path)
                .await
                .map_err(|e| EngineError::workspace(&user_path, e))?;
            while let Some(vm) = next_entry(&mut vms, &user_path).await? {
                if let Some(id) = parse_suffix(&vm.file_name(), VM_DIR_PREFIX) {
                    found.push(VmDirEntry {
                        owner: OwnerId::new(owner),
                        vm_id: VmId::new(id),
                        path: vm.path(),
                    });
                }
            }
        }

        found.sort_by_key(|entry| entry.vm_id);
        Ok(found)
    }
}

async fn stage(source: &Path, dest: &Path) -> Result<(), EngineError> {
    if !tokio::fs::try_exists(source).await.unwrap_or(false) {
        return Err(EngineError::workspace(
            source,
            std::io::Error::new(ErrorKind::NotFound, "source image not found"),
        ));
    }
    tokio::fs::copy(source, dest)
        .await
        .map(|_| ())
        .map_err(|e| EngineError::workspace(source, e))
}

async fn next_entry(
    dir: &mut tokio::fs::ReadDir,
    path: &Path,
) -> Result<Option<tokio::fs::DirEntry>, EngineError> {
    dir.next_entry()
        .await
        .map_err(|e| EngineError::workspace(path, e))
}

fn parse_suffix(name: &std::ffi::OsStr, prefix: &str) -> Option<i64> {
    name.to_str()?.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use firefleet_core::StorageSize;

    use super::*;

    fn template(dir: &Path) -> VmTemplate {
        VmTemplate {
            cpu: 2,
            ram: 512,
            storage: StorageSize::parse("2G").unwrap_or_else(|e| panic!("{e}")),
            kernel_image: dir.join("k.img"),
            rootfs_image: dir.join("r.img"),
        }
    }

    fn images(dir: &Path) {
        for name in ["k.img", "r.img"] {
            std::fs::write(dir.join(name), name.as_bytes()).unwrap_or_else(|e| panic!("{e}"));
        }
    }

    #[test]
    fn layout_paths_embed_owner_and_id() {
        let ws = WorkspaceManager::new(PathBuf::from("/tmp/vms"));
        let layout = ws
            .layout(OwnerId::new(42), VmId::new(7), &template(Path::new("/images")))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(layout.vm_dir, PathBuf::from("/tmp/vms/vm_for_users_42/vm_7"));
        assert_eq!(layout.kernel_image, layout.vm_dir.join("kernel/k.img"));
        assert_eq!(layout.rootfs_image, layout.vm_dir.join("rootfs/r.img"));
        assert_eq!(layout.disk_image, layout.vm_dir.join("disk.ext4"));
        assert_eq!(layout.config_path, layout.vm_dir.join("vm_config.json"));
    }

    #[test]
    fn layouts_of_different_ids_never_overlap() {
        let ws = WorkspaceManager::new(PathBuf::from("/tmp/vms"));
        let t = template(Path::new("/images"));
        let a = ws.layout(OwnerId::new(1), VmId::new(1), &t).unwrap_or_else(|e| panic!("{e}"));
        let b = ws.layout(OwnerId::new(1), VmId::new(11), &t).unwrap_or_else(|e| panic!("{e}"));
        assert!(!b.vm_dir.starts_with(&a.vm_dir));
        assert_ne!(a.config_path, b.config_path);
    }

    #[tokio::test]
    async fn materialize_stages_images_and_metrics_sink() {
        let src = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let base = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        images(src.path());

        let ws = WorkspaceManager::new(base.path().to_owned());
        let t = template(src.path());
        let layout = ws.layout(OwnerId::new(1), VmId::new(3), &t).unwrap_or_else(|e| panic!("{e}"));
        if let Err(e) = ws.materialize(&layout, &t).await {
            panic!("materialize: {e}");
        }

        assert_eq!(std::fs::read(&layout.kernel_image).ok(), Some(b"k.img".to_vec()));
        assert_eq!(std::fs::read(&layout.rootfs_image).ok(), Some(b"r.img".to_vec()));
        assert!(layout.metrics_path.exists());
    }

    #[tokio::test]
    async fn images_sharing_a_file_name_are_staged_apart() {
        let src = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let base = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        for (dir, content) in [("a", "KERNEL"), ("b", "ROOTFS")] {
            std::fs::create_dir_all(src.path().join(dir)).unwrap_or_else(|e| panic!("{e}"));
            std::fs::write(src.path().join(dir).join("image"), content)
                .unwrap_or_else(|e| panic!("{e}"));
        }

        let ws = WorkspaceManager::new(base.path().to_owned());
        let mut t = template(src.path());
        t.kernel_image = src.path().join("a/image");
        t.rootfs_image = src.path().join("b/image");
        let layout = ws.layout(OwnerId::new(1), VmId::new(2), &t).unwrap_or_else(|e| panic!("{e}"));
        assert_ne!(layout.kernel_image, layout.rootfs_image);
        if let Err(e) = ws.materialize(&layout, &t).await {
            panic!("materialize: {e}");
        }

        assert_eq!(std::fs::read(&layout.kernel_image).ok(), Some(b"KERNEL".to_vec()));
        assert_eq!(std::fs::read(&layout.rootfs_image).ok(), Some(b"ROOTFS".to_vec()));
    }

    #[test]
    fn images_named_like_generated_files_do_not_collide() {
        let ws = WorkspaceManager::new(PathBuf::from("/tmp/vms"));
        let mut t = template(Path::new("/images"));
        t.kernel_image = PathBuf::from("/images/metrics.json");
        t.rootfs_image = PathBuf::from("/images/disk.ext4");
        let layout = ws.layout(OwnerId::new(1), VmId::new(2), &t).unwrap_or_else(|e| panic!("{e}"));

        let generated = [
            &layout.disk_image,
            &layout.config_path,
            &layout.metrics_path,
            &layout.console_log,
            &layout.hypervisor_log,
        ];
        for image in [&layout.kernel_image, &layout.rootfs_image] {
            assert!(!generated.contains(&image), "{} collides", image.display());
        }
    }

    #[tokio::test]
    async fn missing_image_names_the_source_path() {
        let src = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let base = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));

        let ws = WorkspaceManager::new(base.path().to_owned());
        let t = template(src.path());
        let layout = ws.layout(OwnerId::new(1), VmId::new(3), &t).unwrap_or_else(|e| panic!("{e}"));
        match ws.materialize(&layout, &t).await {
            Err(EngineError::Workspace { path, .. }) => assert_eq!(path, t.kernel_image),
            other => panic!("expected Workspace error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_keeps_user_dir() {
        let src = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let base = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        images(src.path());

        let ws = WorkspaceManager::new(base.path().to_owned());
        let t = template(src.path());
        let layout = ws.layout(OwnerId::new(5), VmId::new(1), &t).unwrap_or_else(|e| panic!("{e}"));
        if let Err(e) = ws.materialize(&layout, &t).await {
            panic!("materialize: {e}");
        }

        assert!(ws.destroy(&layout.vm_dir).await.is_ok());
        assert!(ws.destroy(&layout.vm_dir).await.is_ok());
        assert!(!layout.vm_dir.exists());
        assert!(ws.user_dir(OwnerId::new(5)).exists());
    }

    #[tokio::test]
    async fn list_vm_dirs_parses_owner_and_id() {
        let base = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let ws = WorkspaceManager::new(base.path().to_owned());
        for (owner, id) in [(2, 9), (1, 4)] {
            let dir = ws.vm_dir(OwnerId::new(owner), VmId::new(id));
            std::fs::create_dir_all(dir).unwrap_or_else(|e| panic!("{e}"));
        }
        std::fs::create_dir_all(base.path().join("unrelated")).unwrap_or_else(|e| panic!("{e}"));

        let found = ws.list_vm_dirs().await.unwrap_or_else(|e| panic!("{e}"));
        let ids: Vec<_> = found.iter().map(|e| (e.owner.get(), e.vm_id.get())).collect();
        assert_eq!(ids, [(1, 4), (2, 9)]);
    }
}
