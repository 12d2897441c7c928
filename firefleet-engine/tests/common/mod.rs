//! Shared fixtures: a shell-script hypervisor, recording collaborators and
//! a fully wired orchestrator rooted in a temporary directory.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use firefleet_core::{
    CreateVmRequest, OwnerId, StorageSize, VmId, VmNetwork, VmPaths, VmRecord, VmResources,
    VmState, VmTemplate,
};
use firefleet_engine::{
    Cleanup, Collaborators, EngineConfig, EngineError, LaunchSpec, NetworkSetup, RootfsRequest,
    ScriptFailure, SqliteRegistry, StorageSetup, TapRequest, VmOrchestrator, VmmBackend,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Stays up and touches its socket path (`$2`).
pub const ALIVE: &str = r#": > "$2"; exec sleep 30"#;
/// Dies immediately with a diagnostic on stderr.
pub const CRASHES: &str = "echo 'kernel panic: cannot open root device' >&2; exit 1";
/// Survives the liveness grace period, then exits.
pub const SHORT_LIVED: &str = r#": > "$2"; sleep 0.6"#;
/// Stays up but never creates its socket.
pub const SILENT: &str = "exec sleep 30";
/// Like [`ALIVE`], and records its pid next to the config file.
pub const PID_FILE: &str = r#"echo $$ > "$4.pid"; : > "$2"; exec sleep 30"#;

/// Runs `sh -c <script> firecracker --api-sock <socket> --config-file <config>`.
pub struct ScriptHypervisor(pub &'static str);

#[async_trait]
impl VmmBackend for ScriptHypervisor {
    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(self.0)
            .arg("firecracker")
            .arg("--api-sock")
            .arg(&spec.socket_path)
            .arg("--config-file")
            .arg(&spec.config_path);
        command
    }

    async fn health_check(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Collaborators that record every call and fail on demand.
#[derive(Default)]
pub struct MockCollaborators {
    calls: Mutex<Vec<String>>,
    pub fail_attach: AtomicBool,
    pub fail_prepare: AtomicBool,
    pub fail_release: AtomicBool,
    /// Park inside `prepare_rootfs` until `prepare_release` is notified.
    pub block_prepare: AtomicBool,
    pub prepare_entered: Notify,
    pub prepare_release: Notify,
    /// Put a directory where the hypervisor config is about to be written.
    pub occupy_config: AtomicBool,
}

impl MockCollaborators {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn outcome(&self, flag: &AtomicBool, operation: &'static str) -> Result<(), ScriptFailure> {
        if flag.load(Ordering::SeqCst) {
            Err(ScriptFailure {
                operation,
                status: Some(1),
                diagnostic: format!("injected {operation} failure"),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NetworkSetup for MockCollaborators {
    async fn attach_tap(&self, request: &TapRequest<'_>) -> Result<(), ScriptFailure> {
        self.record(format!("attach_tap {} {}", request.iface, request.bridge));
        self.outcome(&self.fail_attach, "attach_tap")
    }

    async fn detach_tap(&self, iface: &str) -> Result<(), ScriptFailure> {
        self.record(format!("detach_tap {iface}"));
        Ok(())
    }
}

#[async_trait]
impl StorageSetup for MockCollaborators {
    async fn prepare_rootfs(&self, request: &RootfsRequest<'_>) -> Result<(), ScriptFailure> {
        self.record(format!(
            "prepare_rootfs {} {}",
            request.dest_image.display(),
            request.size
        ));
        if self.block_prepare.load(Ordering::SeqCst) {
            self.prepare_entered.notify_one();
            self.prepare_release.notified().await;
        }
        self.outcome(&self.fail_prepare, "prepare_rootfs")?;
        if self.occupy_config.load(Ordering::SeqCst) {
            if let Some(vm_dir) = request.dest_image.parent() {
                let _ = std::fs::create_dir_all(vm_dir.join("vm_config.json"));
            }
        }
        std::fs::copy(request.src_image, request.dest_image)
            .map(|_| ())
            .map_err(|e| ScriptFailure {
                operation: "prepare_rootfs",
                status: None,
                diagnostic: e.to_string(),
            })
    }
}

#[async_trait]
impl Cleanup for MockCollaborators {
    async fn release(&self, socket_path: &Path) -> Result<(), ScriptFailure> {
        self.record(format!("release {}", socket_path.display()));
        self.outcome(&self.fail_release, "release")
    }
}

/// A wired orchestrator plus handles on everything it touches.
pub struct Harness {
    pub engine: Arc<VmOrchestrator>,
    pub registry: Arc<SqliteRegistry>,
    pub collaborators: Arc<MockCollaborators>,
    pub config: EngineConfig,
    pub root: TempDir,
}

impl Harness {
    pub fn new(script: &'static str) -> Self {
        let root = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let registry =
            Arc::new(SqliteRegistry::in_memory().unwrap_or_else(|e| panic!("registry: {e}")));
        Self::with_registry(script, root, registry)
    }

    /// A second orchestrator over the same registry and directories, as if
    /// the service had restarted.
    pub fn restarted(self, script: &'static str) -> Self {
        let Harness { registry, root, engine, .. } = self;
        drop(engine);
        Self::with_registry(script, root, registry)
    }

    fn with_registry(script: &'static str, root: TempDir, registry: Arc<SqliteRegistry>) -> Self {
        let images = root.path().join("images");
        std::fs::create_dir_all(&images).unwrap_or_else(|e| panic!("{e}"));
        for name in ["k.img", "r.img"] {
            std::fs::write(images.join(name), name).unwrap_or_else(|e| panic!("{e}"));
        }

        let mut config = EngineConfig::default();
        config.base_dir = root.path().join("vms");
        config.socket_dir = root.path().join("sockets");
        config.database_path = root.path().join("vm.db");
        config.use_sudo = false;
        config.liveness_grace = Duration::from_millis(150);
        config.socket_timeout = Duration::from_secs(2);
        config.terminate_timeout = Duration::from_millis(500);
        config.control_bridge_host = None;
        config.sweep_interval = None;

        let collaborators = Arc::new(MockCollaborators::default());
        let engine = VmOrchestrator::new(
            config.clone(),
            registry.clone(),
            Arc::new(ScriptHypervisor(script)),
            Collaborators {
                network: collaborators.clone(),
                storage: collaborators.clone(),
                cleanup: collaborators.clone(),
            },
        );

        Self {
            engine: Arc::new(engine),
            registry,
            collaborators,
            config,
            root,
        }
    }

    pub fn images(&self) -> PathBuf {
        self.root.path().join("images")
    }

    pub fn request(&self, user_id: i64) -> CreateVmRequest {
        CreateVmRequest {
            user_id,
            identifier: 1,
            ip_addr: "192.168.5.8/24".to_owned(),
            hostname: "vm1".to_owned(),
            gateway: "192.168.5.1".to_owned(),
            ssh_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKtest user@host".to_owned(),
            template: VmTemplate {
                cpu: 2,
                ram: 512,
                storage: StorageSize::parse("2G").unwrap_or_else(|e| panic!("{e}")),
                kernel_image: self.images().join("k.img"),
                rootfs_image: self.images().join("r.img"),
            },
        }
    }

    pub fn vm_dir(&self, owner: i64, id: VmId) -> PathBuf {
        self.config
            .base_dir
            .join(format!("vm_for_users_{owner}"))
            .join(format!("vm_{id}"))
    }

    pub fn socket_path(&self, id: VmId) -> PathBuf {
        self.config.socket_dir.join(format!("firecracker_{id}.sock"))
    }

    /// A record as an earlier process would have left it.
    pub fn record(&self, id: i64, owner: i64, port: u16, state: VmState) -> VmRecord {
        let now = Utc::now();
        let vm_id = VmId::new(id);
        let vm_dir = self.vm_dir(owner, vm_id);
        VmRecord {
            id: vm_id,
            owner_id: OwnerId::new(owner),
            identifier: 0,
            resources: VmResources {
                cpu: 1,
                ram_mib: 128,
                storage: StorageSize::parse("1G").unwrap_or_else(|e| panic!("{e}")),
            },
            network: VmNetwork {
                ip_addr: "10.0.0.2".to_owned(),
                hostname: format!("vm{id}"),
                gateway: "10.0.0.1".to_owned(),
                vm_iface: format!("tap{port}"),
                port,
            },
            paths: VmPaths {
                kernel_image: vm_dir.join("kernel/k.img"),
                rootfs_image: vm_dir.join("rootfs/r.img"),
                config_path: vm_dir.join("vm_config.json"),
                vm_dir,
                socket_path: self.socket_path(vm_id),
            },
            state,
            created_at: now,
            updated_at: now,
        }
    }
}

pub async fn create_ok(harness: &Harness, user_id: i64) -> firefleet_engine::Created {
    match harness.engine.create(&harness.request(user_id)).await {
        Ok(created) => created,
        Err(e) => panic!("create for user {user_id} failed: {e}"),
    }
}

/// Pid written by a [`PID_FILE`] hypervisor for `vm_dir`.
pub fn hypervisor_pid(vm_dir: &Path) -> u32 {
    let text = std::fs::read_to_string(vm_dir.join("vm_config.json.pid"))
        .unwrap_or_else(|e| panic!("pid file in {}: {e}", vm_dir.display()));
    text.trim().parse().unwrap_or_else(|e| panic!("pid {text:?}: {e}"))
}

/// Whether a process with `pid` exists.
pub fn process_exists(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn kill_process(pid: u32) {
    let _ = std::process::Command::new("kill").arg(pid.to_string()).status();
}

/// A fake hypervisor API answering `204 No Content` to every request.
pub fn serve_api(socket_path: &Path) -> JoinHandle<()> {
    if let Some(dir) = socket_path.parent() {
        std::fs::create_dir_all(dir).unwrap_or_else(|e| panic!("{e}"));
    }
    let listener = UnixListener::bind(socket_path)
        .unwrap_or_else(|e| panic!("bind {}: {e}", socket_path.display()));
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request_complete(&request) {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    })
}

fn request_complete(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        return false;
    };
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    body.len() >= length
}
