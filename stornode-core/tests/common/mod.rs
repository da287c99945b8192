//! Shared fixtures: a file-backed volume group and recording collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use stornode_core::config::ScrubConfig;
use stornode_core::exec::command_line;
use stornode_core::scrub::{CowHeader, Exception};
use stornode_core::{
    paths, BackupStore, BlockTransport, CommandRunner, Config, ExportTarget, ImageInfo,
    ImageRepository, ResourceKind, Result, StatusReporter, StatusUpdate, StorageError,
    VolumeManager, VolumeManagerBuilder, VolumeStatus,
};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

pub const VG: &str = "vg";
pub const MARKER: u8 = 0xa5;
/// Data chunks referenced by every fake COW store.
pub const COW_EXCEPTIONS: u64 = 2;

/// A held `lvs` call: `reached` fires once it is held, `resume` lets it go.
struct Pause {
    remaining: usize,
    reached: Arc<Notify>,
    resume: Arc<Notify>,
}

#[derive(Debug, Clone)]
struct FakeLv {
    size: u64,
    origin: Option<String>,
    tag: String,
}

/// Emulates `lvs`/`vgs`/`lvcreate`/`lvchange`/`lvremove`/`dmsetup` and
/// `qemu-img convert` on plain files under a temp directory.
///
/// Volumes live at `<dev>/vg/<id>`. A snapshot starts as a copy of its origin
/// and gets a COW store at `<dev>/mapper/<dm>-cow` whose data chunks hold
/// [`MARKER`]. Device and COW files are kept after `lvremove` so tests can
/// inspect them.
pub struct FakeLvm {
    dev: PathBuf,
    capacity: u64,
    volumes: Mutex<BTreeMap<String, FakeLv>>,
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
    pause: Mutex<Option<Pause>>,
}

impl FakeLvm {
    pub fn new(dev: &Path, capacity: u64) -> Self {
        Self {
            dev: dev.to_path_buf(),
            capacity,
            volumes: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
            pause: Mutex::new(None),
        }
    }

    /// Hold the `nth` `lvs` call from now on, after it has read the volume
    /// table, until `resume` is notified. Returns `(reached, resume)`.
    pub fn pause_lvs(&self, nth: usize) -> (Arc<Notify>, Arc<Notify>) {
        let (reached, resume) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        *self.pause.lock().unwrap() =
            Some(Pause { remaining: nth, reached: reached.clone(), resume: resume.clone() });
        (reached, resume)
    }

    fn take_pause(&self) -> Option<(Arc<Notify>, Arc<Notify>)> {
        let mut pause = self.pause.lock().unwrap();
        let held = pause.as_mut()?;
        held.remaining -= 1;
        if held.remaining > 0 {
            return None;
        }
        pause.take().map(|p| (p.reached, p.resume))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Fail every command whose line contains `needle`.
    pub fn fail_on(&self, needle: &str) {
        *self.fail_on.lock().unwrap() = Some(needle.to_string());
    }

    pub fn tag_of(&self, id: &str) -> Option<String> {
        self.volumes.lock().unwrap().get(id).map(|lv| lv.tag.clone())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.volumes.lock().unwrap().contains_key(id)
    }

    /// Add a volume directly, as if left by an earlier process.
    pub fn seed(&self, id: &str, size: u64, tag: &str, fill: u8) {
        let path = self.device(id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![fill; size as usize]).unwrap();
        self.volumes
            .lock()
            .unwrap()
            .insert(id.to_string(), FakeLv { size, origin: None, tag: tag.to_string() });
    }

    pub fn device(&self, id: &str) -> PathBuf {
        self.dev.join(VG).join(id)
    }

    pub fn cow_device(&self, id: &str) -> PathBuf {
        self.dev.join("mapper").join(format!("{}-cow", paths::dm_name(VG, id)))
    }

    fn lvs(&self) -> String {
        self.volumes
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(minor, (id, lv))| {
                format!(
                    "  {}:{}:{}:{}:253:{}\n",
                    id,
                    lv.size,
                    lv.origin.clone().unwrap_or_default(),
                    lv.tag,
                    minor
                )
            })
            .collect()
    }

    fn vgs(&self) -> String {
        let used: u64 = self.volumes.lock().unwrap().values().map(|lv| lv.size).sum();
        format!("  {}:{}\n", self.capacity, self.capacity.saturating_sub(used))
    }

    fn lvcreate(&self, args: &[&str]) -> Result<()> {
        let value = |flag: &str| {
            args.iter()
                .position(|a| *a == flag)
                .and_then(|i| args.get(i + 1))
                .map(|v| v.to_string())
        };
        let size: u64 = value("-L").unwrap().trim_end_matches('b').parse().unwrap();
        let id = value("-n").unwrap();
        let tag = value("--addtag").unwrap();
        let target = args.last().unwrap().to_string();

        let path = self.device(&id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let origin = if args.contains(&"-s") {
            let origin = target.split_once('/').unwrap().1.to_string();
            std::fs::copy(self.device(&origin), &path).unwrap();
            self.write_cow(&id);
            Some(origin)
        } else {
            let file =
                OpenOptions::new().create(true).write(true).truncate(true).open(&path).unwrap();
            file.set_len(size).unwrap();
            None
        };
        self.volumes.lock().unwrap().insert(id, FakeLv { size, origin, tag });
        Ok(())
    }

    /// Header, one metadata store and the data chunks it references.
    fn write_cow(&self, id: &str) {
        let path = self.cow_device(id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let chunks = 2 + COW_EXCEPTIONS as usize;
        let mut image = vec![MARKER; chunks * 512];
        image[..16].copy_from_slice(&CowHeader::new(1).to_bytes());
        image[512..1024].fill(0);
        for i in 0..COW_EXCEPTIONS {
            let record = Exception { old_chunk: 10 + i, new_chunk: 2 + i }.to_bytes();
            let at = 512 + i as usize * 16;
            image[at..at + 16].copy_from_slice(&record);
        }
        std::fs::write(path, image).unwrap();
    }

    fn lvchange(&self, args: &[&str]) -> Result<()> {
        let id = args.last().unwrap().split_once('/').unwrap().1;
        let tag = args
            .iter()
            .position(|a| *a == "--addtag")
            .map(|i| args[i + 1].to_string())
            .unwrap();
        let mut volumes = self.volumes.lock().unwrap();
        let lv = volumes.get_mut(id).ok_or_else(|| missing(id))?;
        lv.tag = tag;
        Ok(())
    }

    fn lvremove(&self, args: &[&str]) -> Result<()> {
        let id = args.last().unwrap().split_once('/').unwrap().1;
        // The device file stays behind so tests can check it was scrubbed.
        self.volumes.lock().unwrap().remove(id).ok_or_else(|| missing(id))?;
        Ok(())
    }

    fn qemu_convert(&self, args: &[&str]) -> Result<()> {
        let src = args[args.len() - 2];
        let dst = args[args.len() - 1];
        let data = std::fs::read(src).unwrap();
        let out = OpenOptions::new().write(true).open(dst).unwrap();
        out.write_all_at(&data, 0).unwrap();
        Ok(())
    }
}

fn missing(id: &str) -> StorageError {
    StorageError::Process {
        cmd: format!("lv {}", id),
        stdout: String::new(),
        stderr: format!("Failed to find logical volume \"{}/{}\"", VG, id),
        exit_code: 5,
    }
}

#[async_trait]
impl CommandRunner for FakeLvm {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let line = command_line(program, args);
        self.calls.lock().unwrap().push(line.clone());
        if let Some(needle) = self.fail_on.lock().unwrap().as_deref() {
            if line.contains(needle) {
                return Err(StorageError::Process {
                    cmd: line,
                    stdout: String::new(),
                    stderr: "injected failure".into(),
                    exit_code: 1,
                });
            }
        }
        if program == "lvs" {
            let out = self.lvs();
            if let Some((reached, resume)) = self.take_pause() {
                reached.notify_one();
                resume.notified().await;
            }
            return Ok(out);
        }
        match program {
            "vgs" => Ok(self.vgs()),
            "lvcreate" => self.lvcreate(args).map(|_| String::new()),
            "lvchange" => self.lvchange(args).map(|_| String::new()),
            "lvremove" => self.lvremove(args).map(|_| String::new()),
            "dmsetup" if args.first() == Some(&"table") => Ok("0 8 linear 7:0 0\n".to_string()),
            "dmsetup" => Ok(String::new()),
            "qemu-img" => self.qemu_convert(args).map(|_| String::new()),
            other => panic!("unexpected command {}", other),
        }
    }
}

/// Captures every status report.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(ResourceKind, String, StatusUpdate)>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<(ResourceKind, String, StatusUpdate)> {
        self.reports.lock().unwrap().clone()
    }

    /// Statuses reported for `kind`/`id`, in order.
    pub fn statuses(&self, kind: ResourceKind, id: &str) -> Vec<VolumeStatus> {
        self.reports()
            .into_iter()
            .filter(|(k, i, _)| *k == kind && i == id)
            .map(|(_, _, update)| update.status)
            .collect()
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn report_status(
        &self,
        kind: ResourceKind,
        id: &str,
        update: StatusUpdate,
    ) -> Result<()> {
        self.reports.lock().unwrap().push((kind, id.to_string(), update));
        Ok(())
    }
}

/// Holds callers until opened.
pub struct Gate {
    permits: Semaphore,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self { permits: Semaphore::new(0) })
    }

    pub fn open(&self) {
        self.permits.add_permits(64);
    }

    pub async fn pass(&self) {
        let _permit = self.permits.acquire().await;
    }
}

/// Delegates to another store once its gate opens.
pub struct GatedBackupStore {
    pub gate: Arc<Gate>,
    pub inner: Arc<dyn BackupStore>,
}

#[async_trait]
impl BackupStore for GatedBackupStore {
    async fn save(
        &self,
        volume_id: &str,
        backup_id: &str,
        device: &Path,
        cancel: CancellationToken,
    ) -> Result<u64> {
        self.gate.pass().await;
        self.inner.save(volume_id, backup_id, device, cancel).await
    }

    async fn restore(
        &self,
        source: &str,
        backup_id: &str,
        device: &Path,
        cancel: CancellationToken,
    ) -> Result<u64> {
        self.gate.pass().await;
        self.inner.restore(source, backup_id, device, cancel).await
    }
}

/// Serves images from memory.
#[derive(Default)]
pub struct FakeImageRepository {
    images: Mutex<BTreeMap<String, (ImageInfo, Vec<u8>)>>,
    gate: Option<Arc<Gate>>,
}

impl FakeImageRepository {
    /// Downloads wait for `gate` to open.
    pub fn gated(gate: Arc<Gate>) -> Self {
        Self { gate: Some(gate), ..Self::default() }
    }

    pub fn add(&self, id: &str, disk_format: &str, status: &str, data: Vec<u8>) {
        let info = ImageInfo {
            id: id.to_string(),
            size: data.len() as u64,
            disk_format: disk_format.to_string(),
            status: status.to_string(),
        };
        self.images.lock().unwrap().insert(id.to_string(), (info, data));
    }
}

#[async_trait]
impl ImageRepository for FakeImageRepository {
    async fn describe(&self, image_id: &str) -> Result<ImageInfo> {
        self.images
            .lock()
            .unwrap()
            .get(image_id)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| StorageError::NotFound { kind: "Image", id: image_id.to_string() })
    }

    async fn fetch(&self, image_id: &str, dest: &Path, _cancel: CancellationToken) -> Result<u64> {
        if let Some(gate) = &self.gate {
            gate.pass().await;
        }
        let data = self.images.lock().unwrap().get(image_id).map(|(_, data)| data.clone()).unwrap();
        let out = OpenOptions::new().write(true).open(dest).map_err(|e| StorageError::io(dest, e))?;
        out.write_all_at(&data, 0).map_err(|e| StorageError::io(dest, e))?;
        Ok(data.len() as u64)
    }
}

/// A backup store that is always down.
pub struct FailingBackupStore;

#[async_trait]
impl BackupStore for FailingBackupStore {
    async fn save(&self, _: &str, _: &str, _: &Path, _: CancellationToken) -> Result<u64> {
        Err(StorageError::ServiceUnavailable { reason: "backup store offline".into() })
    }

    async fn restore(&self, _: &str, _: &str, _: &Path, _: CancellationToken) -> Result<u64> {
        Err(StorageError::ServiceUnavailable { reason: "backup store offline".into() })
    }
}

/// "Attaches" a remote volume by handing out a local file.
pub struct FakeTransport {
    pub device: PathBuf,
    pub events: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new(device: PathBuf, size: u64) -> Self {
        std::fs::write(&device, vec![0u8; size as usize]).unwrap();
        Self { device, events: Mutex::new(Vec::new()) }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlockTransport for FakeTransport {
    async fn connect(&self, target: &ExportTarget) -> Result<PathBuf> {
        self.events.lock().unwrap().push(format!("connect {}", target.iqn));
        Ok(self.device.clone())
    }

    async fn disconnect(&self, target: &ExportTarget) -> Result<()> {
        self.events.lock().unwrap().push(format!("disconnect {}", target.iqn));
        Ok(())
    }
}

/// Everything a test needs to drive the engine.
pub struct Harness {
    pub dir: TempDir,
    pub lvm: Arc<FakeLvm>,
    pub reporter: Arc<RecordingReporter>,
    pub manager: VolumeManager,
}

pub fn config(dir: &Path) -> Config {
    Config {
        volume_group: VG.to_string(),
        run_dir: dir.join("run"),
        device_prefix: dir.join("dev"),
        max_concurrent_jobs: 2,
        copy_block_size: 4096,
        scrub: ScrubConfig { direct_io: false, chunk_size: 4096, throttle_bytes_per_sec: None },
        ..Config::default()
    }
}

impl Harness {
    /// Synchronous engine: every operation returns after its job finished.
    pub fn new() -> Self {
        Self::with(true, |builder| builder)
    }

    pub fn with(
        synchronous: bool,
        customize: impl FnOnce(VolumeManagerBuilder) -> VolumeManagerBuilder,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let lvm = Arc::new(FakeLvm::new(&dir.path().join("dev"), 1 << 30));
        let reporter = Arc::new(RecordingReporter::default());
        let builder = VolumeManager::builder(config(dir.path()), lvm.clone())
            .reporter(reporter.clone())
            .synchronous(synchronous);
        let manager = customize(builder).build().unwrap();
        Self { dir, lvm, reporter, manager }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
