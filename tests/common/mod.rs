use avfs::backends::LocalVfs;
use avfs::vfs::{VfsExt, VfsFile};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A temporary directory exposed through a fresh `LocalVfs`
#[allow(dead_code)]
pub struct LocalFixture {
    pub dir: TempDir,
    pub vfs: Arc<LocalVfs>,
    pub root: VfsFile,
}

#[allow(dead_code)]
impl LocalFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let vfs = LocalVfs::new(dir.path());
        let root = vfs.root();
        Self { dir, vfs, root }
    }

    /// Native path of a file under the fixture directory
    pub fn native(&self, relative: &str) -> std::path::PathBuf {
        self.dir.path().join(relative)
    }

    pub fn write(&self, relative: &str, content: &[u8]) {
        let path = self.native(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        std::fs::write(path, content).expect("Failed to write fixture file");
    }

    pub fn read(&self, relative: &str) -> Vec<u8> {
        std::fs::read(self.native(relative)).expect("Failed to read fixture file")
    }
}

/// Recursively list every regular file under `dir`, relative and sorted
#[allow(dead_code)]
pub fn snapshot(dir: &Path) -> Vec<(String, Vec<u8>)> {
    fn walk(base: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) {
        for entry in std::fs::read_dir(dir).expect("Failed to read dir") {
            let path = entry.expect("Failed to read entry").path();
            if path.is_dir() {
                walk(base, &path, out);
            } else {
                let relative = path
                    .strip_prefix(base)
                    .expect("Entry outside base")
                    .to_string_lossy()
                    .into_owned();
                out.push((relative, std::fs::read(&path).expect("Failed to read file")));
            }
        }
    }
    let mut out = Vec::new();
    walk(dir, dir, &mut out);
    out.sort();
    out
}

/// Events collected from a watch handler
#[allow(dead_code)]
pub type Recorded<T> = Arc<Mutex<Vec<T>>>;

/// Await `condition` by polling, giving up after `timeout`
#[allow(dead_code)]
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        compio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[allow(dead_code)]
pub struct TestTimeoutGuard {
    cancelled: Arc<AtomicBool>,
}

impl Drop for TestTimeoutGuard {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[allow(dead_code)]
pub fn test_timeout_guard(duration: Duration) -> TestTimeoutGuard {
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancelled_clone = Arc::clone(&cancelled);
    std::thread::spawn(move || {
        std::thread::sleep(duration);
        if !cancelled_clone.load(Ordering::SeqCst) {
            eprintln!("Test timeout exceeded ({}s). Aborting.", duration.as_secs());
            std::process::abort();
        }
    });
    TestTimeoutGuard { cancelled }
}
