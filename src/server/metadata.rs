use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

/// Timestamp format used for the `start_at`/`succeed_at`/`failed_at` files.
fn now_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Per-run on-disk record: a metadata directory holding `script`, `env`,
/// `log`, `start_at`, `succeed_at`, `failed_at`, `status` and `error`
/// files, plus the working directory the child runs in.
///
/// `status` is written exactly once per run, either `"success"` or
/// `"failure"`.
pub struct RunMetadata {
    pub work_dir: PathBuf,
    dir: PathBuf,
    log: Mutex<LazyAppendFile>,
}

impl RunMetadata {
    /// Create the metadata and work directories for a run. `workdir_base`
    /// overrides the server's workdir base when non-empty.
    pub fn prepare(
        metadata_base: &str,
        workdir_base: &str,
        request_workdir_base: &str,
        id: &str,
    ) -> io::Result<Self> {
        let dir = Path::new(metadata_base).join(id);
        let work_base = if request_workdir_base.is_empty() {
            workdir_base
        } else {
            request_workdir_base
        };
        let work_dir = Path::new(work_base).join(id);

        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&work_dir)?;

        let log_path = dir.join("log");
        Ok(Self {
            work_dir,
            dir,
            log: Mutex::new(LazyAppendFile::new(log_path)),
        })
    }

    /// Append a chunk of child output to the `log` file. Errors are
    /// swallowed after a warning: losing log bytes must not fail the run.
    pub fn append_log(&self, chunk: &[u8]) {
        let mut log = self.log.lock().expect("log writer poisoned");
        if let Err(err) = log.append(chunk) {
            warn!("failed to append run log: {err}");
        }
    }

    pub fn record_start(&self, script: &str, env_lines: &str) {
        self.write_string("script", script);
        self.write_string("env", env_lines);
        self.write_string("start_at", &now_stamp());
    }

    pub fn record_success(&self) {
        self.write_string("succeed_at", &now_stamp());
        self.write_string("status", "success");
    }

    pub fn record_failure(&self, error: &str) {
        self.write_string("failed_at", &now_stamp());
        self.write_string("error", error);
        self.write_string("status", "failure");
    }

    /// Remove the run's working directory (auto-clean).
    pub fn clean_work_dir(&self) {
        if self.work_dir.exists() {
            if let Err(err) = fs::remove_dir_all(&self.work_dir) {
                warn!("failed to clean work dir {}: {err}", self.work_dir.display());
            }
        }
    }

    /// One-shot truncating write of a whole metadata file.
    fn write_string(&self, name: &str, content: &str) {
        let path = self.dir.join(name);
        if let Err(err) = fs::write(&path, content) {
            warn!("failed to write {}: {err}", path.display());
        }
    }

    #[cfg(test)]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Append-mode file handle opened on first write, mode 0644.
struct LazyAppendFile {
    path: PathBuf,
    file: Option<File>,
}

impl LazyAppendFile {
    fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.file.is_none() {
            let mut options = OpenOptions::new();
            options.create(true).append(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o644);
            }
            self.file = Some(options.open(&self.path)?);
        }
        self.file
            .as_mut()
            .expect("file opened above")
            .write_all(chunk)
    }
}
