use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{debug, info, warn};

/// PID file lock guaranteeing at most one daemon per workspace endpoint.
///
/// The lock file sits next to the socket (`<socket>.pid`). Acquisition is
/// coordinated through a short-lived `.lock` file so concurrent starters
/// serialize their stale-PID checks.
pub struct PidLock {
    path: PathBuf,
    file: Option<File>,
    locked: bool,
}

impl PidLock {
    pub fn new(socket_path: &str) -> Self {
        Self {
            path: PathBuf::from(format!("{socket_path}.pid")),
            file: None,
            locked: false,
        }
    }

    pub fn try_lock(&mut self) -> Result<()> {
        let lock_path = format!("{}.lock", self.path.display());
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&lock_path)
            .context("failed to open coordination lock file")?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| anyhow!("another process is acquiring the daemon lock"))?;

        let result = self.try_lock_internal();

        let _ = FileExt::unlock(&lock_file);
        let _ = fs::remove_file(&lock_path);

        result
    }

    fn try_lock_internal(&mut self) -> Result<()> {
        let pid = process::id();

        if self.path.exists() {
            match File::open(&self.path) {
                Ok(mut file) => {
                    let mut contents = String::new();
                    file.read_to_string(&mut contents)
                        .context("failed to read PID file")?;

                    let trimmed = contents.trim();
                    if trimmed.is_empty() {
                        warn!("Removing empty PID file: {:?}", self.path);
                        drop(file);
                        fs::remove_file(&self.path).context("failed to remove empty PID file")?;
                    } else {
                        let existing_pid: u32 =
                            trimmed.parse().context("invalid PID in lock file")?;

                        if is_process_running(existing_pid) {
                            if file.try_lock_exclusive().is_err() {
                                return Err(anyhow!(
                                    "another daemon instance is already running (PID: {})",
                                    existing_pid
                                ));
                            }
                            // Lockable despite a live PID: the PID was reused
                            // by an unrelated process, treat the file as stale.
                            let _ = FileExt::unlock(&file);
                        }

                        warn!(
                            "Removing stale PID file for non-running process {}",
                            existing_pid
                        );
                        drop(file);
                        fs::remove_file(&self.path).context("failed to remove stale PID file")?;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context("failed to open existing PID file"),
            }
        }

        // create_new is atomic: exactly one of the racing starters wins.
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                std::thread::sleep(Duration::from_millis(50));
                return self.try_lock_internal();
            }
            Err(e) => return Err(e).context("failed to create PID file"),
        };

        file.try_lock_exclusive()
            .map_err(|_| anyhow!("failed to acquire exclusive lock on PID file"))?;

        let mut file = file;
        write!(file, "{pid}").context("failed to write PID to lock file")?;
        file.flush().context("failed to flush PID file")?;

        self.file = Some(file);
        self.locked = true;
        info!("Acquired PID lock at {:?} (PID: {})", self.path, pid);
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Ok(());
        }

        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
            drop(file);
        }

        if self.path.exists() {
            let mut file = File::open(&self.path)?;
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;

            let pid: u32 = contents.trim().parse().unwrap_or(0);
            if pid == process::id() {
                fs::remove_file(&self.path).context("failed to remove PID file")?;
                debug!("Released PID lock at {:?}", self.path);
            } else {
                warn!("PID file contains different PID ({}), not removing", pid);
            }
        }

        self.locked = false;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = self.unlock() {
                warn!("Failed to unlock PID file on drop: {}", e);
            }
        }
    }
}

/// Signal 0 probes for existence without delivering anything.
pub fn is_process_running(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock").to_str().unwrap().to_string();

        let mut lock1 = PidLock::new(&socket_path);
        assert!(lock1.try_lock().is_ok());

        let mut lock2 = PidLock::new(&socket_path);
        assert!(lock2.try_lock().is_err());

        lock1.unlock().unwrap();
        assert!(lock2.try_lock().is_ok());
    }

    #[test]
    fn stale_pid_is_reclaimed() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock").to_str().unwrap().to_string();
        let pid_path = format!("{socket_path}.pid");

        std::fs::write(&pid_path, "99999999").unwrap();

        let mut lock = PidLock::new(&socket_path);
        assert!(lock.try_lock().is_ok());
        assert_eq!(
            std::fs::read_to_string(&pid_path).unwrap().trim(),
            process::id().to_string()
        );
    }

    #[test]
    fn concurrent_attempts_elect_one_winner() {
        let dir = tempdir().unwrap();
        let socket_path = Arc::new(dir.path().join("test.sock").to_str().unwrap().to_string());
        let barrier = Arc::new(Barrier::new(5));
        let success_count = Arc::new(std::sync::Mutex::new(0));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let socket_path = Arc::clone(&socket_path);
                let barrier = Arc::clone(&barrier);
                let success_count = Arc::clone(&success_count);

                thread::spawn(move || {
                    barrier.wait();

                    let mut lock = PidLock::new(&socket_path);
                    if lock.try_lock().is_ok() {
                        *success_count.lock().unwrap() += 1;
                        thread::sleep(Duration::from_millis(10));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*success_count.lock().unwrap(), 1);
    }
}
