use crate::context::Context;
use crate::controller::state_dir_name;
use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub(crate) const LOCK_DIR: &str = ".locks";

/// Advisory per-container lock, held for the duration of one change.
///
/// Lock files live under `<state_root>/.locks/` so deleting a container's
/// state directory never releases or removes a lock another driver holds.
pub struct ContainerLock {
    lock_file: File,
}

impl ContainerLock {
    pub fn lock_path(state_root: &Path, id: &str) -> PathBuf {
        state_root.join(LOCK_DIR).join(format!("{id}.lock"))
    }

    fn open(state_root: &Path, id: &str) -> Result<File, CoreError> {
        let lock_path = Self::lock_path(state_root, state_dir_name(id)?);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?)
    }

    /// Block until the container's lock is free.
    pub fn acquire(state_root: &Path, id: &str) -> Result<Self, CoreError> {
        let file = Self::open(state_root, id)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        Ok(Self { lock_file: file })
    }

    /// `Ok(None)` if another driver holds the lock.
    pub fn try_acquire(state_root: &Path, id: &str) -> Result<Option<Self>, CoreError> {
        let file = Self::open(state_root, id)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for ContainerLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Cancel `ctx` on the first Ctrl-C; exit on the second.
pub fn install_signal_handler(ctx: &Context) {
    let ctx = ctx.clone();
    let _ = ctrlc::set_handler(move || {
        if ctx.is_cancelled() {
            std::process::exit(1);
        }
        ctx.cancel();
        eprintln!("\ncancel requested, finishing current step...");
    });
}
