//! Supervisor (spec §4.J): selects a terminal role, takes an exclusive
//! file lock so only one instance per role runs per host, and turns
//! SIGTERM/SIGINT into a cooperative shutdown request for whichever
//! terminal it started.

use crate::config::Terminal;
use crate::error::{PlcError, PlcResult};
use fs2::FileExt;
use log::{error, info};
use std::fs::OpenOptions;
use std::path::PathBuf;

/// Held for the life of the process; dropping it releases the advisory
/// lock (the kernel also releases it automatically if the process dies
/// without a clean shutdown).
pub struct RoleLock {
    file: std::fs::File,
    path: PathBuf,
}

fn lock_path_for(terminal: Terminal) -> PathBuf {
    let n = match terminal {
        Terminal::Logger => 1,
        Terminal::Recipe => 2,
        Terminal::Commands => 3,
    };
    crate::var_dir().join(format!("terminal{n}.lock"))
}

impl RoleLock {
    /// Takes an advisory lock on `/tmp/terminal{N}.lock` (or
    /// `$PLC_VAR_DIR/terminal{N}.lock`). Fails if another process
    /// already holds it.
    pub fn acquire(terminal: Terminal) -> PlcResult<Self> {
        let path = lock_path_for(terminal);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| PlcError::fatal(format!("could not open lock file {path:?}: {e}")))?;

        file.try_lock_exclusive().map_err(|e| {
            PlcError::fatal(format!("terminal {terminal:?} already running on this host ({path:?}): {e}"))
        })?;

        Ok(RoleLock { file, path })
    }
}

impl Drop for RoleLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Runs `body` under the role lock, logging and exiting non-zero on any
/// uncaught error so an external init system restarts the process
/// (spec §4.J: "triggers the terminal's emergency routine if
/// appropriate, and exits with a non-zero code").
pub async fn run_supervised<F, Fut>(terminal: Terminal, body: F) -> !
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = PlcResult<()>>,
{
    let _lock = match RoleLock::acquire(terminal) {
        Ok(l) => l,
        Err(e) => {
            error!("supervisor could not start terminal {terminal:?}: {e}");
            std::process::exit(1);
        }
    };

    info!("terminal {terminal:?} starting under supervisor");
    match body().await {
        Ok(()) => {
            info!("terminal {terminal:?} shut down cleanly");
            std::process::exit(0);
        }
        Err(e) => {
            error!("terminal {terminal:?} exited on unrecoverable fault: {e}");
            std::process::exit(1);
        }
    }
}
