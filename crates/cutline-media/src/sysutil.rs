// crates/cutline-media/src/sysutil.rs
//
// Process-wide library lifetime and thread-spawn helpers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use ffmpeg_the_third as ffmpeg;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialise the codec library. Call once per process before constructing
/// any engine component; pair with [`release`] at shutdown. Idempotent.
pub fn initialize() -> crate::Result<()> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    ffmpeg::init().map_err(|e| crate::error::ff("ffmpeg init", e))?;
    log::debug!("[sysutil] codec library initialised");
    Ok(())
}

/// Release process-wide resources. Safe to call more than once.
pub fn release() {
    if INITIALIZED.swap(false, Ordering::SeqCst) {
        log::debug!("[sysutil] codec library released");
    }
}

/// Spawn a named OS thread. Worker names show up in debuggers and sampling
/// profilers, which matters when one composer owns seven of them.
pub fn spawn_named<F>(name: &str, f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .unwrap_or_else(|e| panic!("failed to spawn thread '{name}': {e}"))
}
