// SPDX-License-Identifier: MIT
//! Signal-driven lifecycle.
//!
//! A background task translates Unix signals into three flags the
//! supervisor reads at the top of every tick. Keeping the handler down to
//! flag stores means no config mutation ever happens from signal context.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};

#[derive(Debug, Default)]
pub struct Flags {
    shutdown: AtomicBool,
    reload: AtomicBool,
    dump: AtomicBool,
}

impl Flags {
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Consume a pending reload request, if any.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::AcqRel)
    }

    /// Consume a pending config-dump request, if any.
    pub fn take_dump(&self) -> bool {
        self.dump.swap(false, Ordering::AcqRel)
    }
}

/// Install handlers for SIGHUP (reload), SIGUSR1 (dump) and
/// SIGINT/SIGTERM (shutdown), returning the flags the supervisor polls.
pub fn install() -> io::Result<Arc<Flags>> {
    let flags = Arc::new(Flags::default());

    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    let handler = flags.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => handler.reload.store(true, Ordering::Release),
                _ = user1.recv() => handler.dump.store(true, Ordering::Release),
                _ = terminate.recv() => handler.shutdown.store(true, Ordering::Release),
                _ = interrupt.recv() => handler.shutdown.store(true, Ordering::Release),
            }
        }
    });

    Ok(flags)
}
