//! Termination signals caught for the whole launcher lifetime.
//!
//! While the app runs, a caught signal is forwarded to it as SIGTERM. Before
//! that it is only recorded, and the session aborts at its next checkpoint.

use std::{
    sync::{atomic::{AtomicI32, Ordering::SeqCst}, Arc},
    thread::{self, JoinHandle},
};

use nix::{sys::signal::{kill, Signal}, unistd::Pid};
use signal_hook::{consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM}, iterator::{Handle, Signals}};
use tracing::debug;

use crate::Result;


pub const TERM_SIGNALS: [i32; 4] = [SIGINT, SIGTERM, SIGQUIT, SIGHUP];

#[derive(Debug, Default)]
pub struct SignalState {
    child: AtomicI32,
    received: AtomicI32,
}

impl SignalState {
    /// The last signal caught while no child was running.
    pub fn received(&self) -> Option<i32> {
        match self.received.load(SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }

    pub(crate) fn forward_to(&self, pid: u32) {
        self.child.store(pid as i32, SeqCst)
    }

    pub(crate) fn stop_forwarding(&self) {
        self.child.store(0, SeqCst)
    }

    fn deliver(&self, signal: i32) {
        match self.child.load(SeqCst) {
            0 => {
                debug!("Caught signal {signal} before the app started");
                self.received.store(signal, SeqCst)
            }
            pid => {
                debug!("Forwarding signal {signal} to {pid}");
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
        }
    }
}

/// Handler registration plus the thread that drains it. Dropping it stops
/// the thread.
pub struct Interrupts {
    state: Arc<SignalState>,
    handle: Handle,
    forwarder: Option<JoinHandle<()>>,
}

impl Interrupts {
    pub fn install() -> Result<Self> {
        let mut signals = Signals::new(TERM_SIGNALS)?;
        let handle = signals.handle();
        let state = Arc::new(SignalState::default());
        let shared = state.clone();
        let forwarder = thread::spawn(move || {
            for signal in signals.forever() {
                shared.deliver(signal)
            }
        });
        Ok(Interrupts { state, handle, forwarder: Some(forwarder) })
    }

    pub fn state(&self) -> Arc<SignalState> {
        self.state.clone()
    }

    pub fn received(&self) -> Option<i32> {
        self.state.received()
    }
}

impl Drop for Interrupts {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.join();
        }
    }
}
