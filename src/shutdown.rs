//! Cooperative shutdown signal for background loops.
//!
//! A [`ShutdownTrigger`] fans out to any number of [`Shutdown`] handles.
//! Loops race [`Shutdown::cancelled`] against their timers and I/O with
//! `tokio::select!`, so cancellation is observed at every await point.

use tokio::sync::watch;

/// The sending side; dropping it also counts as shutdown.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// A cloneable handle that resolves once shutdown is requested.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested or the trigger is dropped.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
