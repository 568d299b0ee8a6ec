// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Asynchronous inbound doorbell channel.
//!
//! One worker thread keeps a wait outstanding against the driver and hands
//! every delivered entry to the consumer callback in arrival order. Stop
//! is cooperative: the stop flag is raised first, then the pending wait is
//! cancelled so the worker observes the abandonment and exits, and the
//! caller blocks on the exit signal with a bounded timeout.
//!
//! The worker loop and stop path are shared with the port-write monitor,
//! which has the same lifecycle over a different wait.
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: tests/channels.rs (ordering, shutdown, double stop)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::port::{DoorbellWait, Port, PortError};
use crate::wire::DoorbellEntry;
use crate::{Error, Result};

/// Tuning for a [`DoorbellChannel`].
#[derive(Clone, Copy, Debug)]
pub struct DoorbellConfig {
    /// Hardware doorbell queue to drain.
    pub queue: u32,
    /// How long [`DoorbellChannel::stop`] waits for the worker to exit.
    pub stop_timeout: Duration,
}

impl Default for DoorbellConfig {
    fn default() -> Self {
        Self { queue: 0, stop_timeout: Duration::from_secs(1) }
    }
}

/// State shared between a channel front and its worker thread.
pub(crate) struct ChannelShared {
    stop: AtomicBool,
    error: Mutex<Option<Error>>,
    stopped: Mutex<bool>,
}

impl ChannelShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            stop: AtomicBool::new(false),
            error: Mutex::new(None),
            stopped: Mutex::new(false),
        })
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn take_error(&self) -> Option<Error> {
        self.error.lock().take()
    }

    pub(crate) fn record_error(&self, err: Error) {
        *self.error.lock() = Some(err);
    }
}

/// Worker loop shared by the doorbell and port-write channels: `wait`
/// blocks for the next batch, `consumer` gets each item in order. Exits
/// on stop, abandonment or a driver error.
pub(crate) fn run_worker<T, F, W>(channel: &'static str, shared: &ChannelShared, mut consumer: F, mut wait: W)
where
    F: FnMut(T),
    W: FnMut() -> std::result::Result<Vec<T>, PortError>,
{
    loop {
        if shared.stop_requested() {
            break;
        }
        match wait() {
            Ok(items) => {
                for item in items {
                    consumer(item);
                }
            }
            Err(PortError::Abandoned) | Err(PortError::Closed) => {
                // Cancellation during stop is the normal exit; anything
                // else is the handle dying underneath us.
                if !shared.stop_requested() {
                    log::warn!("{channel}: wait abandoned outside shutdown");
                    shared.record_error(Error::Abandoned);
                }
                break;
            }
            Err(PortError::Device(code)) => {
                log::warn!("{channel}: wait failed with driver status {code:#x}");
                shared.record_error(Error::from_port(channel, PortError::Device(code)));
                break;
            }
        }
    }
    log::debug!("{channel}: worker exited");
}

/// Stop path shared by every channel: flips the channel to stopped, runs
/// `cancel` to unblock the outstanding wait and blocks for the worker's
/// exit signal. The worker signals exit by dropping its end of `exit_rx`.
pub(crate) fn stop_channel(
    channel: &'static str,
    shared: &ChannelShared,
    cancel: impl FnOnce(),
    exit_rx: &Receiver<()>,
    timeout: Duration,
) -> Result<()> {
    {
        let mut stopped = shared.stopped.lock();
        if *stopped {
            return Err(Error::invalid_state(format!("{channel} channel already stopped")));
        }
        *stopped = true;
    }
    shared.stop.store(true, Ordering::Release);
    cancel();
    match exit_rx.recv_timeout(timeout) {
        // Nothing ever sends on this channel; Disconnected means the
        // worker dropped its sender and is gone.
        Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
        Err(RecvTimeoutError::Timeout) => Err(Error::ShutdownTimeout { channel, timeout }),
    }
}

/// Sender half the worker holds for its lifetime; see [`stop_channel`].
pub(crate) type ExitSignal = Sender<()>;

/// Running doorbell delivery channel; entries flow to the consumer
/// callback until [`DoorbellChannel::stop`].
pub struct DoorbellChannel {
    port: Arc<dyn Port>,
    shared: Arc<ChannelShared>,
    exit_rx: Receiver<()>,
    config: DoorbellConfig,
}

impl DoorbellChannel {
    /// Spawns the worker and begins delivering entries from
    /// `config.queue` to `consumer`.
    pub fn start<F>(port: Arc<dyn Port>, config: DoorbellConfig, consumer: F) -> Self
    where
        F: FnMut(DoorbellEntry) + Send + 'static,
    {
        let shared = ChannelShared::new();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        {
            let port = Arc::clone(&port);
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let _exit: ExitSignal = exit_tx;
                run_worker("doorbell", &shared, consumer, || {
                    match port.doorbell_wait(config.queue)? {
                        DoorbellWait::Ready(entries) => Ok(entries),
                        DoorbellWait::Pending(ticket) => ticket.wait(),
                    }
                });
            });
        }
        Self { port, shared, exit_rx, config }
    }

    /// Stops the worker and blocks until it has exited.
    ///
    /// Fails with [`Error::InvalidState`] when already stopped and with
    /// [`Error::ShutdownTimeout`] when the worker does not exit in time.
    pub fn stop(&self) -> Result<()> {
        stop_channel(
            "doorbell",
            &self.shared,
            || self.port.cancel_pending(),
            &self.exit_rx,
            self.config.stop_timeout,
        )
    }

    /// The error that terminated the worker, if it died on its own.
    pub fn take_error(&self) -> Option<Error> {
        self.shared.take_error()
    }
}
