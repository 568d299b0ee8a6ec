// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Port-write event monitor.
//!
//! Same worker lifecycle as the doorbell channel over the port-write wait:
//! one message per completion instead of a batch. Delivery must be enabled
//! on the device first ([`crate::Device::port_write_enable`]).
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: tests/channels.rs

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::doorbell::{run_worker, stop_channel, ChannelShared, ExitSignal};
use crate::port::{Port, PortWriteWait};
use crate::wire::PortWriteMessage;
use crate::{Error, Result};

/// Running port-write monitor; messages flow to the consumer callback
/// until [`PortWriteMonitor::stop`].
pub struct PortWriteMonitor {
    port: Arc<dyn Port>,
    shared: Arc<ChannelShared>,
    exit_rx: Receiver<()>,
    stop_timeout: Duration,
}

impl PortWriteMonitor {
    /// Spawns the worker and begins delivering port-write messages to
    /// `consumer`.
    pub fn start<F>(port: Arc<dyn Port>, stop_timeout: Duration, consumer: F) -> Self
    where
        F: FnMut(PortWriteMessage) + Send + 'static,
    {
        let shared = ChannelShared::new();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        {
            let port = Arc::clone(&port);
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let _exit: ExitSignal = exit_tx;
                run_worker("port-write", &shared, consumer, || {
                    let msg = match port.port_write_wait()? {
                        PortWriteWait::Ready(msg) => msg,
                        PortWriteWait::Pending(ticket) => ticket.wait()?,
                    };
                    Ok(vec![msg])
                });
            });
        }
        Self { port, shared, exit_rx, stop_timeout }
    }

    /// Stops the worker and blocks until it has exited.
    pub fn stop(&self) -> Result<()> {
        stop_channel(
            "port-write",
            &self.shared,
            || self.port.cancel_pending(),
            &self.exit_rx,
            self.stop_timeout,
        )
    }

    /// The error that terminated the worker, if it died on its own.
    pub fn take_error(&self) -> Option<Error> {
        self.shared.take_error()
    }
}
