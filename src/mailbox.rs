// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mailbox messaging: blocking sends on the device handle and an
//! asynchronous receive channel per mailbox.
//!
//! The receive channel opens a private driver handle so its completion
//! queue is not shared with anything else, posts a fixed pool of
//! page-aligned buffers, and reposts each buffer immediately after its
//! message is delivered; the pool size is therefore invariant over the
//! channel's lifetime. Stop works by closing the private handle, which
//! fails the blocked completion wait deterministically.
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: tests/channels.rs (delivery, pool invariant, shutdown)

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::control::DestId;
use crate::device::Device;
use crate::doorbell::{stop_channel, ChannelShared, ExitSignal};
use crate::port::{Port, PortError, PortFactory, RxLease};
use crate::wire::{Op, MAILBOX_COUNT, MAX_MESSAGE_SIZE, PAGE_SIZE};
use crate::{Error, Result};

/// Tuning for a [`MailboxChannel`].
#[derive(Clone, Copy, Debug)]
pub struct MailboxConfig {
    /// Number of receive buffers kept posted.
    pub rx_buffers: usize,
    /// How long [`MailboxChannel::stop`] waits for the worker to exit.
    pub stop_timeout: Duration,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self { rx_buffers: 32, stop_timeout: Duration::from_secs(1) }
    }
}

/// One received mailbox message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxMessage {
    /// Mailbox the message arrived on.
    pub mailbox: u8,
    /// Destination id of the sending endpoint.
    pub source: u16,
    /// Message payload, at most one page.
    pub payload: Vec<u8>,
}

fn check_mailbox(mbox: u8) -> Result<()> {
    if mbox >= MAILBOX_COUNT {
        return Err(Error::invalid_parameter(format!(
            "mailbox {mbox} out of range 0..{MAILBOX_COUNT}"
        )));
    }
    Ok(())
}

fn check_payload(len: usize) -> Result<()> {
    if len == 0 {
        return Err(Error::invalid_parameter("empty message payload"));
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::invalid_parameter(format!(
            "message payload of {len} bytes exceeds {MAX_MESSAGE_SIZE}"
        )));
    }
    Ok(())
}

impl Device {
    /// Sends `payload` to mailbox `mbox` on endpoint `dest`, blocking
    /// until the driver reports the send complete.
    ///
    /// Returns the number of bytes accepted.
    pub fn message_send(&self, mbox: u8, dest: DestId, payload: &[u8]) -> Result<usize> {
        check_mailbox(mbox)?;
        check_payload(payload.len())?;
        let ticket = self
            .port()
            .send_message(mbox, dest.0, payload)
            .map_err(|e| Error::from_port(Op::MsgSend.name(), e))?;
        ticket.wait().map_err(|e| Error::from_port(Op::MsgSend.name(), e))
    }
}

/// Running receive channel for one mailbox; messages flow to the consumer
/// callback until [`MailboxChannel::stop`].
pub struct MailboxChannel {
    port: Arc<dyn Port>,
    shared: Arc<ChannelShared>,
    exit_rx: Receiver<()>,
    config: MailboxConfig,
    mailbox: u8,
}

impl MailboxChannel {
    /// Opens a private handle through `factory`, posts the receive pool
    /// for `mailbox` and spawns the delivery worker.
    pub fn start<F>(
        factory: &dyn PortFactory,
        mailbox: u8,
        config: MailboxConfig,
        consumer: F,
    ) -> Result<Self>
    where
        F: FnMut(MailboxMessage) + Send + 'static,
    {
        check_mailbox(mailbox)?;
        if config.rx_buffers == 0 {
            return Err(Error::invalid_parameter("mailbox channel needs at least one buffer"));
        }
        let port = factory.open().map_err(|e| Error::from_port("open", e))?;
        let pool: Vec<RxLease> = (0..config.rx_buffers)
            .map(|slot| RxLease::new(slot, PAGE_SIZE))
            .collect();
        for lease in &pool {
            port.post_receive(mailbox, lease.clone())
                .map_err(|e| Error::from_port(Op::MsgAddRxBuf.name(), e))?;
        }
        let shared = ChannelShared::new();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        {
            let port = Arc::clone(&port);
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let _exit: ExitSignal = exit_tx;
                run_rx_worker(&port, mailbox, pool, &shared, consumer);
            });
        }
        Ok(Self { port, shared, exit_rx, config, mailbox })
    }

    /// Mailbox this channel drains.
    pub const fn mailbox(&self) -> u8 {
        self.mailbox
    }

    /// Stops the worker by closing the private handle and blocks until it
    /// has exited.
    pub fn stop(&self) -> Result<()> {
        stop_channel(
            "mailbox",
            &self.shared,
            || self.port.close(),
            &self.exit_rx,
            self.config.stop_timeout,
        )
    }

    /// The error that terminated the worker, if it died on its own.
    pub fn take_error(&self) -> Option<Error> {
        self.shared.take_error()
    }
}

fn run_rx_worker<F>(
    port: &Arc<dyn Port>,
    mailbox: u8,
    pool: Vec<RxLease>,
    shared: &ChannelShared,
    mut consumer: F,
) where
    F: FnMut(MailboxMessage),
{
    loop {
        let completion = match port.next_completion() {
            Ok(c) => c,
            Err(PortError::Abandoned) | Err(PortError::Closed) => {
                if !shared.stop_requested() {
                    log::warn!("mailbox {mailbox}: completion queue closed outside shutdown");
                    shared.record_error(Error::Abandoned);
                }
                break;
            }
            Err(err @ PortError::Device(_)) => {
                log::warn!("mailbox {mailbox}: completion wait failed: {err}");
                shared.record_error(Error::from_port(Op::MsgAddRxBuf.name(), err));
                break;
            }
        };
        let Some(lease) = pool.get(completion.slot) else {
            log::warn!("mailbox {mailbox}: completion names unknown slot {}", completion.slot);
            continue;
        };
        consumer(MailboxMessage {
            mailbox,
            source: completion.source,
            payload: lease.snapshot(completion.len),
        });
        // Repost the drained buffer before waiting again so the pool
        // never shrinks while the channel runs.
        if let Err(err) = port.post_receive(mailbox, lease.clone()) {
            if !shared.stop_requested() {
                log::warn!("mailbox {mailbox}: repost failed: {err}");
                shared.record_error(Error::from_port(Op::MsgAddRxBuf.name(), err));
            }
            break;
        }
    }
    log::debug!("mailbox {mailbox}: worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_bounds_are_enforced() {
        assert!(check_payload(1).is_ok());
        assert!(check_payload(MAX_MESSAGE_SIZE).is_ok());
        assert!(check_payload(0).is_err());
        assert!(check_payload(MAX_MESSAGE_SIZE + 1).is_err());
    }

    #[test]
    fn mailbox_range_is_enforced() {
        assert!(check_mailbox(0).is_ok());
        assert!(check_mailbox(3).is_ok());
        assert!(check_mailbox(4).is_err());
    }
}
