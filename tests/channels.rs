// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle and ordering behavior of the asynchronous channels: doorbell
//! delivery, mailbox receive pooling and port-write monitoring, all
//! against the loopback endpoint.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use srio_bridge::{
    DestId, Device, DoorbellChannel, DoorbellConfig, DoorbellEntry, Error, IdMode,
    LoopbackEndpoint, MailboxChannel, MailboxConfig, PortFactory, PortWriteMessage,
    PortWriteMonitor,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn entry(info: u16) -> DoorbellEntry {
    DoorbellEntry { source: 0x11, destination: 0x01, info, misc: 0 }
}

#[test]
fn doorbells_are_delivered_in_arrival_order() {
    let endpoint = LoopbackEndpoint::new();
    // One entry queued before the channel starts; it must come out first.
    endpoint.inject_doorbell(entry(1));

    let (tx, rx) = mpsc::channel();
    let channel = DoorbellChannel::start(
        endpoint.open().unwrap(),
        DoorbellConfig::default(),
        move |e| tx.send(e).unwrap(),
    );

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), entry(1));
    endpoint.inject_doorbell(entry(2));
    endpoint.inject_doorbell(entry(3));
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), entry(2));
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), entry(3));

    channel.stop().unwrap();
    assert!(channel.take_error().is_none());
}

#[test]
fn doorbell_stop_unblocks_a_pending_wait() {
    let endpoint = LoopbackEndpoint::new();
    let channel = DoorbellChannel::start(
        endpoint.open().unwrap(),
        DoorbellConfig::default(),
        |_| {},
    );
    // No traffic: the worker is parked inside the wait.
    channel.stop().unwrap();
    assert!(channel.take_error().is_none());
    assert!(matches!(channel.stop(), Err(Error::InvalidState { .. })));
}

#[test]
fn mailbox_pool_stays_full_while_running() {
    let endpoint = LoopbackEndpoint::new();
    let config = MailboxConfig { rx_buffers: 4, ..MailboxConfig::default() };
    let (tx, rx) = mpsc::channel();
    let channel =
        MailboxChannel::start(&endpoint, 2, config, move |m| tx.send(m).unwrap()).unwrap();
    assert_eq!(endpoint.pending_receives(2), 4);

    for i in 0..3u8 {
        assert!(endpoint.inject_message(2, 0x30 + u16::from(i), &[i; 16]));
    }
    for i in 0..3u8 {
        let msg = rx.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(msg.mailbox, 2);
        assert_eq!(msg.source, 0x30 + u16::from(i));
        assert_eq!(msg.payload, vec![i; 16]);
    }
    // Each drained buffer is reposted before the worker waits again;
    // give the last repost a moment to land.
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    while endpoint.pending_receives(2) != 4 {
        assert!(std::time::Instant::now() < deadline, "pool never refilled");
        std::thread::yield_now();
    }

    channel.stop().unwrap();
    assert!(channel.take_error().is_none());
    // Closing the private handle withdraws its posted buffers.
    assert_eq!(endpoint.pending_receives(2), 0);
}

#[test]
fn mailbox_rejects_out_of_range_inputs() {
    let endpoint = LoopbackEndpoint::new();
    assert!(matches!(
        MailboxChannel::start(&endpoint, 4, MailboxConfig::default(), |_| {}),
        Err(Error::InvalidParameter { .. })
    ));

    let dev = Device::new(endpoint.open().unwrap(), IdMode::Small);
    assert!(dev.message_send(0, DestId(5), &[]).is_err());
    assert!(dev.message_send(0, DestId(5), &[0u8; 4097]).is_err());
    assert!(dev.message_send(4, DestId(5), &[1]).is_err());
}

#[test]
fn message_send_blocks_until_accepted_and_is_observable() {
    let endpoint = LoopbackEndpoint::new();
    let dev = Device::new(endpoint.open().unwrap(), IdMode::Small);
    let sent = dev.message_send(1, DestId(0x42), b"hello fabric").unwrap();
    assert_eq!(sent, 12);
    assert_eq!(
        endpoint.sent_messages(),
        vec![(1, 0x42, b"hello fabric".to_vec())]
    );
}

#[test]
fn local_message_send_loops_back_into_a_posted_buffer() {
    let endpoint = LoopbackEndpoint::new();
    let (tx, rx) = mpsc::channel();
    let channel = MailboxChannel::start(
        &endpoint,
        0,
        MailboxConfig { rx_buffers: 2, ..MailboxConfig::default() },
        move |m| tx.send(m).unwrap(),
    )
    .unwrap();

    let dev = Arc::new(Device::new(endpoint.open().unwrap(), IdMode::Small));
    dev.set_local_host_id(0x05).unwrap();
    dev.message_send(0, DestId(0x05), b"to myself").unwrap();
    let msg = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(msg.source, 0x05);
    assert_eq!(msg.payload, b"to myself");

    channel.stop().unwrap();
}

#[test]
fn port_write_monitor_delivers_and_stops() {
    let endpoint = LoopbackEndpoint::new();
    let dev = Device::new(endpoint.open().unwrap(), IdMode::Small);
    dev.port_write_enable(true).unwrap();
    assert!(endpoint.port_writes_enabled());

    let (tx, rx) = mpsc::channel();
    let monitor = PortWriteMonitor::start(
        endpoint.open().unwrap(),
        Duration::from_secs(1),
        move |m| tx.send(m).unwrap(),
    );

    let msg = PortWriteMessage {
        component_tag: 0x600d,
        port_err_det: 0x8000_0000,
        port_id: 0,
        lt_err_det: 0,
        capture: [1, 2, 3, 4],
    };
    endpoint.inject_port_write(msg);
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), msg);

    monitor.stop().unwrap();
    assert!(monitor.take_error().is_none());
    assert!(matches!(monitor.stop(), Err(Error::InvalidState { .. })));
}

#[test]
fn two_channels_on_one_endpoint_do_not_cross_deliver() {
    let endpoint = LoopbackEndpoint::new();
    let (db_tx, db_rx) = mpsc::channel();
    let doorbells = DoorbellChannel::start(
        endpoint.open().unwrap(),
        DoorbellConfig::default(),
        move |e| db_tx.send(e).unwrap(),
    );
    let (mb_tx, mb_rx) = mpsc::channel();
    let mailbox = MailboxChannel::start(
        &endpoint,
        0,
        MailboxConfig { rx_buffers: 2, ..MailboxConfig::default() },
        move |m| mb_tx.send(m).unwrap(),
    )
    .unwrap();

    endpoint.inject_doorbell(entry(9));
    assert!(endpoint.inject_message(0, 0x77, b"msg"));

    assert_eq!(db_rx.recv_timeout(RECV_TIMEOUT).unwrap(), entry(9));
    let msg = mb_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(msg.source, 0x77);

    mailbox.stop().unwrap();
    doorbells.stop().unwrap();
}
