// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-visible behavior of the synchronous surface against the loopback
//! endpoint: DMA block transfers, memory windows, maintenance access and
//! the small device-level operations.

use std::sync::Arc;

use srio_bridge::device::csr;
use srio_bridge::window::MAX_WINDOW_SIZE;
use srio_bridge::{
    DestId, Device, DmaControl, Error, FabricAddress, IdMode, LoopbackEndpoint, PortFactory,
    Rtype, WindowConfig, WindowManager,
};

fn device(endpoint: &LoopbackEndpoint) -> Arc<Device> {
    Arc::new(Device::new(endpoint.open().unwrap(), IdMode::Small))
}

#[test]
fn dma_write_then_read_roundtrips_through_remote_memory() {
    let endpoint = LoopbackEndpoint::new();
    let dev = device(&endpoint);
    // A base above 4 GiB exercises both halves of the fabric address.
    endpoint.install_remote_window(9, 0x2_0000_1000, 0x4000);

    let addr = FabricAddress::new(0x2_0000_1800, 0).unwrap();
    let payload: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
    let written = dev
        .dma_write(DestId(9), addr, DmaControl::new(Rtype::AllNwrite), &payload)
        .unwrap();
    assert_eq!(written, payload.len());
    assert_eq!(
        endpoint.remote_snapshot(9, 0x2_0000_1800, payload.len()).unwrap(),
        payload
    );

    let mut back = vec![0u8; payload.len()];
    let read = dev
        .dma_read(DestId(9), addr, DmaControl::new(Rtype::Nread), &mut back)
        .unwrap();
    assert_eq!(read, payload.len());
    assert_eq!(back, payload);
}

#[test]
fn dma_to_uninstalled_endpoint_surfaces_driver_status() {
    let endpoint = LoopbackEndpoint::new();
    let dev = device(&endpoint);
    let addr = FabricAddress::new(0, 0).unwrap();
    let err = dev
        .dma_write(DestId(3), addr, DmaControl::new(Rtype::AllNwrite), &[1, 2, 3])
        .unwrap_err();
    assert!(matches!(err, Error::Device { op: "SRIO_WRITE", .. }));
}

#[test]
fn link_status_gates_on_error_stopped_port() {
    let endpoint = LoopbackEndpoint::new();
    let dev = device(&endpoint);
    dev.ensure_link_ok().unwrap();

    endpoint.set_link_status(0x0001_0002);
    let status = dev.link_status().unwrap();
    assert!(status.is_error_stopped());
    assert!(matches!(
        dev.ensure_link_ok(),
        Err(Error::LinkDown { status: 0x0001_0002 })
    ));
}

#[test]
fn inbound_window_lifecycle_and_data_access() {
    let endpoint = LoopbackEndpoint::new();
    let dev = device(&endpoint);
    let mgr = WindowManager::new(dev);

    let config = WindowConfig {
        base: FabricAddress::new(2 << 20, 0).unwrap(),
        size: 2 << 20,
    };
    mgr.configure_inbound(0, config).unwrap();
    assert_eq!(mgr.inbound_window(0), Some(config));

    mgr.inbound_write(0, 0x40, b"window payload").unwrap();
    let mut back = [0u8; 14];
    mgr.inbound_read(0, 0x40, &mut back).unwrap();
    assert_eq!(&back, b"window payload");

    mgr.free_inbound(0).unwrap();
    assert_eq!(mgr.inbound_window(0), None);
    // freed slot no longer accepts accesses
    assert!(matches!(
        mgr.inbound_read(0, 0, &mut back),
        Err(Error::InvalidState { .. })
    ));
}

#[test]
fn window_bind_carries_the_base_low_word_first() {
    let endpoint = LoopbackEndpoint::new();
    let mgr = WindowManager::new(device(&endpoint));
    // Base with distinct high and low words; a swapped pair would decode
    // to 0x1000_0000_0002.
    let config = WindowConfig {
        base: FabricAddress::new(0x2_0000_1000, 0).unwrap(),
        size: 4096,
    };
    mgr.configure_inbound(1, config).unwrap();
    assert_eq!(endpoint.inbound_window_base(1), Some(0x2_0000_1000));
    mgr.configure_outbound(1, config).unwrap();
    assert_eq!(endpoint.outbound_window_base(1), Some(0x2_0000_1000));
}

#[test]
fn outbound_window_accepts_every_power_of_two_size() {
    let endpoint = LoopbackEndpoint::new();
    let mgr = WindowManager::new(device(&endpoint));
    for k in 12..=34u32 {
        let size = 1u64 << k;
        let config = WindowConfig {
            base: FabricAddress::new(size, 0).unwrap(),
            size,
        };
        mgr.configure_outbound(3, config).unwrap();
        assert_eq!(mgr.outbound_window(3), Some(config));
        mgr.free_outbound(3).unwrap();
    }
    assert_eq!(1u64 << 34, MAX_WINDOW_SIZE);
}

#[test]
fn maintenance_access_reaches_remote_config_space() {
    let endpoint = LoopbackEndpoint::new();
    let dev = device(&endpoint);
    dev.maintenance_write(DestId(4), 0xff, csr::RIO_COMPONENT_TAG_CSR, 0xfeed)
        .unwrap();
    let words = dev
        .maintenance_read(DestId(4), 0xff, csr::RIO_COMPONENT_TAG_CSR, 1)
        .unwrap();
    assert_eq!(words, vec![0xfeed]);
    // a different hop count is a different endpoint
    let other = dev
        .maintenance_read(DestId(4), 0, csr::RIO_COMPONENT_TAG_CSR, 1)
        .unwrap();
    assert_eq!(other, vec![0]);
}

#[test]
fn host_id_is_masked_to_the_addressing_mode() {
    let endpoint = LoopbackEndpoint::new();
    let dev = device(&endpoint);
    // Small system: only the low 8 bits survive.
    assert_eq!(dev.set_local_host_id(0x1_0144).unwrap(), DestId(0x44));
    assert_eq!(dev.local_host_id().unwrap(), DestId(0x44));

    let large = Arc::new(Device::new(endpoint.open().unwrap(), IdMode::Large));
    assert_eq!(large.set_ib_msg_dev_id(0x2_3456).unwrap(), DestId(0x3456));
    assert_eq!(large.ib_msg_dev_id().unwrap(), DestId(0x3456));
}

#[test]
fn synchronous_doorbell_operations_drain_in_fifo_order() {
    let endpoint = LoopbackEndpoint::new();
    let dev = device(&endpoint);

    dev.doorbell_send(DestId(0x21), 0x0101, true).unwrap();
    assert_eq!(endpoint.sent_doorbells(), vec![(0x21, 0x0101, true)]);

    for info in [1u16, 2, 3] {
        endpoint.inject_doorbell(srio_bridge::DoorbellEntry {
            source: 0x10,
            destination: 0x01,
            info,
            misc: 0,
        });
    }
    assert_eq!(dev.doorbell_check(0).unwrap(), 3);
    let first = dev.doorbell_get(0, 2).unwrap();
    assert_eq!(first.iter().map(|e| e.info).collect::<Vec<_>>(), vec![1, 2]);
    let rest = dev.doorbell_get(0, 8).unwrap();
    assert_eq!(rest.iter().map(|e| e.info).collect::<Vec<_>>(), vec![3]);
    assert_eq!(dev.doorbell_check(0).unwrap(), 0);
}

#[test]
fn config_space_words_read_back() {
    let endpoint = LoopbackEndpoint::new();
    let dev = device(&endpoint);
    dev.write_config_space(0x40, 0xcafe_f00d).unwrap();
    assert_eq!(dev.read_config_space(0x40).unwrap(), 0xcafe_f00d);
    assert_eq!(dev.read_config_space(0x44).unwrap(), 0);
}
