//! Ethernet frame layer.
//!
//! Demultiplexes incoming frames to EtherType-keyed handlers and
//! assembles outgoing frames. A handler returning `true` asks for the
//! frame to be sent back: the MAC addresses are swapped in place here and
//! the NIC driver retransmits the same buffer.

use super::device::{NicDevice, RawDataHandler};
use super::{MacAddress, NetworkError, Result};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// 6 bytes destination, 6 bytes source, 2 bytes EtherType.
const HEADER_SIZE: usize = 14;

/// Handler for one EtherType.
///
/// `payload` is the frame body after the Ethernet header; returning
/// `true` requests the reply path described in the module docs.
pub trait EtherFrameHandler: Send + Sync {
    fn on_ether_frame(&self, payload: &mut [u8]) -> bool;
}

pub struct EtherFrameProvider {
    nic: Arc<dyn NicDevice>,
    handlers: Mutex<BTreeMap<u16, Weak<dyn EtherFrameHandler>>>,
}

impl EtherFrameProvider {
    /// Create the provider and install it as the NIC's raw-data handler.
    pub fn attach(nic: Arc<dyn NicDevice>) -> Arc<EtherFrameProvider> {
        let provider = Arc::new(EtherFrameProvider {
            nic,
            handlers: Mutex::new(BTreeMap::new()),
        });
        let raw: Arc<dyn RawDataHandler> = provider.clone();
        provider.nic.set_raw_data_handler(&raw);
        provider
    }

    /// Route frames with `ether_type` (host order) to `handler`.
    pub fn register_handler(&self, ether_type: u16, handler: &Arc<dyn EtherFrameHandler>) {
        crate::arch::x86::without_interrupts(|| {
            self.handlers
                .lock()
                .insert(ether_type, Arc::downgrade(handler));
        });
    }

    /// Assemble and transmit one frame with our MAC as source.
    pub fn send(&self, dst_mac: MacAddress, ether_type: u16, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::new();
        frame
            .try_reserve_exact(HEADER_SIZE + payload.len())
            .map_err(|_| NetworkError::OutOfMemory)?;

        frame.extend_from_slice(dst_mac.bytes());
        frame.extend_from_slice(self.nic.mac_address().bytes());
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(payload);

        self.nic.send(&frame);
        Ok(())
    }

    pub fn mac_address(&self) -> MacAddress {
        self.nic.mac_address()
    }

    pub fn ip_address(&self) -> super::Ipv4Address {
        self.nic.ip_address()
    }
}

impl RawDataHandler for EtherFrameProvider {
    fn on_raw_data(&self, buffer: &mut [u8]) -> bool {
        if buffer.len() < HEADER_SIZE {
            return false;
        }

        let dst_mac = MacAddress::new(buffer[0..6].try_into().unwrap());
        let our_mac = self.nic.mac_address();

        let mut send_back = false;
        if dst_mac.is_broadcast() || dst_mac == our_mac {
            let ether_type = u16::from_be_bytes([buffer[12], buffer[13]]);
            let handler = self
                .handlers
                .lock()
                .get(&ether_type)
                .and_then(Weak::upgrade);
            if let Some(handler) = handler {
                send_back = handler.on_ether_frame(&mut buffer[HEADER_SIZE..]);
            }
        }

        if send_back {
            let src_mac: [u8; 6] = buffer[6..12].try_into().unwrap();
            buffer[0..6].copy_from_slice(&src_mac);
            buffer[6..12].copy_from_slice(self.nic.mac_address().bytes());
        }

        send_back
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::{MockNic, RecordingHandler};

    fn frame(dst: [u8; 6], src: [u8; 6], ether_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test_case]
    fn foreign_destination_is_never_delivered() {
        let nic = MockNic::new();
        let eth = EtherFrameProvider::attach(nic.clone());
        let recorder = Arc::new(RecordingHandler::new(false));
        let handler: Arc<dyn EtherFrameHandler> = recorder.clone();
        eth.register_handler(0x0800, &handler);

        let mut buffer = frame([0xAA; 6], [0xBB; 6], 0x0800, b"data");
        assert!(!eth.on_raw_data(&mut buffer));
        assert_eq!(recorder.call_count(), 0);
    }

    #[test_case]
    fn broadcast_and_unicast_are_delivered() {
        let nic = MockNic::new();
        let eth = EtherFrameProvider::attach(nic.clone());
        let recorder = Arc::new(RecordingHandler::new(false));
        let handler: Arc<dyn EtherFrameHandler> = recorder.clone();
        eth.register_handler(0x0800, &handler);

        let mut broadcast = frame([0xFF; 6], [0xBB; 6], 0x0800, b"one");
        let mut unicast = frame(*nic.mac_address().bytes(), [0xBB; 6], 0x0800, b"two");
        eth.on_raw_data(&mut broadcast);
        eth.on_raw_data(&mut unicast);
        assert_eq!(recorder.call_count(), 2);
        assert_eq!(recorder.last_payload(), b"two");
    }

    #[test_case]
    fn reply_swaps_mac_addresses_in_place() {
        let nic = MockNic::new();
        let eth = EtherFrameProvider::attach(nic.clone());
        let recorder = Arc::new(RecordingHandler::new(true));
        let handler: Arc<dyn EtherFrameHandler> = recorder.clone();
        eth.register_handler(0x0806, &handler);

        let peer = [0x52, 0x54, 0x00, 0x12, 0x35, 0x02];
        let mut buffer = frame(*nic.mac_address().bytes(), peer, 0x0806, b"msg");
        assert!(eth.on_raw_data(&mut buffer));
        assert_eq!(&buffer[0..6], &peer);
        assert_eq!(&buffer[6..12], nic.mac_address().bytes());
    }

    #[test_case]
    fn send_prepends_header_with_our_source_mac() {
        let nic = MockNic::new();
        let eth = EtherFrameProvider::attach(nic.clone());

        let dst = MacAddress::new([0x52, 0x54, 0x00, 0x12, 0x35, 0x02]);
        eth.send(dst, 0x0800, b"payload").unwrap();

        let sent = nic.last_sent().unwrap();
        assert_eq!(&sent[0..6], dst.bytes());
        assert_eq!(&sent[6..12], nic.mac_address().bytes());
        assert_eq!(&sent[12..14], &0x0800u16.to_be_bytes());
        assert_eq!(&sent[14..], b"payload");
    }
}
