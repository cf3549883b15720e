//! Network stack.
//!
//! Layered handler chain: the PCnet driver hands raw frames to the
//! Ethernet layer, which demultiplexes by EtherType to ARP and IPv4;
//! IPv4 demultiplexes by protocol number to ICMP, UDP and TCP. Each
//! layer registers a weak handler reference with the one below it, so a
//! dropped layer leaves only an inert slot behind.

pub mod arp;
pub mod device;
pub mod ethernet;
pub mod icmp;
pub mod ip;
pub mod tcp;
pub mod udp;

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkError {
    OutOfMemory,
    SocketTableFull,
    NoDevice,
}

pub type Result<T> = core::result::Result<T, NetworkError>;

/// 48-bit hardware address in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    pub const fn new(bytes: [u8; 6]) -> MacAddress {
        MacAddress(bytes)
    }

    pub fn bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == MacAddress::BROADCAST
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// IPv4 address in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Address(pub [u8; 4]);

impl Ipv4Address {
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Ipv4Address {
        Ipv4Address([a, b, c, d])
    }

    /// The `u32` whose in-memory bytes are this address in wire order.
    /// All header fields and the ARP cache hold addresses in this form.
    pub fn to_network_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn from_network_u32(value: u32) -> Ipv4Address {
        Ipv4Address(value.to_le_bytes())
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures: a capturing NIC, frame builders and a fully
    //! wired stack with a pre-seeded ARP cache.

    use super::device::{NicDevice, RawDataHandler};
    use super::ethernet::{EtherFrameHandler, EtherFrameProvider, ETHERTYPE_ARP};
    use super::{arp::Arp, ip::Ipv4Provider, Ipv4Address, MacAddress};
    use alloc::sync::{Arc, Weak};
    use alloc::vec::Vec;
    use spin::Mutex;

    pub const OUR_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
    pub const OUR_IP: Ipv4Address = Ipv4Address::new(10, 0, 2, 15);
    pub const PEER_IP: Ipv4Address = Ipv4Address::new(10, 0, 2, 2);
    pub const PEER_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x35, 0x02];
    pub const GATEWAY_IP: Ipv4Address = Ipv4Address::new(10, 0, 2, 1);
    pub const GATEWAY_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x35, 0x01];
    pub const SUBNET_MASK: Ipv4Address = Ipv4Address::new(255, 255, 255, 0);

    pub struct MockNic {
        ip: Mutex<Ipv4Address>,
        sent: Mutex<Vec<Vec<u8>>>,
        handler: Mutex<Option<Weak<dyn RawDataHandler>>>,
    }

    impl MockNic {
        pub fn new() -> Arc<MockNic> {
            Arc::new(MockNic {
                ip: Mutex::new(OUR_IP),
                sent: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
            })
        }

        pub fn last_sent(&self) -> Option<Vec<u8>> {
            self.sent.lock().last().cloned()
        }

        pub fn sent_frames(&self) -> Vec<Vec<u8>> {
            self.sent.lock().clone()
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    impl NicDevice for MockNic {
        fn mac_address(&self) -> MacAddress {
            MacAddress::new(OUR_MAC)
        }

        fn ip_address(&self) -> Ipv4Address {
            *self.ip.lock()
        }

        fn set_ip_address(&self, ip: Ipv4Address) {
            *self.ip.lock() = ip;
        }

        fn send(&self, buffer: &[u8]) {
            self.sent.lock().push(buffer.to_vec());
        }

        fn set_raw_data_handler(&self, handler: &Arc<dyn RawDataHandler>) {
            *self.handler.lock() = Some(Arc::downgrade(handler));
        }
    }

    pub fn ether_frame(dst: [u8; 6], src: [u8; 6], ether_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    pub fn ipv4_packet(src: Ipv4Address, dst: Ipv4Address, protocol: u8, payload: &[u8]) -> Vec<u8> {
        let total = 20 + payload.len();
        let mut packet = Vec::new();
        packet.push(0x45);
        packet.push(0);
        packet.extend_from_slice(&(total as u16).to_be_bytes());
        packet.extend_from_slice(&[0x00, 0x01]);
        packet.extend_from_slice(&[0x40, 0x00]);
        packet.push(0x40);
        packet.push(protocol);
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&src.0);
        packet.extend_from_slice(&dst.0);
        let sum = super::ip::checksum(&packet);
        packet[10..12].copy_from_slice(&sum.to_le_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    fn arp_reply(src_mac: [u8; 6], src_ip: Ipv4Address) -> Vec<u8> {
        let mut message = Vec::new();
        message.extend_from_slice(&[0x00, 0x01]);
        message.extend_from_slice(&[0x08, 0x00]);
        message.push(6);
        message.push(4);
        message.extend_from_slice(&[0x00, 0x02]);
        message.extend_from_slice(&src_mac);
        message.extend_from_slice(&src_ip.0);
        message.extend_from_slice(&OUR_MAC);
        message.extend_from_slice(&OUR_IP.0);
        message
    }

    pub struct TestStack {
        pub nic: Arc<MockNic>,
        pub eth: Arc<EtherFrameProvider>,
        pub arp: Arc<Arp>,
        pub ip: Arc<Ipv4Provider>,
        pub peer_mac: [u8; 6],
        pub gateway_mac: [u8; 6],
    }

    /// Wire up NIC → Ethernet → ARP → IPv4 and seed the ARP cache with
    /// the peer and the gateway so sends resolve without spinning.
    pub fn build_test_stack() -> TestStack {
        let nic = MockNic::new();
        let eth = EtherFrameProvider::attach(nic.clone());
        let arp = Arp::attach(eth.clone());
        let ip = Ipv4Provider::attach(eth.clone(), arp.clone(), GATEWAY_IP, SUBNET_MASK);

        for (mac, peer_ip) in [(PEER_MAC, PEER_IP), (GATEWAY_MAC, GATEWAY_IP)] {
            let mut frame = ether_frame(OUR_MAC, mac, ETHERTYPE_ARP, &arp_reply(mac, peer_ip));
            eth.on_raw_data(&mut frame);
        }

        TestStack {
            nic,
            eth,
            arp,
            ip,
            peer_mac: PEER_MAC,
            gateway_mac: GATEWAY_MAC,
        }
    }

    pub struct RecordingHandler {
        reply: bool,
        calls: Mutex<usize>,
        last: Mutex<Vec<u8>>,
    }

    impl RecordingHandler {
        pub fn new(reply: bool) -> RecordingHandler {
            RecordingHandler {
                reply,
                calls: Mutex::new(0),
                last: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            *self.calls.lock()
        }

        pub fn last_payload(&self) -> Vec<u8> {
            self.last.lock().clone()
        }
    }

    impl EtherFrameHandler for RecordingHandler {
        fn on_ether_frame(&self, payload: &mut [u8]) -> bool {
            *self.calls.lock() += 1;
            *self.last.lock() = payload.to_vec();
            self.reply
        }
    }

    pub struct RecordingUdpHandler {
        messages: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingUdpHandler {
        pub fn new() -> RecordingUdpHandler {
            RecordingUdpHandler {
                messages: Mutex::new(Vec::new()),
            }
        }

        pub fn messages(&self) -> Vec<Vec<u8>> {
            self.messages.lock().clone()
        }
    }

    impl super::udp::UdpHandler for RecordingUdpHandler {
        fn handle_udp_message(&self, _socket: &Arc<super::udp::UdpSocket>, data: &[u8]) {
            self.messages.lock().push(data.to_vec());
        }
    }

    pub struct RecordingTcpHandler {
        accept: bool,
        messages: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingTcpHandler {
        pub fn new(accept: bool) -> RecordingTcpHandler {
            RecordingTcpHandler {
                accept,
                messages: Mutex::new(Vec::new()),
            }
        }

        pub fn messages(&self) -> Vec<Vec<u8>> {
            self.messages.lock().clone()
        }
    }

    impl super::tcp::TcpHandler for RecordingTcpHandler {
        fn handle_tcp_message(&self, _socket: &Arc<super::tcp::TcpSocket>, data: &[u8]) -> bool {
            self.messages.lock().push(data.to_vec());
            self.accept
        }
    }
}
