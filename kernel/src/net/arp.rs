//! Address Resolution Protocol.
//!
//! Answers requests for our address by rewriting the message in place
//! (the Ethernet layer then flips the MACs and retransmits), and keeps a
//! bounded cache of replies for [`resolve`](Arp::resolve).

use super::ethernet::{EtherFrameHandler, EtherFrameProvider, ETHERTYPE_ARP};
use super::{Ipv4Address, MacAddress, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;
use spin::Mutex;

const HARDWARE_ETHERNET: u16 = 0x0001;
const PROTOCOL_IPV4: u16 = 0x0800;
const COMMAND_REQUEST: u16 = 1;
const COMMAND_REPLY: u16 = 2;

const CACHE_CAPACITY: usize = 128;

/// 28-byte ARP message in wire layout. The u16/u32 fields hold
/// network-order bytes; the accessors below do the swapping.
#[repr(C, packed)]
struct ArpMessage {
    hardware_type: u16,
    protocol: u16,
    hardware_address_size: u8,
    protocol_address_size: u8,
    command: u16,
    src_mac: [u8; 6],
    src_ip: u32,
    dst_mac: [u8; 6],
    dst_ip: u32,
}

impl ArpMessage {
    fn new(command: u16) -> ArpMessage {
        ArpMessage {
            hardware_type: HARDWARE_ETHERNET.to_be(),
            protocol: PROTOCOL_IPV4.to_be(),
            hardware_address_size: 6,
            protocol_address_size: 4,
            command: command.to_be(),
            src_mac: [0; 6],
            src_ip: 0,
            dst_mac: [0; 6],
            dst_ip: 0,
        }
    }

    fn command(&self) -> u16 {
        u16::from_be(self.command)
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(self as *const ArpMessage as *const u8, size_of::<ArpMessage>())
        }
    }
}

pub struct Arp {
    eth: Arc<EtherFrameProvider>,
    cache: Mutex<Vec<(u32, MacAddress)>>,
}

impl Arp {
    /// Create the handler and register it for EtherType 0x0806.
    pub fn attach(eth: Arc<EtherFrameProvider>) -> Arc<Arp> {
        let arp = Arc::new(Arp {
            eth,
            cache: Mutex::new(Vec::new()),
        });
        let handler: Arc<dyn EtherFrameHandler> = arp.clone();
        arp.eth.register_handler(ETHERTYPE_ARP, &handler);
        arp
    }

    fn cached(&self, ip_be: u32) -> Option<MacAddress> {
        // The NIC interrupt fills the cache, so reads from thread
        // context mask interrupts for the lookup.
        crate::arch::x86::without_interrupts(|| {
            self.cache
                .lock()
                .iter()
                .find(|(ip, _)| *ip == ip_be)
                .map(|(_, mac)| *mac)
        })
    }

    /// Broadcast a request for `ip`.
    pub fn request(&self, ip: Ipv4Address) -> Result<()> {
        let mut message = ArpMessage::new(COMMAND_REQUEST);
        message.src_mac = *self.eth.mac_address().bytes();
        message.src_ip = self.eth.ip_address().to_network_u32();
        message.dst_mac = *MacAddress::BROADCAST.bytes();
        message.dst_ip = ip.to_network_u32();

        self.eth
            .send(MacAddress::BROADCAST, ETHERTYPE_ARP, message.as_bytes())
    }

    /// Announce our own mapping to `ip`'s owner.
    pub fn announce(&self, ip: Ipv4Address) -> Result<()> {
        let mut message = ArpMessage::new(COMMAND_REPLY);
        message.src_mac = *self.eth.mac_address().bytes();
        message.src_ip = self.eth.ip_address().to_network_u32();
        message.dst_mac = *self.resolve(ip).bytes();
        message.dst_ip = ip.to_network_u32();

        let dst_mac = MacAddress::new(message.dst_mac);
        self.eth.send(dst_mac, ETHERTYPE_ARP, message.as_bytes())
    }

    /// Resolve `ip` to a MAC address.
    ///
    /// A cache miss broadcasts one request and then spins until the
    /// reply lands in the cache; with no reply this never returns. The
    /// NIC interrupt fills the cache while we spin.
    pub fn resolve(&self, ip: Ipv4Address) -> MacAddress {
        let ip_be = ip.to_network_u32();

        if let Some(mac) = self.cached(ip_be) {
            return mac;
        }
        self.request(ip).ok();

        loop {
            if let Some(mac) = self.cached(ip_be) {
                return mac;
            }
            core::hint::spin_loop();
        }
    }
}

impl EtherFrameHandler for Arp {
    fn on_ether_frame(&self, payload: &mut [u8]) -> bool {
        if payload.len() < size_of::<ArpMessage>() {
            return false;
        }

        let message = unsafe { &mut *(payload.as_mut_ptr() as *mut ArpMessage) };

        if u16::from_be(message.hardware_type) != HARDWARE_ETHERNET
            || u16::from_be(message.protocol) != PROTOCOL_IPV4
            || message.hardware_address_size != 6
            || message.protocol_address_size != 4
            || message.dst_ip != self.eth.ip_address().to_network_u32()
        {
            return false;
        }

        match message.command() {
            COMMAND_REQUEST => {
                // Rewrite into a reply; the caller flips the frame back.
                message.command = COMMAND_REPLY.to_be();
                message.dst_ip = message.src_ip;
                message.dst_mac = message.src_mac;
                message.src_ip = self.eth.ip_address().to_network_u32();
                message.src_mac = *self.eth.mac_address().bytes();
                true
            }
            COMMAND_REPLY => {
                let mut cache = self.cache.lock();
                if cache.len() < CACHE_CAPACITY {
                    cache.push(({ message.src_ip }, MacAddress::new(message.src_mac)));
                }
                false
            }
            _ => false,
        }
    }
}
