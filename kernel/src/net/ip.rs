//! IPv4 layer.
//!
//! Validates incoming packets, demultiplexes them by protocol number and
//! routes outgoing packets directly or via the gateway depending on the
//! subnet mask. Multi-byte header fields hold network-order bytes; `_be`
//! values are `u32`s in that same stored form.

use super::arp::Arp;
use super::ethernet::{EtherFrameHandler, EtherFrameProvider, ETHERTYPE_IPV4};
use super::{Ipv4Address, NetworkError, Result};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::mem::size_of;
use spin::Mutex;

const DEFAULT_TTL: u8 = 0x40;

/// 20-byte IPv4 header, no options.
#[repr(C, packed)]
struct Ipv4Header {
    version_ihl: u8,
    tos: u8,
    total_length: u16,
    ident: u16,
    flags_and_offset: u16,
    time_to_live: u8,
    protocol: u8,
    checksum: u16,
    src_ip: u32,
    dst_ip: u32,
}

impl Ipv4Header {
    fn header_length(&self) -> usize {
        (self.version_ihl & 0x0F) as usize * 4
    }
}

/// Handler for one IP protocol number (ICMP, UDP, TCP).
///
/// Returning `true` asks the IP layer to turn the packet around: swap
/// the addresses, refresh TTL and checksum, and bubble the reply up.
pub trait InternetProtocolHandler: Send + Sync {
    fn on_internet_protocol_received(
        &self,
        src_ip_be: u32,
        dst_ip_be: u32,
        payload: &mut [u8],
    ) -> bool;
}

pub struct Ipv4Provider {
    eth: Arc<EtherFrameProvider>,
    arp: Arc<Arp>,
    gateway: Ipv4Address,
    subnet_mask: Ipv4Address,
    handlers: Mutex<BTreeMap<u8, Weak<dyn InternetProtocolHandler>>>,
}

impl Ipv4Provider {
    /// Create the provider and register it for EtherType 0x0800.
    pub fn attach(
        eth: Arc<EtherFrameProvider>,
        arp: Arc<Arp>,
        gateway: Ipv4Address,
        subnet_mask: Ipv4Address,
    ) -> Arc<Ipv4Provider> {
        let provider = Arc::new(Ipv4Provider {
            eth,
            arp,
            gateway,
            subnet_mask,
            handlers: Mutex::new(BTreeMap::new()),
        });
        let handler: Arc<dyn EtherFrameHandler> = provider.clone();
        provider.eth.register_handler(ETHERTYPE_IPV4, &handler);
        provider
    }

    /// Route packets with this protocol number to `handler`.
    pub fn register_handler(&self, protocol: u8, handler: &Arc<dyn InternetProtocolHandler>) {
        crate::arch::x86::without_interrupts(|| {
            self.handlers.lock().insert(protocol, Arc::downgrade(handler));
        });
    }

    pub fn our_ip(&self) -> Ipv4Address {
        self.eth.ip_address()
    }

    /// Build and transmit one IPv4 packet. The next hop is the
    /// destination itself when it shares our subnet, the gateway
    /// otherwise; either way ARP resolves the MAC.
    pub fn send(&self, dst_ip: Ipv4Address, protocol: u8, payload: &[u8]) -> Result<()> {
        let src_ip = self.our_ip();
        let total_length = size_of::<Ipv4Header>() + payload.len();

        let header = Ipv4Header {
            version_ihl: 0x45,
            tos: 0,
            total_length: (total_length as u16).to_be(),
            ident: 0x0100,
            flags_and_offset: 0x0040,
            time_to_live: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src_ip: src_ip.to_network_u32(),
            dst_ip: dst_ip.to_network_u32(),
        };

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(total_length)
            .map_err(|_| NetworkError::OutOfMemory)?;
        buffer.extend_from_slice(unsafe {
            core::slice::from_raw_parts(
                &header as *const Ipv4Header as *const u8,
                size_of::<Ipv4Header>(),
            )
        });
        buffer.extend_from_slice(payload);

        let checksum = checksum(&buffer[..size_of::<Ipv4Header>()]);
        buffer[10..12].copy_from_slice(&checksum.to_le_bytes());

        let mask = self.subnet_mask.to_network_u32();
        let route = if dst_ip.to_network_u32() & mask == src_ip.to_network_u32() & mask {
            dst_ip
        } else {
            self.gateway
        };

        let dst_mac = self.arp.resolve(route);
        self.eth.send(dst_mac, ETHERTYPE_IPV4, &buffer)
    }
}

impl EtherFrameHandler for Ipv4Provider {
    fn on_ether_frame(&self, payload: &mut [u8]) -> bool {
        if payload.len() < size_of::<Ipv4Header>() {
            return false;
        }

        let (src_ip, dst_ip, protocol, header_length, length) = {
            let header = unsafe { &*(payload.as_ptr() as *const Ipv4Header) };
            let total = u16::from_be(header.total_length) as usize;
            (
                { header.src_ip },
                { header.dst_ip },
                header.protocol,
                header.header_length(),
                total.min(payload.len()),
            )
        };

        let mut send_back = false;
        if dst_ip == self.our_ip().to_network_u32() && header_length <= length {
            let handler = self.handlers.lock().get(&protocol).and_then(Weak::upgrade);
            if let Some(handler) = handler {
                send_back = handler.on_internet_protocol_received(
                    src_ip,
                    dst_ip,
                    &mut payload[header_length..length],
                );
            }
        }

        if send_back {
            let header = unsafe { &mut *(payload.as_mut_ptr() as *mut Ipv4Header) };
            header.dst_ip = src_ip;
            header.src_ip = dst_ip;
            header.time_to_live = DEFAULT_TTL;
            header.checksum = 0;
            let length = header.header_length();
            let sum = checksum(&payload[..length]);
            payload[10..12].copy_from_slice(&sum.to_le_bytes());
        }

        send_back
    }
}

/// RFC 1071 internet checksum, shared by IPv4, ICMP and TCP.
///
/// Sums the data as network-order 16-bit words, folds the carries, and
/// one's-complements. The result comes back in stored (wire) form, ready
/// to drop into a packed header field; a trailing odd byte counts as the
/// high half of a final word.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum & 0xFFFF_0000 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    (!(sum as u16)).to_be()
}
