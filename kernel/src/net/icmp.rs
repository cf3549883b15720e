//! Internet Control Message Protocol: echo request/reply.

use super::ip::{checksum, InternetProtocolHandler, Ipv4Provider};
use super::{Ipv4Address, Result};
use crate::println;
use alloc::sync::Arc;
use core::mem::size_of;

const PROTOCOL_ICMP: u8 = 0x01;
const TYPE_ECHO_REPLY: u8 = 0;
const TYPE_ECHO_REQUEST: u8 = 8;

/// Identifier carried in outgoing echo requests.
const ECHO_IDENT: u32 = 0x3713;

#[repr(C, packed)]
struct IcmpMessage {
    message_type: u8,
    code: u8,
    checksum: u16,
    data: u32,
}

pub struct Icmp {
    ip: Arc<Ipv4Provider>,
}

impl Icmp {
    /// Create the handler and register it for IP protocol 1.
    pub fn attach(ip: Arc<Ipv4Provider>) -> Arc<Icmp> {
        let icmp = Arc::new(Icmp { ip });
        let handler: Arc<dyn InternetProtocolHandler> = icmp.clone();
        icmp.ip.register_handler(PROTOCOL_ICMP, &handler);
        icmp
    }

    /// Ping `ip`: send an echo request with our fixed identifier.
    pub fn request_echo_reply(&self, ip: Ipv4Address) -> Result<()> {
        let mut message = IcmpMessage {
            message_type: TYPE_ECHO_REQUEST,
            code: 0,
            checksum: 0,
            data: ECHO_IDENT,
        };
        message.checksum = checksum(unsafe {
            core::slice::from_raw_parts(
                &message as *const IcmpMessage as *const u8,
                size_of::<IcmpMessage>(),
            )
        });

        self.ip.send(ip, PROTOCOL_ICMP, unsafe {
            core::slice::from_raw_parts(
                &message as *const IcmpMessage as *const u8,
                size_of::<IcmpMessage>(),
            )
        })
    }
}

impl InternetProtocolHandler for Icmp {
    fn on_internet_protocol_received(
        &self,
        src_ip_be: u32,
        _dst_ip_be: u32,
        payload: &mut [u8],
    ) -> bool {
        if payload.len() < size_of::<IcmpMessage>() {
            return false;
        }

        match payload[0] {
            TYPE_ECHO_REPLY => {
                println!("ping response from {}", Ipv4Address::from_network_u32(src_ip_be));
                false
            }
            TYPE_ECHO_REQUEST => {
                // Turn the request into the reply in place and let the
                // IP layer send it back.
                payload[0] = TYPE_ECHO_REPLY;
                payload[2..4].copy_from_slice(&[0, 0]);
                let sum = checksum(payload);
                payload[2..4].copy_from_slice(&sum.to_le_bytes());
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::{NicDevice, RawDataHandler};
    use crate::net::ethernet::ETHERTYPE_IPV4;
    use crate::net::testing::{build_test_stack, ether_frame, ipv4_packet};

    #[test_case]
    fn echo_request_becomes_checksummed_reply() {
        let stack = build_test_stack();
        let icmp = Icmp::attach(stack.ip.clone());

        // Echo request with our identifier and a trailing payload.
        let mut icmp_payload = alloc::vec![TYPE_ECHO_REQUEST, 0, 0, 0, 0x13, 0x37, 0, 0];
        icmp_payload.extend_from_slice(b"abcdefgh");
        let sum = checksum(&icmp_payload);
        icmp_payload[2..4].copy_from_slice(&sum.to_le_bytes());

        let peer = Ipv4Address::new(10, 0, 2, 2);
        let packet = ipv4_packet(peer, stack.nic.ip_address(), PROTOCOL_ICMP, &icmp_payload);
        let mut frame = ether_frame(
            *stack.nic.mac_address().bytes(),
            stack.peer_mac,
            ETHERTYPE_IPV4,
            &packet,
        );

        // The reply goes back out through the NIC echo path.
        assert!(stack.eth.on_raw_data(&mut frame));

        // MACs swapped, IPs swapped, TTL refreshed.
        assert_eq!(&frame[0..6], &stack.peer_mac);
        assert_eq!(&frame[26..30], &stack.nic.ip_address().0);
        assert_eq!(&frame[30..34], &peer.0);
        assert_eq!(frame[22], 0x40);

        // IP and ICMP checksums both verify; type flipped, payload kept.
        assert_eq!(checksum(&frame[14..34]), 0);
        let reply = &frame[34..];
        assert_eq!(reply[0], TYPE_ECHO_REPLY);
        assert_eq!(checksum(reply), 0);
        assert_eq!(&reply[4..8], &[0x13, 0x37, 0, 0]);
        assert_eq!(&reply[8..], b"abcdefgh");
        assert!(icmp.ip.our_ip() == stack.nic.ip_address());
    }

    #[test_case]
    fn truncated_message_is_dropped() {
        let stack = build_test_stack();
        let _icmp = Icmp::attach(stack.ip.clone());

        let packet = ipv4_packet(
            Ipv4Address::new(10, 0, 2, 2),
            stack.nic.ip_address(),
            PROTOCOL_ICMP,
            &[TYPE_ECHO_REQUEST, 0, 0],
        );
        let mut frame = ether_frame(
            *stack.nic.mac_address().bytes(),
            stack.peer_mac,
            ETHERTYPE_IPV4,
            &packet,
        );
        assert!(!stack.eth.on_raw_data(&mut frame));
    }
}
