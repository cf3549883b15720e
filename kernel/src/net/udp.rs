//! User Datagram Protocol.
//!
//! Connectionless sockets demultiplexed by local port. A listening
//! socket latches the first sender as its remote endpoint and stops
//! listening; a connected socket only accepts its full four-tuple.
//! Port fields are kept in stored wire order, like every other header
//! field in this stack.

use super::ip::{InternetProtocolHandler, Ipv4Provider};
use super::{Ipv4Address, NetworkError, Result};
use crate::arch::x86::without_interrupts;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::mem::size_of;
use spin::Mutex;

const PROTOCOL_UDP: u8 = 0x11;
const FIRST_EPHEMERAL_PORT: u16 = 1024;
const MAX_SOCKETS: usize = 256;

#[repr(C, packed)]
struct UdpHeader {
    src_port: u16,
    dst_port: u16,
    length: u16,
    checksum: u16,
}

/// Consumer of datagrams delivered to one socket.
pub trait UdpHandler: Send + Sync {
    fn handle_udp_message(&self, socket: &Arc<UdpSocket>, data: &[u8]);
}

struct UdpSocketInner {
    local_ip: u32,
    remote_ip: u32,
    local_port: u16,
    remote_port: u16,
    listening: bool,
}

pub struct UdpSocket {
    inner: Mutex<UdpSocketInner>,
    handler: Mutex<Option<Weak<dyn UdpHandler>>>,
    provider: Weak<Udp>,
}

impl UdpSocket {
    /// Send one datagram to the latched remote endpoint.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let provider = self.provider.upgrade().ok_or(NetworkError::NoDevice)?;
        provider.send(self, data)
    }

    /// Attach the user handler receiving this socket's datagrams.
    pub fn bind(&self, handler: &Arc<dyn UdpHandler>) {
        without_interrupts(|| {
            *self.handler.lock() = Some(Arc::downgrade(handler));
        });
    }

    /// Remove this socket from its provider's table.
    pub fn disconnect(&self) {
        if let Some(provider) = self.provider.upgrade() {
            provider.remove(self);
        }
    }
}

pub struct Udp {
    self_ref: Weak<Udp>,
    ip: Arc<Ipv4Provider>,
    sockets: Mutex<Vec<Arc<UdpSocket>>>,
    free_port: Mutex<u16>,
}

impl Udp {
    /// Create the provider and register it for IP protocol 17.
    pub fn attach(ip: Arc<Ipv4Provider>) -> Arc<Udp> {
        let udp = Arc::new_cyclic(|self_ref| Udp {
            self_ref: self_ref.clone(),
            ip,
            sockets: Mutex::new(Vec::new()),
            free_port: Mutex::new(FIRST_EPHEMERAL_PORT),
        });
        let handler: Arc<dyn InternetProtocolHandler> = udp.clone();
        udp.ip.register_handler(PROTOCOL_UDP, &handler);
        udp
    }

    /// Open a socket that waits for the first datagram on `port`.
    /// Fails when the socket table is full.
    pub fn listen(&self, port: u16) -> Result<Arc<UdpSocket>> {
        let socket = Arc::new(UdpSocket {
            inner: Mutex::new(UdpSocketInner {
                local_ip: self.ip.our_ip().to_network_u32(),
                remote_ip: 0,
                local_port: port.to_be(),
                remote_port: 0,
                listening: true,
            }),
            handler: Mutex::new(None),
            provider: self.self_ref.clone(),
        });
        self.insert(socket.clone())?;
        Ok(socket)
    }

    /// Open a socket aimed at `ip:port` with a fresh ephemeral local
    /// port.
    pub fn connect(&self, ip: Ipv4Address, port: u16) -> Result<Arc<UdpSocket>> {
        let local_port = {
            let mut free_port = self.free_port.lock();
            let port = *free_port;
            *free_port += 1;
            port
        };

        let socket = Arc::new(UdpSocket {
            inner: Mutex::new(UdpSocketInner {
                local_ip: self.ip.our_ip().to_network_u32(),
                remote_ip: ip.to_network_u32(),
                local_port: local_port.to_be(),
                remote_port: port.to_be(),
                listening: false,
            }),
            handler: Mutex::new(None),
            provider: self.self_ref.clone(),
        });
        self.insert(socket.clone())?;
        Ok(socket)
    }

    fn insert(&self, socket: Arc<UdpSocket>) -> Result<()> {
        without_interrupts(|| {
            let mut sockets = self.sockets.lock();
            if sockets.len() >= MAX_SOCKETS {
                return Err(NetworkError::SocketTableFull);
            }
            sockets.push(socket);
            Ok(())
        })
    }

    fn send(&self, socket: &UdpSocket, data: &[u8]) -> Result<()> {
        let (remote_ip, header) = without_interrupts(|| {
            let inner = socket.inner.lock();
            let total_length = size_of::<UdpHeader>() + data.len();
            (
                Ipv4Address::from_network_u32(inner.remote_ip),
                UdpHeader {
                    src_port: inner.local_port,
                    dst_port: inner.remote_port,
                    length: (total_length as u16).to_be(),
                    checksum: 0,
                },
            )
        });

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(size_of::<UdpHeader>() + data.len())
            .map_err(|_| NetworkError::OutOfMemory)?;
        buffer.extend_from_slice(unsafe {
            core::slice::from_raw_parts(
                &header as *const UdpHeader as *const u8,
                size_of::<UdpHeader>(),
            )
        });
        buffer.extend_from_slice(data);

        self.ip.send(remote_ip, PROTOCOL_UDP, &buffer)
    }

    fn remove(&self, socket: &UdpSocket) {
        without_interrupts(|| {
            self.sockets
                .lock()
                .retain(|entry| !core::ptr::eq(Arc::as_ptr(entry), socket));
        });
    }
}

impl InternetProtocolHandler for Udp {
    fn on_internet_protocol_received(
        &self,
        src_ip_be: u32,
        dst_ip_be: u32,
        payload: &mut [u8],
    ) -> bool {
        if payload.len() < size_of::<UdpHeader>() {
            return false;
        }

        let src_port = u16::from_le_bytes([payload[0], payload[1]]);
        let dst_port = u16::from_le_bytes([payload[2], payload[3]]);

        let socket = {
            let sockets = self.sockets.lock();
            let mut found = None;
            for entry in sockets.iter() {
                let mut inner = entry.inner.lock();
                if inner.local_port == dst_port && inner.local_ip == dst_ip_be && inner.listening {
                    // First sender wins the endpoint.
                    inner.listening = false;
                    inner.remote_port = src_port;
                    inner.remote_ip = src_ip_be;
                    found = Some(entry.clone());
                    break;
                }
                if inner.local_port == dst_port
                    && inner.local_ip == dst_ip_be
                    && inner.remote_port == src_port
                    && inner.remote_ip == src_ip_be
                {
                    found = Some(entry.clone());
                    break;
                }
            }
            found
        };

        if let Some(socket) = socket {
            let handler = socket.handler.lock().as_ref().and_then(Weak::upgrade);
            if let Some(handler) = handler {
                handler.handle_udp_message(&socket, &payload[size_of::<UdpHeader>()..]);
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::{NicDevice, RawDataHandler};
    use crate::net::ethernet::ETHERTYPE_IPV4;
    use crate::net::testing::{build_test_stack, ether_frame, ipv4_packet, RecordingUdpHandler};

    fn udp_payload(src_port: u16, dst_port: u16, data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&src_port.to_be_bytes());
        payload.extend_from_slice(&dst_port.to_be_bytes());
        payload.extend_from_slice(&((8 + data.len()) as u16).to_be_bytes());
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(data);
        payload
    }

    #[test_case]
    fn listening_socket_latches_first_sender() {
        let stack = build_test_stack();
        let udp = Udp::attach(stack.ip.clone());

        let socket = udp.listen(7000).unwrap();
        let recorder = Arc::new(RecordingUdpHandler::new());
        let handler: Arc<dyn UdpHandler> = recorder.clone();
        socket.bind(&handler);

        let peer = Ipv4Address::new(10, 0, 2, 2);
        let packet = ipv4_packet(peer, stack.nic.ip_address(), PROTOCOL_UDP,
            &udp_payload(9999, 7000, b"hello"));
        let mut frame = ether_frame(
            *stack.nic.mac_address().bytes(), stack.peer_mac, ETHERTYPE_IPV4, &packet);
        stack.eth.on_raw_data(&mut frame);

        assert_eq!(recorder.messages(), alloc::vec![b"hello".to_vec()]);
        let inner = socket.inner.lock();
        assert!(!inner.listening);
        assert_eq!({ inner.remote_port }, 9999u16.to_be());
        assert_eq!({ inner.remote_ip }, peer.to_network_u32());
    }

    #[test_case]
    fn connected_socket_requires_full_tuple() {
        let stack = build_test_stack();
        let udp = Udp::attach(stack.ip.clone());

        let peer = Ipv4Address::new(10, 0, 2, 2);
        let socket = udp.connect(peer, 5353).unwrap();
        let recorder = Arc::new(RecordingUdpHandler::new());
        let handler: Arc<dyn UdpHandler> = recorder.clone();
        socket.bind(&handler);

        let local_port = u16::from_be({ socket.inner.lock().local_port });
        assert!(local_port >= FIRST_EPHEMERAL_PORT);

        // Right port, wrong remote endpoint: not delivered.
        let stray = ipv4_packet(
            Ipv4Address::new(10, 0, 2, 77),
            stack.nic.ip_address(),
            PROTOCOL_UDP,
            &udp_payload(5353, local_port, b"stray"),
        );
        let mut frame = ether_frame(
            *stack.nic.mac_address().bytes(), stack.peer_mac, ETHERTYPE_IPV4, &stray);
        stack.eth.on_raw_data(&mut frame);
        assert!(recorder.messages().is_empty());

        // Exact four-tuple: delivered.
        let matching = ipv4_packet(
            peer,
            stack.nic.ip_address(),
            PROTOCOL_UDP,
            &udp_payload(5353, local_port, b"reply"),
        );
        let mut frame = ether_frame(
            *stack.nic.mac_address().bytes(), stack.peer_mac, ETHERTYPE_IPV4, &matching);
        stack.eth.on_raw_data(&mut frame);
        assert_eq!(recorder.messages(), alloc::vec![b"reply".to_vec()]);
    }

    #[test_case]
    fn socket_table_is_bounded() {
        let stack = build_test_stack();
        let udp = Udp::attach(stack.ip.clone());

        for port in 0..MAX_SOCKETS as u16 {
            assert!(udp.listen(port + 1).is_ok());
        }
        assert!(matches!(
            udp.listen(9999),
            Err(crate::net::NetworkError::SocketTableFull)
        ));
    }

    #[test_case]
    fn send_emits_header_with_network_order_length() {
        let stack = build_test_stack();
        let udp = Udp::attach(stack.ip.clone());

        let socket = udp.connect(Ipv4Address::new(10, 0, 2, 2), 5353).unwrap();
        socket.send(b"ping!").unwrap();

        let frame = stack.nic.last_sent().unwrap();
        let udp_header = &frame[34..42];
        assert_eq!(&udp_header[2..4], &5353u16.to_be_bytes());
        assert_eq!(&udp_header[4..6], &13u16.to_be_bytes());
        // UDP checksum is always emitted as zero.
        assert_eq!(&udp_header[6..8], &[0, 0]);
        assert_eq!(&frame[42..], b"ping!");
    }
}
