//! Transmission Control Protocol.
//!
//! Socket state machine over IPv4 protocol 6: passive and active opens,
//! established data transfer with a fixed advertised window, teardown,
//! and RST on anything out of order. No retransmission, no congestion
//! control, no out-of-order reassembly; a segment whose sequence number
//! is not exactly the expected one is answered with RST.
//!
//! Sequence numbers live host-endian in the socket and are byte-swapped
//! at the wire; ports and IPs are kept in stored wire order throughout.

use super::ip::{checksum, InternetProtocolHandler, Ipv4Provider};
use super::{Ipv4Address, NetworkError, Result};
use crate::arch::x86::without_interrupts;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::mem::size_of;
use spin::Mutex;

const PROTOCOL_TCP: u8 = 0x06;
const FIRST_EPHEMERAL_PORT: u16 = 1024;
const MAX_SOCKETS: usize = 256;

/// Initial send sequence number for every connection.
const INITIAL_SEQUENCE: u32 = 0xBEEF_CAFE;
/// Fixed advertised receive window.
const WINDOW_SIZE: u16 = 0xFFFF;
/// MSS option (1460 bytes), sent with every SYN.
const MSS_OPTION: [u8; 4] = [0x02, 0x04, 0x05, 0xB4];

pub const FIN: u8 = 1;
pub const SYN: u8 = 2;
pub const RST: u8 = 4;
pub const PSH: u8 = 8;
pub const ACK: u8 = 16;
pub const URG: u8 = 32;

const HEADER_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
}

#[repr(C, packed)]
struct TcpHeader {
    src_port: u16,
    dst_port: u16,
    sequence_number: u32,
    acknowledgement_number: u32,
    data_offset: u8,
    flags: u8,
    window_size: u16,
    checksum: u16,
    urgent_ptr: u16,
}

/// Prefixed to the segment for checksum computation only; never sent.
#[repr(C, packed)]
struct TcpPseudoHeader {
    src_ip: u32,
    dst_ip: u32,
    protocol: u16,
    total_length: u16,
}

/// Consumer of data delivered on one socket.
///
/// Returning `false` rejects the segment; the provider answers the peer
/// with RST.
pub trait TcpHandler: Send + Sync {
    fn handle_tcp_message(&self, socket: &Arc<TcpSocket>, data: &[u8]) -> bool;
}

struct TcpSocketInner {
    local_ip: u32,
    remote_ip: u32,
    local_port: u16,
    remote_port: u16,
    sequence_number: u32,
    acknowledgement_number: u32,
    state: TcpState,
}

pub struct TcpSocket {
    inner: Mutex<TcpSocketInner>,
    handler: Mutex<Option<Weak<dyn TcpHandler>>>,
    provider: Weak<Tcp>,
}

impl TcpSocket {
    pub fn state(&self) -> TcpState {
        without_interrupts(|| self.inner.lock().state)
    }

    /// Send data on an established connection. Blocks (spinning) until
    /// the handshake completes.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        while self.state() != TcpState::Established {
            core::hint::spin_loop();
        }
        let provider = self.provider.upgrade().ok_or(NetworkError::NoDevice)?;
        without_interrupts(|| {
            let mut inner = self.inner.lock();
            provider.send_segment(&mut inner, data, PSH | ACK)
        })
    }

    /// Attach the user handler receiving this socket's data.
    pub fn bind(&self, handler: &Arc<dyn TcpHandler>) {
        without_interrupts(|| {
            *self.handler.lock() = Some(Arc::downgrade(handler));
        });
    }

    /// Begin an orderly close: FIN_WAIT1 plus a FIN+ACK to the peer.
    pub fn disconnect(&self) {
        if let Some(provider) = self.provider.upgrade() {
            provider.disconnect(self);
        }
    }
}

pub struct Tcp {
    self_ref: Weak<Tcp>,
    ip: Arc<Ipv4Provider>,
    sockets: Mutex<Vec<Arc<TcpSocket>>>,
    free_port: Mutex<u16>,
}

impl Tcp {
    /// Create the provider and register it for IP protocol 6.
    pub fn attach(ip: Arc<Ipv4Provider>) -> Arc<Tcp> {
        let tcp = Arc::new_cyclic(|self_ref| Tcp {
            self_ref: self_ref.clone(),
            ip,
            sockets: Mutex::new(Vec::new()),
            free_port: Mutex::new(FIRST_EPHEMERAL_PORT),
        });
        let handler: Arc<dyn InternetProtocolHandler> = tcp.clone();
        tcp.ip.register_handler(PROTOCOL_TCP, &handler);
        tcp
    }

    /// Open a passive socket on `port`. Fails when the socket table is
    /// full.
    pub fn listen(&self, port: u16) -> Result<Arc<TcpSocket>> {
        let socket = Arc::new(TcpSocket {
            inner: Mutex::new(TcpSocketInner {
                local_ip: self.ip.our_ip().to_network_u32(),
                remote_ip: 0,
                local_port: port.to_be(),
                remote_port: 0,
                sequence_number: 0,
                acknowledgement_number: 0,
                state: TcpState::Listen,
            }),
            handler: Mutex::new(None),
            provider: self.self_ref.clone(),
        });
        self.insert(socket.clone())?;
        Ok(socket)
    }

    /// Active open towards `ip:port`; sends the initial SYN.
    pub fn connect(&self, ip: Ipv4Address, port: u16) -> Result<Arc<TcpSocket>> {
        let local_port = {
            let mut free_port = self.free_port.lock();
            let port = *free_port;
            *free_port += 1;
            port
        };

        let socket = Arc::new(TcpSocket {
            inner: Mutex::new(TcpSocketInner {
                local_ip: self.ip.our_ip().to_network_u32(),
                remote_ip: ip.to_network_u32(),
                local_port: local_port.to_be(),
                remote_port: port.to_be(),
                sequence_number: INITIAL_SEQUENCE,
                acknowledgement_number: 0,
                state: TcpState::SynSent,
            }),
            handler: Mutex::new(None),
            provider: self.self_ref.clone(),
        });
        self.insert(socket.clone())?;

        without_interrupts(|| {
            let mut inner = socket.inner.lock();
            let _ = self.send_segment(&mut inner, &[], SYN);
        });

        Ok(socket)
    }

    fn insert(&self, socket: Arc<TcpSocket>) -> Result<()> {
        without_interrupts(|| {
            let mut sockets = self.sockets.lock();
            if sockets.len() >= MAX_SOCKETS {
                return Err(NetworkError::SocketTableFull);
            }
            sockets.push(socket);
            Ok(())
        })
    }

    /// Close `socket` from our side.
    pub fn disconnect(&self, socket: &TcpSocket) {
        without_interrupts(|| {
            let mut inner = socket.inner.lock();
            inner.state = TcpState::FinWait1;
            let _ = self.send_segment(&mut inner, &[], FIN | ACK);
            inner.sequence_number = inner.sequence_number.wrapping_add(1);
        });
    }

    fn remove(&self, socket: &TcpSocket) {
        without_interrupts(|| {
            self.sockets
                .lock()
                .retain(|entry| !core::ptr::eq(Arc::as_ptr(entry), socket));
        });
    }

    /// Build and send one segment for the connection in `inner`. The
    /// checksum covers a pseudo-header (addresses, protocol, length),
    /// the TCP header and the payload. A SYN carries the MSS option and
    /// a 6-dword header; everything else goes out with 5 dwords and no
    /// options.
    fn send_segment(&self, inner: &mut TcpSocketInner, data: &[u8], flags: u8) -> Result<()> {
        let with_options = flags & SYN != 0;
        let header_length = HEADER_SIZE + if with_options { MSS_OPTION.len() } else { 0 };
        let total_length = header_length + data.len();

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(size_of::<TcpPseudoHeader>() + total_length)
            .map_err(|_| NetworkError::OutOfMemory)?;

        let pseudo_header = TcpPseudoHeader {
            src_ip: inner.local_ip,
            dst_ip: inner.remote_ip,
            protocol: 0x0600,
            total_length: (total_length as u16).to_be(),
        };
        buffer.extend_from_slice(unsafe {
            core::slice::from_raw_parts(
                &pseudo_header as *const TcpPseudoHeader as *const u8,
                size_of::<TcpPseudoHeader>(),
            )
        });

        let header = TcpHeader {
            src_port: inner.local_port,
            dst_port: inner.remote_port,
            sequence_number: inner.sequence_number.to_be(),
            acknowledgement_number: inner.acknowledgement_number.to_be(),
            data_offset: ((header_length / 4) as u8) << 4,
            flags,
            window_size: WINDOW_SIZE.to_be(),
            checksum: 0,
            urgent_ptr: 0,
        };
        buffer.extend_from_slice(unsafe {
            core::slice::from_raw_parts(
                &header as *const TcpHeader as *const u8,
                size_of::<TcpHeader>(),
            )
        });
        if with_options {
            buffer.extend_from_slice(&MSS_OPTION);
        }
        buffer.extend_from_slice(data);

        inner.sequence_number = inner.sequence_number.wrapping_add(data.len() as u32);

        let sum = checksum(&buffer);
        buffer[size_of::<TcpPseudoHeader>() + 16..size_of::<TcpPseudoHeader>() + 18]
            .copy_from_slice(&sum.to_le_bytes());

        self.ip.send(
            Ipv4Address::from_network_u32(inner.remote_ip),
            PROTOCOL_TCP,
            &buffer[size_of::<TcpPseudoHeader>()..],
        )
    }
}

enum Action {
    None,
    Deliver,
}

impl InternetProtocolHandler for Tcp {
    fn on_internet_protocol_received(
        &self,
        src_ip_be: u32,
        dst_ip_be: u32,
        payload: &mut [u8],
    ) -> bool {
        if payload.len() < HEADER_SIZE {
            return false;
        }

        let src_port = u16::from_le_bytes([payload[0], payload[1]]);
        let dst_port = u16::from_le_bytes([payload[2], payload[3]]);
        let seq = u32::from_be_bytes(payload[4..8].try_into().unwrap());
        let ack_number = u32::from_be_bytes(payload[8..12].try_into().unwrap());
        let data_offset = ((payload[12] >> 4) as usize) * 4;
        let flags = payload[13];

        if data_offset < HEADER_SIZE || data_offset > payload.len() {
            return false;
        }
        let has_data = payload.len() > data_offset;

        let socket = {
            let sockets = self.sockets.lock();
            let mut found = None;
            for entry in sockets.iter() {
                let inner = entry.inner.lock();
                let local_match = inner.local_port == dst_port && inner.local_ip == dst_ip_be;
                if local_match
                    && inner.state == TcpState::Listen
                    && flags & (SYN | ACK) == SYN
                {
                    found = Some(entry.clone());
                    break;
                }
                if local_match && inner.remote_port == src_port && inner.remote_ip == src_ip_be {
                    found = Some(entry.clone());
                    break;
                }
            }
            found
        };

        let mut reset = false;

        if let Some(socket) = &socket {
            let mut action = Action::None;
            {
                let mut inner = socket.inner.lock();

                if flags & RST != 0 {
                    if inner.state != TcpState::Listen {
                        inner.state = TcpState::Closed;
                    }
                } else {
                    match flags & (SYN | ACK | FIN) {
                        SYN => {
                            if inner.state == TcpState::Listen {
                                inner.state = TcpState::SynReceived;
                                inner.remote_port = src_port;
                                inner.remote_ip = src_ip_be;
                                inner.acknowledgement_number = seq.wrapping_add(1);
                                inner.sequence_number = INITIAL_SEQUENCE;
                                let _ = self.send_segment(&mut inner, &[], SYN | ACK);
                                inner.sequence_number = inner.sequence_number.wrapping_add(1);
                            } else {
                                reset = true;
                            }
                        }
                        c if c == SYN | ACK => {
                            if inner.state == TcpState::SynSent {
                                inner.state = TcpState::Established;
                                inner.acknowledgement_number = seq.wrapping_add(1);
                                inner.sequence_number = inner.sequence_number.wrapping_add(1);
                                let _ = self.send_segment(&mut inner, &[], ACK);
                            } else {
                                reset = true;
                            }
                        }
                        c if c & (SYN | FIN) == SYN | FIN => {
                            reset = true;
                        }
                        c if c == FIN || c == FIN | ACK => match inner.state {
                            TcpState::Established => {
                                inner.state = TcpState::CloseWait;
                                inner.acknowledgement_number =
                                    inner.acknowledgement_number.wrapping_add(1);
                                let _ = self.send_segment(&mut inner, &[], ACK);
                                let _ = self.send_segment(&mut inner, &[], FIN | ACK);
                            }
                            TcpState::CloseWait => {
                                inner.state = TcpState::Closed;
                            }
                            TcpState::FinWait1 | TcpState::FinWait2 => {
                                inner.state = TcpState::Closed;
                                inner.acknowledgement_number =
                                    inner.acknowledgement_number.wrapping_add(1);
                                let _ = self.send_segment(&mut inner, &[], ACK);
                            }
                            _ => reset = true,
                        },
                        _ => {
                            if has_data {
                                let receiving = matches!(
                                    inner.state,
                                    TcpState::Established
                                        | TcpState::FinWait1
                                        | TcpState::FinWait2
                                );
                                if receiving && seq == inner.acknowledgement_number {
                                    action = Action::Deliver;
                                } else {
                                    reset = true;
                                }
                            } else if flags & ACK != 0 {
                                match inner.state {
                                    TcpState::SynReceived => {
                                        inner.state = TcpState::Established
                                    }
                                    TcpState::FinWait1 => inner.state = TcpState::FinWait2,
                                    TcpState::CloseWait => inner.state = TcpState::Closed,
                                    TcpState::Listen | TcpState::SynSent => reset = true,
                                    _ => {}
                                }
                            }
                        }
                    }
                }
            }

            if let Action::Deliver = action {
                let data = &payload[data_offset..];
                let handler = socket.handler.lock().as_ref().and_then(Weak::upgrade);
                let accepted = match handler {
                    Some(handler) => handler.handle_tcp_message(socket, data),
                    None => false,
                };
                if accepted {
                    let mut inner = socket.inner.lock();
                    inner.acknowledgement_number =
                        inner.acknowledgement_number.wrapping_add(data.len() as u32);
                    let _ = self.send_segment(&mut inner, &[], ACK);
                } else {
                    reset = true;
                }
            }

            if reset {
                let mut inner = socket.inner.lock();
                let _ = self.send_segment(&mut inner, &[], RST);
            }

            if socket.inner.lock().state == TcpState::Closed {
                self.remove(socket);
            }
        } else if flags & RST == 0 {
            // No socket wants this segment: answer with a one-shot RST
            // from an inverted four-tuple.
            let mut ephemeral = TcpSocketInner {
                local_ip: dst_ip_be,
                remote_ip: src_ip_be,
                local_port: dst_port,
                remote_port: src_port,
                sequence_number: ack_number,
                acknowledgement_number: seq.wrapping_add(1),
                state: TcpState::Closed,
            };
            let _ = self.send_segment(&mut ephemeral, &[], RST);
        }

        false
    }
}
