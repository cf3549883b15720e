//! Demo workloads wired up by the kernel binary.
//!
//! A tiny HTTP responder on TCP and a console printer for UDP. These
//! exist to exercise the stack end to end; they are not a web server.

use crate::net::tcp::{TcpHandler, TcpSocket};
use crate::net::udp::{UdpHandler, UdpSocket};
use crate::print;
use alloc::sync::Arc;

/// Page served for `GET /`: exactly 184 bytes on the wire.
pub const HTTP_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Server: OpalOS\r\n\
Content-Type: text/html\r\n\r\n\
<html><head><title>OpalOS</title></head>\
<body><b>OpalOS</b> is up and serving this page from protected mode.</body></html>\r\n";

/// Prints whatever arrives and answers `GET /` with [`HTTP_RESPONSE`],
/// then closes the connection.
pub struct HttpHandler;

impl TcpHandler for HttpHandler {
    fn handle_tcp_message(&self, socket: &Arc<TcpSocket>, data: &[u8]) -> bool {
        for &byte in data {
            print!("{}", byte as char);
        }

        if data.starts_with(b"GET / HTTP") {
            socket.send(HTTP_RESPONSE).ok();
            socket.disconnect();
        }
        true
    }
}

/// Prints incoming datagrams byte by byte.
pub struct UdpPrintHandler;

impl UdpHandler for UdpPrintHandler {
    fn handle_udp_message(&self, _socket: &Arc<UdpSocket>, data: &[u8]) {
        for &byte in data {
            print!("{}", byte as char);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ethernet::ETHERTYPE_IPV4;
    use crate::net::tcp::{Tcp, TcpState, ACK, FIN, PSH, SYN};
    use crate::net::testing::{build_test_stack, ether_frame, ipv4_packet, TestStack};
    use crate::net::Ipv4Address;
    use alloc::vec::Vec;

    #[test_case]
    fn response_is_the_canonical_184_bytes() {
        assert_eq!(HTTP_RESPONSE.len(), 184);
        assert!(HTTP_RESPONSE.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(HTTP_RESPONSE.ends_with(b"</html>\r\n"));
    }

    fn tcp_segment(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8, data: &[u8]) -> Vec<u8> {
        let mut segment = Vec::new();
        segment.extend_from_slice(&src_port.to_be_bytes());
        segment.extend_from_slice(&dst_port.to_be_bytes());
        segment.extend_from_slice(&seq.to_be_bytes());
        segment.extend_from_slice(&ack.to_be_bytes());
        segment.push(5 << 4);
        segment.push(flags);
        segment.extend_from_slice(&0xFFFFu16.to_be_bytes());
        segment.extend_from_slice(&[0, 0]);
        segment.extend_from_slice(&[0, 0]);
        segment.extend_from_slice(data);
        segment
    }

    fn inject(stack: &TestStack, peer: Ipv4Address, segment: &[u8]) {
        use crate::net::device::{NicDevice, RawDataHandler};
        let packet = ipv4_packet(peer, stack.nic.ip_address(), 0x06, segment);
        let mut frame = ether_frame(
            *stack.nic.mac_address().bytes(),
            stack.peer_mac,
            ETHERTYPE_IPV4,
            &packet,
        );
        stack.eth.on_raw_data(&mut frame);
    }

    #[test_case]
    fn get_request_is_answered_then_closed() {
        let stack = build_test_stack();
        let tcp = Tcp::attach(stack.ip.clone());
        let handler: Arc<dyn TcpHandler> = Arc::new(HttpHandler);
        let socket = tcp.listen(1234).unwrap();
        socket.bind(&handler);

        let peer = Ipv4Address::new(10, 0, 2, 2);
        inject(&stack, peer, &tcp_segment(4000, 1234, 0x1000, 0, SYN, &[]));
        inject(
            &stack,
            peer,
            &tcp_segment(4000, 1234, 0x1001, 0xBEEF_CAFF, ACK, &[]),
        );
        assert_eq!(socket.state(), TcpState::Established);

        let sent_before = stack.nic.sent_count();
        inject(
            &stack,
            peer,
            &tcp_segment(4000, 1234, 0x1001, 0xBEEF_CAFF, PSH | ACK, b"GET / HTTP/1.1\r\n\r\n"),
        );

        // The handler answers, tears the connection down, and the
        // provider acknowledges the request data.
        assert_eq!(stack.nic.sent_count(), sent_before + 3);
        let frames = stack.nic.sent_frames();

        let response = &frames[frames.len() - 3][34..];
        assert_eq!(response[13], PSH | ACK);
        assert_eq!(&response[20..], HTTP_RESPONSE);

        let teardown = &frames[frames.len() - 2][34..];
        assert_eq!(teardown[13], FIN | ACK);
        assert_eq!(socket.state(), TcpState::FinWait1);
    }
}
