use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr, UdpSocket},
};

use log::{debug, warn};

const HEADER_LEN: usize = 12;
const MAX_PACKET: usize = 512;
const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;
const ANSWER_TTL_SECS: u32 = 60;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;
const FLAG_RECURSION_AVAILABLE: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;

/// Wildcard resolver for the provisioning network: every A query resolves to
/// the portal address so clients land on the credential form.
pub struct CaptiveDns {
    socket: UdpSocket,
    answer: Ipv4Addr,
}

impl CaptiveDns {
    pub fn bind(answer: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket, answer })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Drains queued queries without blocking; returns how many were answered.
    pub fn service(&mut self) -> usize {
        let mut buffer = [0_u8; MAX_PACKET];
        let mut answered = 0;

        loop {
            match self.socket.recv_from(&mut buffer) {
                Ok((len, peer)) => {
                    let Some(response) = build_response(&buffer[..len], self.answer) else {
                        debug!("ignoring malformed DNS packet from {peer}");
                        continue;
                    };
                    match self.socket.send_to(&response, peer) {
                        Ok(_) => answered += 1,
                        Err(err) => warn!("captive DNS reply to {peer} failed: {err}"),
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("captive DNS receive failed: {err}");
                    break;
                }
            }
        }

        answered
    }
}

/// Builds the reply for a standard query. Only the first question is echoed;
/// A/ANY questions in class IN get `answer`, everything else an empty reply.
pub fn build_response(query: &[u8], answer: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }

    let flags = u16::from_be_bytes([query[2], query[3]]);
    if flags & FLAG_RESPONSE != 0 || flags & OPCODE_MASK != 0 {
        return None;
    }
    if u16::from_be_bytes([query[4], query[5]]) == 0 {
        return None;
    }

    let mut offset = HEADER_LEN;
    loop {
        let label_len = usize::from(*query.get(offset)?);
        offset += 1;
        if label_len == 0 {
            break;
        }
        // Compression pointers never appear in a question we need to echo.
        if label_len & 0xC0 != 0 {
            return None;
        }
        offset += label_len;
    }

    let fixed = query.get(offset..offset + 4)?;
    let qtype = u16::from_be_bytes([fixed[0], fixed[1]]);
    let qclass = u16::from_be_bytes([fixed[2], fixed[3]]);
    let question = &query[HEADER_LEN..offset + 4];
    let answers: u16 = if matches!(qtype, TYPE_A | TYPE_ANY) && qclass == CLASS_IN {
        1
    } else {
        0
    };

    let response_flags = FLAG_RESPONSE
        | FLAG_AUTHORITATIVE
        | (flags & FLAG_RECURSION_DESIRED)
        | FLAG_RECURSION_AVAILABLE;

    let mut response = Vec::with_capacity(HEADER_LEN + question.len() + 16);
    response.extend_from_slice(&query[0..2]);
    response.extend_from_slice(&response_flags.to_be_bytes());
    response.extend_from_slice(&1_u16.to_be_bytes());
    response.extend_from_slice(&answers.to_be_bytes());
    response.extend_from_slice(&[0, 0, 0, 0]);
    response.extend_from_slice(question);

    if answers == 1 {
        // Name is a pointer back to the question at offset 12.
        response.extend_from_slice(&[0xC0, 0x0C]);
        response.extend_from_slice(&TYPE_A.to_be_bytes());
        response.extend_from_slice(&CLASS_IN.to_be_bytes());
        response.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
        response.extend_from_slice(&4_u16.to_be_bytes());
        response.extend_from_slice(&answer.octets());
    }

    Some(response)
}
