//! DNS wire format: header, question/name encoding with compression, and answer-section parsing.
//!
//! Grounded on the source's `make_dns_header`/`format_dns_name`/`dns_parse_rr` (`src/dns.c`) for
//! which fields exist and where, and on `dandyvica-dnsquery`'s `rfc1035.rs` for the general
//! shape of a from-scratch RFC1035 parser (`QType`/`QClass`, pointer-compressed name decoding).
//!
//! Two source bugs are deliberately not reproduced: `make_txt_req`/`make_mx_req` both used
//! `QTYPE=A` regardless of the requested record type, and `format_dns_name` read a potentially
//! uninitialized `label_len` on the very first label. This codec always encodes the QTYPE the
//! caller asked for and always derives each label's length from the slice being written.

use std::convert::TryFrom;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::Error;

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;
/// Offsets beyond this don't fit in a 14-bit compression pointer.
const MAX_COMPRESSIBLE_OFFSET: usize = 0x3FFF;
/// Bails out of name decompression rather than following a pointer cycle forever.
const MAX_POINTER_JUMPS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QType {
    A,
    Ptr,
    Mx,
    Txt,
}

impl QType {
    fn code(self) -> u16 {
        match self {
            QType::A => 1,
            QType::Ptr => 12,
            QType::Mx => 15,
            QType::Txt => 16,
        }
    }
}

impl TryFrom<u16> for QType {
    type Error = Error;

    fn try_from(code: u16) -> Result<Self, Error> {
        match code {
            1 => Ok(QType::A),
            12 => Ok(QType::Ptr),
            15 => Ok(QType::Mx),
            16 => Ok(QType::Txt),
            _ => Err(Error::BadFormat),
        }
    }
}

const QCLASS_IN: u16 = 1;

/// A query this crate sent: enough of the request to both encode it and to verify a reply's
/// question section actually matches (source: `dns_request_reply_cmp`, reworked here as a direct
/// structural comparison instead of a byte-for-byte label-compression replay).
#[derive(Debug, Clone)]
pub struct Question {
    pub name: String,
    pub qtype: QType,
}

/// One answer-section record, narrowed to the RDATA shapes this resolver understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    A(Ipv4Addr),
    Ptr(String),
    Mx { preference: u16, exchange: String },
    /// One or more RFC 1035 `<character-string>`s packed into the RDATA, each length-prefixed.
    Txt(Vec<Vec<u8>>),
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub id: u16,
    pub rcode: u8,
    pub question: Question,
    pub answers: Vec<Record>,
}

/// Builds a query packet for `question`, tagging it with transaction id `id`. `RD` is always set
/// (the source only ever issues recursive queries).
pub fn build_query(id: u16, question: &Question) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + question.name.len() + 16);

    buf.extend_from_slice(&id.to_be_bytes());
    // QR=0 OPCODE=0 AA=0 TC=0 RD=1, RA=0 Z=0 RCODE=0
    buf.push(0x01);
    buf.push(0x00);
    buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    buf.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    buf.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    buf.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    let mut compression = std::collections::HashMap::new();
    encode_name(&mut buf, &question.name, &mut compression);

    buf.extend_from_slice(&question.qtype.code().to_be_bytes());
    buf.extend_from_slice(&QCLASS_IN.to_be_bytes());

    buf
}

/// Builds the dotted `d.c.b.a.in-addr.arpa` name for a PTR lookup of `addr` (source:
/// `make_ptr_req`).
pub fn ptr_name(addr: Ipv4Addr) -> String {
    let [a, b, c, d] = addr.octets();
    format!("{}.{}.{}.{}.in-addr.arpa", d, c, b, a)
}

fn encode_name(buf: &mut Vec<u8>, name: &str, compression: &mut std::collections::HashMap<String, u16>) {
    let labels: Vec<&str> = name
        .trim_end_matches('.')
        .split('.')
        .filter(|s| !s.is_empty())
        .collect();
    encode_labels(buf, &labels, compression);
}

fn encode_labels(buf: &mut Vec<u8>, labels: &[&str], compression: &mut std::collections::HashMap<String, u16>) {
    if labels.is_empty() {
        buf.push(0);
        return;
    }

    let suffix = labels.join(".").to_ascii_lowercase();
    if let Some(&offset) = compression.get(&suffix) {
        buf.extend_from_slice(&(0xC000u16 | offset).to_be_bytes());
        return;
    }

    if buf.len() <= MAX_COMPRESSIBLE_OFFSET {
        compression.insert(suffix, buf.len() as u16);
    }

    let label = &labels[0][..labels[0].len().min(MAX_LABEL_LEN)];
    buf.push(label.len() as u8);
    buf.extend_from_slice(label.as_bytes());

    encode_labels(buf, &labels[1..], compression);
}

/// Parses a reply datagram into its header, question and answer records, independent of any
/// in-flight request.
///
/// This only validates the packet's own structure (`Error::Truncated`/`Error::BadFormat`); it has
/// no access to the active-request map, so it cannot itself decide whether the reply's ID or
/// question section actually matches something outstanding. The caller (the resolver's read path,
/// `Resolver::on_socket_readable`) does that matching against its own map and constructs
/// [`Error::IdMismatch`]/[`Error::QuestionMismatch`] there, logging the mismatch as a possible
/// spoof attempt before dropping the reply.
pub fn parse_reply(packet: &[u8]) -> Result<Reply, Error> {
    if packet.len() < HEADER_LEN {
        return Err(Error::Truncated);
    }

    let id = BigEndian::read_u16(&packet[0..2]);
    let flags = BigEndian::read_u16(&packet[2..4]);
    let qr = (flags >> 15) & 0x1;
    let rcode = (flags & 0x0F) as u8;
    let qdcount = BigEndian::read_u16(&packet[4..6]);
    let ancount = BigEndian::read_u16(&packet[6..8]);

    if qr == 0 {
        return Err(Error::BadFormat);
    }
    if qdcount != 1 {
        return Err(Error::BadFormat);
    }

    let (qname, mut pos) = decode_name(packet, HEADER_LEN)?;
    if pos + 4 > packet.len() {
        return Err(Error::Truncated);
    }
    let qtype_code = BigEndian::read_u16(&packet[pos..pos + 2]);
    pos += 4; // qtype + qclass

    let qtype = QType::try_from(qtype_code)?;
    let question = Question { name: qname, qtype };

    if rcode != 0 {
        return Ok(Reply { id, rcode, question, answers: Vec::new() });
    }

    let mut answers = Vec::with_capacity(ancount as usize);
    for _ in 0..ancount {
        let (record, next) = parse_rr(packet, pos)?;
        if let Some(record) = record {
            answers.push(record);
        }
        pos = next;
    }

    Ok(Reply { id, rcode, question, answers })
}

fn parse_rr(packet: &[u8], pos: usize) -> Result<(Option<Record>, usize), Error> {
    let (_name, mut pos) = decode_name(packet, pos)?;

    if pos + 10 > packet.len() {
        return Err(Error::Truncated);
    }
    let rtype = BigEndian::read_u16(&packet[pos..pos + 2]);
    // skip class (2) + ttl (4)
    let rdlength = BigEndian::read_u16(&packet[pos + 8..pos + 10]) as usize;
    pos += 10;

    if pos + rdlength > packet.len() {
        return Err(Error::Truncated);
    }
    let rdata = &packet[pos..pos + rdlength];
    pos += rdlength;

    let record = match rtype {
        1 if rdlength == 4 => Some(Record::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))),
        12 => {
            let (name, _) = decode_name(packet, pos - rdlength)?;
            Some(Record::Ptr(name))
        }
        15 if rdlength >= 2 => {
            let preference = BigEndian::read_u16(&rdata[0..2]);
            let (exchange, _) = decode_name(packet, pos - rdlength + 2)?;
            Some(Record::Mx { preference, exchange })
        }
        16 => Some(Record::Txt(split_character_strings(rdata))),
        _ => None,
    };

    Ok((record, pos))
}

/// Splits a TXT RDATA blob into its length-prefixed `<character-string>`s. A string whose
/// declared length runs past what's left of the RDATA is truncated to what remains rather than
/// dropped, so a malformed trailing string doesn't erase the whole record.
fn split_character_strings(rdata: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < rdata.len() {
        let len = rdata[pos] as usize;
        pos += 1;
        let end = (pos + len).min(rdata.len());
        out.push(rdata[pos..end].to_vec());
        pos = end;
    }
    out
}

/// Decodes a (possibly pointer-compressed) name starting at `pos`, returning the name and the
/// offset immediately after it in `packet` (i.e. after a pointer if one was followed, not after
/// wherever the pointer led).
fn decode_name(packet: &[u8], mut pos: usize) -> Result<(String, usize), Error> {
    let mut labels = Vec::new();
    let mut end_pos = None;
    let mut jumps = 0;

    loop {
        if pos >= packet.len() {
            return Err(Error::Truncated);
        }
        let len = packet[pos];

        if len == 0 {
            pos += 1;
            if end_pos.is_none() {
                end_pos = Some(pos);
            }
            break;
        } else if len & 0xC0 == 0xC0 {
            if pos + 1 >= packet.len() {
                return Err(Error::Truncated);
            }
            let pointer = (((len as u16) & 0x3F) << 8) | packet[pos + 1] as u16;
            if end_pos.is_none() {
                end_pos = Some(pos + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(Error::BadFormat);
            }
            pos = pointer as usize;
        } else {
            let label_len = len as usize;
            if pos + 1 + label_len > packet.len() {
                return Err(Error::Truncated);
            }
            let label = &packet[pos + 1..pos + 1 + label_len];
            labels.push(String::from_utf8_lossy(label).into_owned());
            pos += 1 + label_len;
        }
    }

    Ok((labels.join("."), end_pos.expect("loop always sets end_pos before breaking")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_query_for_example_com() {
        let question = Question { name: "example.com".to_string(), qtype: QType::A };
        let packet = build_query(0x1234, &question);

        assert_eq!(&packet[0..2], &[0x12, 0x34]);
        assert_eq!(&packet[2..4], &[0x01, 0x00]);
        assert_eq!(&packet[4..6], &[0x00, 0x01]);

        let (name, pos) = decode_name(&packet, HEADER_LEN).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(BigEndian::read_u16(&packet[pos..pos + 2]), 1);
        assert_eq!(BigEndian::read_u16(&packet[pos + 2..pos + 4]), QCLASS_IN);
    }

    #[test]
    fn encodes_ptr_query_with_reversed_octets() {
        let name = ptr_name(Ipv4Addr::new(8, 8, 4, 4));
        assert_eq!(name, "4.4.8.8.in-addr.arpa");

        let question = Question { name, qtype: QType::Ptr };
        let packet = build_query(1, &question);
        let (decoded, pos) = decode_name(&packet, HEADER_LEN).unwrap();
        assert_eq!(decoded, "4.4.8.8.in-addr.arpa");
        assert_eq!(BigEndian::read_u16(&packet[pos..pos + 2]), 12);
    }

    #[test]
    fn mx_and_txt_queries_use_their_own_qtype_not_a() {
        let mx = build_query(1, &Question { name: "example.com".into(), qtype: QType::Mx });
        let (_, pos) = decode_name(&mx, HEADER_LEN).unwrap();
        assert_eq!(BigEndian::read_u16(&mx[pos..pos + 2]), 15);

        let txt = build_query(1, &Question { name: "example.com".into(), qtype: QType::Txt });
        let (_, pos) = decode_name(&txt, HEADER_LEN).unwrap();
        assert_eq!(BigEndian::read_u16(&txt[pos..pos + 2]), 16);
    }

    fn build_a_reply(id: u16, name: &str, ip: Ipv4Addr) -> Vec<u8> {
        let mut buf = build_query(id, &Question { name: name.to_string(), qtype: QType::A });
        // Flip QR bit on, leave the rest of flags alone.
        buf[2] |= 0x80;
        BigEndian::write_u16(&mut buf[6..8], 1); // ANCOUNT = 1

        // Answer: pointer back to the question name at offset HEADER_LEN, type A, class IN,
        // ttl=300, rdlength=4, rdata=ip.
        buf.extend_from_slice(&(0xC000u16 | HEADER_LEN as u16).to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // TYPE A
        buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
        buf.extend_from_slice(&300u32.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&ip.octets());

        buf
    }

    #[test]
    fn parses_a_record_reply_with_compressed_name() {
        let ip = Ipv4Addr::new(93, 184, 216, 34);
        let packet = build_a_reply(0xBEEF, "example.com", ip);

        let reply = parse_reply(&packet).unwrap();
        assert_eq!(reply.id, 0xBEEF);
        assert_eq!(reply.rcode, 0);
        assert_eq!(reply.question.name, "example.com");
        assert_eq!(reply.answers, vec![Record::A(ip)]);
    }

    #[test]
    fn rejects_truncated_packet() {
        let packet = [0u8; 4];
        assert!(matches!(parse_reply(&packet), Err(Error::Truncated)));
    }

    #[test]
    fn rejects_reply_with_qr_bit_unset() {
        let packet = build_query(1, &Question { name: "example.com".into(), qtype: QType::A });
        assert!(matches!(parse_reply(&packet), Err(Error::BadFormat)));
    }

    #[test]
    fn pointer_loop_is_rejected_instead_of_hanging() {
        let mut packet = vec![0u8; HEADER_LEN];
        packet[2] |= 0x80;
        // A name entirely at HEADER_LEN that points to itself.
        packet.extend_from_slice(&(0xC000u16 | HEADER_LEN as u16).to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&QCLASS_IN.to_be_bytes());

        assert!(matches!(decode_name(&packet, HEADER_LEN), Err(Error::BadFormat)));
    }

    #[test]
    fn splits_txt_rdata_into_character_strings() {
        let mut buf = build_query(1, &Question { name: "example.com".into(), qtype: QType::Txt });
        buf[2] |= 0x80;
        BigEndian::write_u16(&mut buf[6..8], 1);

        buf.extend_from_slice(&(0xC000u16 | HEADER_LEN as u16).to_be_bytes());
        buf.extend_from_slice(&16u16.to_be_bytes());
        buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
        buf.extend_from_slice(&300u32.to_be_bytes());

        let mut rdata = Vec::new();
        rdata.push(3u8);
        rdata.extend_from_slice(b"v=1");
        rdata.push(5u8);
        rdata.extend_from_slice(b"hello");
        buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&rdata);

        let reply = parse_reply(&buf).unwrap();
        assert_eq!(
            reply.answers,
            vec![Record::Txt(vec![b"v=1".to_vec(), b"hello".to_vec()])]
        );
    }
}
