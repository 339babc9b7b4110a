//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn to_octets(&self) -> Result<BytesMut, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer)?;
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in &self.questions {
            question.serialise(buffer);
        }
        for rr in &self.answers {
            rr.serialise(buffer)?;
        }
        for rr in &self.authority {
            rr.serialise(buffer)?;
        }
        for rr in &self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    /// # Errors
    ///
    /// If `reserved_z` is set: RFC 1035 section 4.1.1 requires the 3
    /// `Z` bits to be zero on every message this implementation sends,
    /// so there is no wire representation for a `Header` that claims
    /// otherwise.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        if self.reserved_z {
            return Err(Error::ReservedBitsSet);
        }

        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
        Ok(())
    }
}

impl Question {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer, true);
        self.qtype.serialise(buffer);
        self.qclass.serialise(buffer);
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long to fit the 16 bit RDLENGTH field.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer, true);
        self.rtype_with_data.rtype().serialise(buffer);
        self.rclass.serialise(buffer);
        buffer.write_u32(self.ttl);

        // filled in below, once we know how much RDATA we wrote
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match &self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            // NS and CNAME rdata names are the only rdata name fields this
            // implementation compresses; everything else is written out in full.
            RecordTypeWithData::NS { nsdname } => nsdname.serialise(buffer, true),
            RecordTypeWithData::CNAME { cname } => cname.serialise(buffer, true),
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.serialise(buffer, false);
                rname.serialise(buffer, false);
                buffer.write_u32(*serial);
                buffer.write_u32(*refresh);
                buffer.write_u32(*retry);
                buffer.write_u32(*expire);
                buffer.write_u32(*minimum);
            }
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise(buffer, false),
            RecordTypeWithData::HINFO { cpu, os } => {
                buffer.write_character_string(cpu);
                buffer.write_character_string(os);
            }
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(*preference);
                exchange.serialise(buffer, false);
            }
            RecordTypeWithData::TXT { octets } => buffer.write_octets(octets),
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(octets),
        };

        // -2 so we don't also include the 2 octets for the rdlength itself
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    /// Write this name to the buffer.  If `compress` is set, the
    /// longest suffix of this name already written to the buffer is
    /// replaced with a pointer, per RFC 1035 section 4.1.4: labels are
    /// written one at a time, most significant first, checking before
    /// each one whether the remaining suffix has already been
    /// written.
    pub fn serialise(&self, buffer: &mut WritableBuffer, compress: bool) {
        let mut start = 0;
        loop {
            let remaining = &self.labels[start..];
            if remaining.len() <= 1 {
                buffer.write_u8(0);
                return;
            }

            if let Some(suffix) = DomainName::from_labels(remaining.to_vec()) {
                if compress {
                    if let Some(ptr) = buffer.name_pointer(&suffix) {
                        buffer.write_u16(ptr);
                        return;
                    }
                    buffer.memoise_name(&suffix);
                }
            }

            let label = &remaining[0];
            buffer.write_u8(label.len().try_into().unwrap_or(LABEL_MAX_LEN as u8));
            buffer.write_octets(label);
            start += 1;
        }
    }
}

impl QueryType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl QueryClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },

    /// The header's reserved `Z` bits were set.
    ReservedBitsSet,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
            Error::ReservedBitsSet => write!(f, "header reserved Z bits must be zero"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes.
/// Tracks, for every domain name suffix written so far, the buffer
/// offset it starts at, so later names can point back to it instead
/// of repeating the labels.
pub struct WritableBuffer {
    pub octets: BytesMut,
    name_pointers: HashMap<DomainName, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: BytesMut::with_capacity(512),
            name_pointers: HashMap::new(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    /// Record the current buffer offset as the location of `name`,
    /// if it is not the root and not already known. Offsets beyond
    /// what a 14 bit pointer can address are silently skipped: those
    /// names just don't get compressed.
    pub fn memoise_name(&mut self, name: &DomainName) {
        if !name.is_root() && !self.name_pointers.contains_key(name) {
            if let Ok(index) = u16::try_from(self.index()) {
                if index <= 0b0011_1111_1111_1111 {
                    let [hi, lo] = index.to_be_bytes();
                    self.name_pointers
                        .insert(name.clone(), u16::from_be_bytes([hi | 0b1100_0000, lo]));
                }
            }
        }
    }

    pub fn name_pointer(&self, name: &DomainName) -> Option<u16> {
        self.name_pointers.get(name).copied()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.put_u8(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.put_slice(octets);
    }

    /// Write a `<character-string>`: a length octet followed by that
    /// many octets, truncated to fit if necessary.
    pub fn write_character_string(&mut self, octets: &[u8]) {
        let len = octets.len().min(255);
        self.write_u8(len as u8);
        self.write_octets(&octets[..len]);
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    if let Ok(t) = u16::try_from(counter) {
        Ok(t)
    } else {
        Err(Error::CounterTooLarge {
            counter,
            bits: u16::BITS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn test_sets_rdlength() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);

        let rr = ResourceRecord {
            name: domain("www.example.com."),
            rtype_with_data: RecordTypeWithData::MX {
                preference: 32,
                exchange: domain("mx.example.com."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        };
        let _ = rr.serialise(&mut buf);

        assert_eq!(
            &[
                1, 2, 3, 4,
                // NAME
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // TYPE
                0b0000_0000, 0b0000_1111, // MX
                // CLASS
                0b0000_0000, 0b0000_0001, // IN
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0b0000_0000, 0b0001_0010, // 18 octets
                // RDATA
                0, 32, // preference
                2, 109, 120, // "mx"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
            ][..],
            &buf.octets[..],
        );
    }

    #[test]
    fn test_name_compression_opt_in() {
        let mut buf = WritableBuffer::default();
        domain("www.example.com.").serialise(&mut buf, true);
        let written_once = buf.octets.len();
        domain("www.example.com.").serialise(&mut buf, true);
        assert_eq!(written_once + 2, buf.octets.len());
    }

    #[test]
    fn test_name_compression_opt_out() {
        let mut buf = WritableBuffer::default();
        domain("www.example.com.").serialise(&mut buf, false);
        let written_once = buf.octets.len();
        domain("www.example.com.").serialise(&mut buf, false);
        assert_eq!(written_once * 2, buf.octets.len());
    }

    #[test]
    fn test_name_compression_shares_suffix() {
        let mut buf = WritableBuffer::default();
        domain("www.example.com.").serialise(&mut buf, true);
        let written_once = buf.octets.len();
        // "mail.example.com." shares the "example.com." suffix, so
        // this should cost 5 octets ("mail" label + pointer) rather
        // than repeating "example.com." in full.
        domain("mail.example.com.").serialise(&mut buf, true);
        assert_eq!(written_once + 1 + 4 + 2, buf.octets.len());
    }

    #[test]
    fn test_name_compression_records() {
        let mut buf = WritableBuffer::default();
        let a = ResourceRecord {
            name: domain("example.com."),
            rtype_with_data: RecordTypeWithData::A {
                address: "127.0.0.1".parse().unwrap(),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        };
        let ns = ResourceRecord {
            name: domain("example.com."),
            rtype_with_data: RecordTypeWithData::NS {
                nsdname: domain("ns1.example.com."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        };
        a.serialise(&mut buf).unwrap();
        let after_a = buf.octets.len();
        ns.serialise(&mut buf).unwrap();
        // the owner name "example.com." is compressed, but the NSDNAME
        // inside the RDATA is not
        assert_eq!(
            after_a + 2 + 2 + 2 + 4 + 2 + 1 + 3 + 2,
            buf.octets.len()
        );
    }

    #[test]
    fn reserved_bits_set_refuses_to_encode() {
        let header = Header {
            id: 1,
            is_response: true,
            opcode: Opcode::Standard,
            is_authoritative: false,
            is_truncated: false,
            recursion_desired: false,
            recursion_available: true,
            reserved_z: true,
            rcode: Rcode::NoError,
        };
        let mut buf = WritableBuffer::default();
        assert_eq!(Err(Error::ReservedBitsSet), header.serialise(&mut buf));
    }
}
