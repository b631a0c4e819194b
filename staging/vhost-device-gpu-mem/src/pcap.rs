// Control queue packet capture
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Classic pcap writer for device requests and replies. Files open in
//! Wireshark under the `USER0` link type; every record starts with a 32-bit
//! packet type followed by the raw message bytes.

use std::{
    io::{self, Write},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::trace;
use vm_memory::{ByteValued, Le16, Le32};

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
pub const PCAP_SNAPLEN: u32 = 64 * 1024;
// LINKTYPE_USER0
const PCAP_LINKTYPE: u32 = 147;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    Reset = 1,
    Request = 2,
    Reply = 3,
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
struct PcapHeader {
    magic: Le32,
    version_major: Le16,
    version_minor: Le16,
    thiszone: Le32,
    sigfigs: Le32,
    snaplen: Le32,
    network: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for PcapHeader {}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
struct PcapRecord {
    ts_sec: Le32,
    ts_usec: Le32,
    incl_len: Le32,
    orig_len: Le32,
    packet_type: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for PcapRecord {}

/// Writes a pcap stream into `W`, flushing after every write.
#[derive(Debug)]
pub struct PcapWriter<W: Write> {
    out: W,
}

impl<W: Write> PcapWriter<W> {
    /// Writes the global header.
    pub fn new(mut out: W) -> io::Result<Self> {
        let header = PcapHeader {
            magic: PCAP_MAGIC.into(),
            version_major: PCAP_VERSION_MAJOR.into(),
            version_minor: PCAP_VERSION_MINOR.into(),
            thiszone: 0.into(),
            sigfigs: 0.into(),
            snaplen: PCAP_SNAPLEN.into(),
            network: PCAP_LINKTYPE.into(),
        };
        out.write_all(header.as_slice())?;
        out.flush()?;
        Ok(Self { out })
    }

    pub fn reset(&mut self) -> io::Result<()> {
        self.packet(PacketType::Reset, &[])
    }

    pub fn request(&mut self, data: &[u8]) -> io::Result<()> {
        self.packet(PacketType::Request, data)
    }

    pub fn reply(&mut self, data: &[u8]) -> io::Result<()> {
        self.packet(PacketType::Reply, data)
    }

    fn packet(&mut self, packet_type: PacketType, data: &[u8]) -> io::Result<()> {
        let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(dur) => dur,
            Err(err) => err.duration(),
        };
        self.packet_at(now, packet_type, data)
    }

    /// Appends one record. Payloads are truncated to the snapshot length.
    pub fn packet_at(
        &mut self,
        timestamp: Duration,
        packet_type: PacketType,
        data: &[u8],
    ) -> io::Result<()> {
        let orig_len = data.len().saturating_add(4);
        let incl_len = orig_len.min(PCAP_SNAPLEN as usize);
        let record = PcapRecord {
            ts_sec: (timestamp.as_secs() as u32).into(),
            ts_usec: timestamp.subsec_micros().into(),
            incl_len: (incl_len as u32).into(),
            orig_len: u32::try_from(orig_len).unwrap_or(u32::MAX).into(),
            packet_type: (packet_type as u32).into(),
        };
        trace!("pcap {packet_type:?}: {} bytes", data.len());

        self.out.write_all(record.as_slice())?;
        self.out.write_all(&data[..incl_len - 4])?;
        self.out.flush()
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Read};

    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    fn le32(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_header() {
        let writer = PcapWriter::new(Vec::new()).unwrap();
        let out = writer.into_inner();
        assert_eq!(
            out,
            [
                0xd4, 0xc3, 0xb2, 0xa1, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x93, 0x00, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn test_records() {
        let mut writer = PcapWriter::new(Vec::new()).unwrap();
        let ts = Duration::new(1_700_000_000, 123_456_789);
        writer.packet_at(ts, PacketType::Reset, &[]).unwrap();
        writer
            .packet_at(ts, PacketType::Request, &[0xaa, 0xbb, 0xcc])
            .unwrap();

        let out = writer.into_inner();
        let reset = &out[24..44];
        assert_eq!(le32(reset, 0), 1_700_000_000);
        assert_eq!(le32(reset, 4), 123_456);
        assert_eq!(le32(reset, 8), 4);
        assert_eq!(le32(reset, 12), 4);
        assert_eq!(le32(reset, 16), PacketType::Reset as u32);

        let request = &out[44..];
        assert_eq!(request.len(), 20 + 3);
        assert_eq!(le32(request, 8), 7);
        assert_eq!(le32(request, 12), 7);
        assert_eq!(le32(request, 16), 2);
        assert_eq!(&request[20..], &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_truncated_payload() {
        let mut writer = PcapWriter::new(Vec::new()).unwrap();
        let data = vec![0x5a; PCAP_SNAPLEN as usize + 100];
        writer
            .packet_at(Duration::ZERO, PacketType::Reply, &data)
            .unwrap();

        let record = &writer.get_ref()[24..];
        assert_eq!(le32(record, 8), PCAP_SNAPLEN);
        assert_eq!(le32(record, 12), PCAP_SNAPLEN + 104);
        assert_eq!(le32(record, 16), 3);
        assert_eq!(record.len(), 16 + PCAP_SNAPLEN as usize);
    }

    #[test]
    fn test_file_is_flushed() {
        let file = TempFile::new().unwrap();
        let mut writer = PcapWriter::new(file.as_file().try_clone().unwrap()).unwrap();
        writer.reset().unwrap();
        writer.request(&[1, 2, 3, 4]).unwrap();
        writer.reply(&[5, 6]).unwrap();

        let mut contents = Vec::new();
        File::open(file.as_path())
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents.len(), 24 + 20 + (20 + 4) + (20 + 2));
        assert_eq!(le32(&contents, 0), PCAP_MAGIC);
        assert_eq!(le32(&contents, 20), PCAP_LINKTYPE);
        assert_eq!(&contents[contents.len() - 2..], &[5, 6]);
    }
}
