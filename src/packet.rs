use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;
use crate::options::{DhcpOption, MessageType, OptionCode};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const MIN_FRAME_LEN: usize = 240;
const MIN_REPLY_LEN: usize = 300;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Request = 1,
    Reply = 2,
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Reply),
            other => Err(other),
        }
    }
}

/// An in-memory BOOTP frame with its DHCP options.
///
/// Multi-byte fields are big-endian on the wire and host-native here; the
/// conversions live entirely in [`Frame::decode`] and [`Frame::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub op: Op,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: HwAddr,
    pub options: Vec<DhcpOption>,
}

impl Frame {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_FRAME_LEN {
            return Err(Error::Malformed(format!(
                "Frame too short: {} bytes (minimum {})",
                data.len(),
                MIN_FRAME_LEN
            )));
        }

        let magic_cookie = &data[236..240];
        if magic_cookie != DHCP_MAGIC_COOKIE {
            return Err(Error::Malformed("Invalid magic cookie".to_string()));
        }

        let op = Op::try_from(data[0])
            .map_err(|value| Error::Malformed(format!("Invalid BOOTP op {}", value)))?;
        let htype = data[1];
        let hlen = data[2];
        let hops = data[3];

        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);

        let ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        // chaddr is 16 bytes on the wire; only the leading 6 carry the MAC.
        let chaddr = HwAddr::from_octets([
            data[28], data[29], data[30], data[31], data[32], data[33],
        ]);

        let options = Self::parse_options(&data[240..])?;

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            options,
        })
    }

    /// Parses the TLV option area. Missing End or a length that runs past
    /// the end of the datagram terminates the walk with what was gathered.
    fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>> {
        let mut options: Vec<DhcpOption> = Vec::new();
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                break;
            }

            if index + 1 >= data.len() {
                break;
            }

            let length = data[index + 1] as usize;

            if index + 2 + length > data.len() {
                break;
            }

            let option = DhcpOption::parse(code, &data[index + 2..index + 2 + length])?;
            match options.iter_mut().find(|existing| existing.code() == code) {
                Some(existing) => *existing = option,
                None => options.push(option),
            }

            index += 2 + length;
        }

        Ok(options)
    }

    /// Encodes the frame, padded with zeros to the 300-byte minimum.
    ///
    /// MessageType and ServerIdentifier are written ahead of the remaining
    /// options; a reply missing either is a programming error surfaced as
    /// [`Error::MissingRequiredOption`] so the caller can drop the frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let message_type = self
            .option(OptionCode::MessageType)
            .ok_or(Error::MissingRequiredOption(OptionCode::MessageType as u8))?;
        let server_identifier = self
            .option(OptionCode::ServerIdentifier)
            .ok_or(Error::MissingRequiredOption(
                OptionCode::ServerIdentifier as u8,
            ))?;

        let mut data = Vec::with_capacity(MIN_REPLY_LEN);

        data.push(self.op as u8);
        data.push(self.htype);
        data.push(self.hlen);
        data.push(self.hops);

        data.extend_from_slice(&self.xid.to_be_bytes());
        data.extend_from_slice(&self.secs.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());

        data.extend_from_slice(&self.ciaddr.octets());
        data.extend_from_slice(&self.yiaddr.octets());
        data.extend_from_slice(&self.siaddr.octets());
        data.extend_from_slice(&self.giaddr.octets());

        data.extend_from_slice(&self.chaddr.octets());
        data.extend_from_slice(&[0u8; 10]);

        // Unused sname and file fields.
        data.extend_from_slice(&[0u8; 64 + 128]);

        data.extend_from_slice(&DHCP_MAGIC_COOKIE);

        data.extend_from_slice(&message_type.encode());
        data.extend_from_slice(&server_identifier.encode());

        for option in &self.options {
            let code = option.code();
            if code == OptionCode::MessageType as u8 || code == OptionCode::ServerIdentifier as u8 {
                continue;
            }
            data.extend_from_slice(&option.encode());
        }

        data.push(OptionCode::End as u8);

        while data.len() < MIN_REPLY_LEN {
            data.push(0);
        }

        Ok(data)
    }

    pub fn option(&self, code: OptionCode) -> Option<&DhcpOption> {
        self.options
            .iter()
            .find(|option| option.code() == code as u8)
    }

    /// Inserts an option, replacing any existing option of the same code.
    pub fn set_option(&mut self, option: DhcpOption) {
        let code = option.code();
        match self.options.iter_mut().find(|existing| existing.code() == code) {
            Some(existing) => *existing = option,
            None => self.options.push(option),
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self.option(OptionCode::MessageType) {
            Some(DhcpOption::MessageType(msg_type)) => Some(*msg_type),
            _ => None,
        }
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        match self.option(OptionCode::RequestedIp) {
            Some(DhcpOption::RequestedIp(ip)) => Some(*ip),
            _ => None,
        }
    }

    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        match self.option(OptionCode::ParameterRequestList) {
            Some(DhcpOption::ParameterRequestList(params)) => Some(params),
            _ => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        (self.flags & 0x8000) != 0
    }
}
