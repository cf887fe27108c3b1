use std::net::Ipv4Addr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Broadcast = 28,
    RequestedIp = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    RenewalTime = 58,
    RebindingTime = 59,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            28 => Ok(Self::Broadcast),
            50 => Ok(Self::RequestedIp),
            51 => Ok(Self::LeaseTime),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// A decoded DHCP option, discriminated by the semantic family of its key.
///
/// Unrecognised keys are preserved as opaque bytes so a frame survives a
/// decode/encode round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    Broadcast(Ipv4Addr),
    RequestedIp(Ipv4Addr),
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    RenewalTime(u32),
    RebindingTime(u32),
    Unknown(u8, Vec<u8>),
}

fn parse_ipv4(code: OptionCode, data: &[u8]) -> Result<Ipv4Addr> {
    if data.len() != 4 {
        return Err(Error::Malformed(format!(
            "Option {} must be 4 bytes, got {}",
            code as u8,
            data.len()
        )));
    }
    Ok(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
}

fn parse_ipv4_list(code: OptionCode, data: &[u8]) -> Result<Vec<Ipv4Addr>> {
    if data.len() % 4 != 0 || data.is_empty() {
        return Err(Error::Malformed(format!(
            "Option {} must be a multiple of 4 bytes, got {}",
            code as u8,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn parse_u32(code: OptionCode, data: &[u8]) -> Result<u32> {
    if data.len() != 4 {
        return Err(Error::Malformed(format!(
            "Option {} must be 4 bytes, got {}",
            code as u8,
            data.len()
        )));
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

impl DhcpOption {
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => {
                Ok(Self::SubnetMask(parse_ipv4(OptionCode::SubnetMask, data)?))
            }
            Ok(OptionCode::Router) => Ok(Self::Router(parse_ipv4_list(OptionCode::Router, data)?)),
            Ok(OptionCode::DnsServer) => Ok(Self::DnsServer(parse_ipv4_list(
                OptionCode::DnsServer,
                data,
            )?)),
            Ok(OptionCode::Broadcast) => {
                Ok(Self::Broadcast(parse_ipv4(OptionCode::Broadcast, data)?))
            }
            Ok(OptionCode::RequestedIp) => Ok(Self::RequestedIp(parse_ipv4(
                OptionCode::RequestedIp,
                data,
            )?)),
            Ok(OptionCode::LeaseTime) => {
                Ok(Self::LeaseTime(parse_u32(OptionCode::LeaseTime, data)?))
            }
            Ok(OptionCode::MessageType) => {
                if data.len() != 1 {
                    return Err(Error::Malformed(format!(
                        "Message type option must be 1 byte, got {}",
                        data.len()
                    )));
                }
                match MessageType::try_from(data[0]) {
                    Ok(msg_type) => Ok(Self::MessageType(msg_type)),
                    // Unrecognised message types stay opaque; the request
                    // engine ignores frames without a recognised type.
                    Err(_) => Ok(Self::Unknown(code, data.to_vec())),
                }
            }
            Ok(OptionCode::ServerIdentifier) => Ok(Self::ServerIdentifier(parse_ipv4(
                OptionCode::ServerIdentifier,
                data,
            )?)),
            Ok(OptionCode::ParameterRequestList) => Ok(Self::ParameterRequestList(data.to_vec())),
            Ok(OptionCode::RenewalTime) => {
                Ok(Self::RenewalTime(parse_u32(OptionCode::RenewalTime, data)?))
            }
            Ok(OptionCode::RebindingTime) => Ok(Self::RebindingTime(parse_u32(
                OptionCode::RebindingTime,
                data,
            )?)),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::Malformed(
                "Pad/End should not be parsed as options".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::Broadcast(_) => OptionCode::Broadcast as u8,
            Self::RequestedIp(_) => OptionCode::RequestedIp as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::RenewalTime(_) => OptionCode::RenewalTime as u8,
            Self::RebindingTime(_) => OptionCode::RebindingTime as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        fn ipv4(code: u8, addr: &Ipv4Addr) -> Vec<u8> {
            let mut result = vec![code, 4];
            result.extend_from_slice(&addr.octets());
            result
        }

        fn ipv4_list(code: u8, addrs: &[Ipv4Addr]) -> Vec<u8> {
            let mut result = vec![code, (addrs.len() * 4) as u8];
            for addr in addrs {
                result.extend_from_slice(&addr.octets());
            }
            result
        }

        fn u32_value(code: u8, value: u32) -> Vec<u8> {
            let mut result = vec![code, 4];
            result.extend_from_slice(&value.to_be_bytes());
            result
        }

        match self {
            Self::SubnetMask(addr) => ipv4(self.code(), addr),
            Self::Router(addrs) => ipv4_list(self.code(), addrs),
            Self::DnsServer(addrs) => ipv4_list(self.code(), addrs),
            Self::Broadcast(addr) => ipv4(self.code(), addr),
            Self::RequestedIp(addr) => ipv4(self.code(), addr),
            Self::LeaseTime(time) => u32_value(self.code(), *time),
            Self::MessageType(msg_type) => {
                vec![self.code(), 1, *msg_type as u8]
            }
            Self::ServerIdentifier(addr) => ipv4(self.code(), addr),
            Self::ParameterRequestList(params) => {
                let mut result = vec![self.code(), params.len() as u8];
                result.extend_from_slice(params);
                result
            }
            Self::RenewalTime(time) => u32_value(self.code(), *time),
            Self::RebindingTime(time) => u32_value(self.code(), *time),
            Self::Unknown(code, data) => {
                let mut result = vec![*code, data.len() as u8];
                result.extend_from_slice(data);
                result
            }
        }
    }
}
