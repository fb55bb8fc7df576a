use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

/// Parameters for one connection attempt.
///
/// `endpoint` is an IP literal for sockets or a port name for serial
/// lines; `number` is the port number or the baud rate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub endpoint: String,
    pub number: u32,
    #[serde(default)]
    pub extra: TransportExtra,
}

impl ConnectionParams {
    pub fn new(endpoint: impl Into<String>, number: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            number,
            extra: TransportExtra::None,
        }
    }

    pub fn with_extra(mut self, extra: TransportExtra) -> Self {
        self.extra = extra;
        self
    }

    /// Port number in `[1, 65535]`.
    pub fn port(&self) -> Result<u16, LinkError> {
        match u16::try_from(self.number) {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(LinkError::InvalidParams(format!(
                "port {} outside 1..=65535",
                self.number
            ))),
        }
    }

    /// `endpoint:number` as a socket address; the endpoint must be an IP
    /// literal.
    pub fn socket_addr(&self) -> Result<SocketAddr, LinkError> {
        let port = self.port()?;
        let ip: IpAddr = self.endpoint.trim().parse().map_err(|_| {
            LinkError::InvalidParams(format!("malformed address {:?}", self.endpoint))
        })?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Like [`socket_addr`](Self::socket_addr), but an empty or `*`
    /// endpoint means "any IPv4 interface".
    pub fn socket_addr_or_wildcard(&self) -> Result<(SocketAddr, bool), LinkError> {
        match self.endpoint.trim() {
            "" | "*" => Ok((
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port()?),
                true,
            )),
            _ => self.socket_addr().map(|addr| (addr, false)),
        }
    }
}

impl std::fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.number)
    }
}

/// Transport-specific settings carried alongside the parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportExtra {
    #[default]
    None,
    Serial(SerialOptions),
}

/// Serial line framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialOptions {
    /// 5, 6, 7 or 8.
    pub data_bits: u8,
    pub parity: SerialParity,
    /// 1 or 2.
    pub stop_bits: u8,
    pub hardware_flow_control: bool,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
            hardware_flow_control: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    #[default]
    None,
    Odd,
    Even,
}
