use super::key::{AddressKey, Family, SocketType};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing one reservation line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("expected `<family> <socktype> <protocol> <address> [rebind]`, got {0} field(s)")]
    FieldCount(usize),

    #[error("unknown address family `{0}`")]
    Family(String),

    #[error("unknown socket type `{0}`")]
    SocketType(String),

    #[error("unknown protocol `{0}`")]
    Protocol(String),

    #[error("protocol `{protocol}` cannot be used with {socket_type} sockets")]
    ProtocolMismatch {
        protocol: String,
        socket_type: SocketType,
    },

    #[error("local-domain reservations take protocol 0, got `{0}`")]
    LocalProtocol(String),

    #[error("invalid {family} address `{input}`")]
    Address { family: Family, input: String },

    #[error("unknown flag `{0}`")]
    Flag(String),
}

/// One parsed reservation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    key: AddressKey,
    /// Caller wants a freshly bound handle instead of the held one
    pub force_rebind: bool,
}

impl AddressSpec {
    pub fn new(key: AddressKey) -> Self {
        Self {
            key,
            force_rebind: false,
        }
    }

    pub fn with_force_rebind(mut self, force_rebind: bool) -> Self {
        self.force_rebind = force_rebind;
        self
    }

    /// Canonical key of this spec
    pub fn key(&self) -> &AddressKey {
        &self.key
    }

    pub fn into_key(self) -> AddressKey {
        self.key
    }
}

impl FromStr for AddressSpec {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_line(s)
    }
}

/// Parses `<family> <socktype> <protocol> <address> [rebind]`
///
/// ```
/// use reservd::address::parse_line;
///
/// let spec = parse_line("inet stream tcp 127.0.0.1:8080").unwrap();
/// assert_eq!(spec.key().to_string(), "inet stream 6 127.0.0.1:8080");
/// assert!(!spec.force_rebind);
/// ```
pub fn parse_line(text: &str) -> Result<AddressSpec, AddressParseError> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    if !(4..=5).contains(&fields.len()) {
        return Err(AddressParseError::FieldCount(fields.len()));
    }

    let family = parse_family(fields[0])?;
    let socket_type = parse_socket_type(fields[1])?;
    let protocol = parse_protocol(fields[2], family, socket_type)?;

    let input = fields[3];
    let bad_address = || AddressParseError::Address {
        family,
        input: input.to_string(),
    };
    let key = match family {
        Family::Inet => {
            let addr = SocketAddrV4::from_str(input).map_err(|_| bad_address())?;
            AddressKey::from_socket_addr(socket_type, protocol, SocketAddr::V4(addr))
        }
        Family::Inet6 => {
            let addr = SocketAddrV6::from_str(input).map_err(|_| bad_address())?;
            AddressKey::from_socket_addr(socket_type, protocol, SocketAddr::V6(addr))
        }
        Family::Local => {
            let key = if let Some(name) = input.strip_prefix('@') {
                AddressKey::local_abstract(socket_type, name.as_bytes())
            } else if input.starts_with('/') {
                AddressKey::local_path(socket_type, Path::new(input))
            } else {
                None
            };
            key.ok_or_else(bad_address)?
        }
    };

    let force_rebind = match fields.get(4) {
        None => false,
        Some(&"rebind") => true,
        Some(other) => return Err(AddressParseError::Flag(other.to_string())),
    };

    Ok(AddressSpec::new(key).with_force_rebind(force_rebind))
}

fn parse_family(s: &str) -> Result<Family, AddressParseError> {
    match s.to_ascii_lowercase().as_str() {
        "inet" | "inet4" | "ipv4" | "af_inet" => Ok(Family::Inet),
        "inet6" | "ipv6" | "af_inet6" => Ok(Family::Inet6),
        "unix" | "local" | "af_unix" | "af_local" => Ok(Family::Local),
        _ => Err(AddressParseError::Family(s.to_string())),
    }
}

fn parse_socket_type(s: &str) -> Result<SocketType, AddressParseError> {
    match s.to_ascii_lowercase().as_str() {
        "stream" | "sock_stream" => Ok(SocketType::Stream),
        "dgram" | "datagram" | "sock_dgram" => Ok(SocketType::Datagram),
        "seqpacket" | "sock_seqpacket" => Ok(SocketType::SeqPacket),
        _ => Err(AddressParseError::SocketType(s.to_string())),
    }
}

fn parse_protocol(
    s: &str,
    family: Family,
    socket_type: SocketType,
) -> Result<libc::c_int, AddressParseError> {
    let protocol = match s.to_ascii_lowercase().as_str() {
        "0" | "default" => 0,
        "tcp" => libc::IPPROTO_TCP,
        "udp" => libc::IPPROTO_UDP,
        other => other
            .parse::<libc::c_int>()
            .ok()
            .filter(|p| *p >= 0)
            .ok_or_else(|| AddressParseError::Protocol(s.to_string()))?,
    };

    if family == Family::Local {
        if protocol != 0 {
            return Err(AddressParseError::LocalProtocol(s.to_string()));
        }
        return Ok(0);
    }

    let mismatch = (protocol == libc::IPPROTO_TCP && socket_type != SocketType::Stream)
        || (protocol == libc::IPPROTO_UDP && socket_type != SocketType::Datagram);
    if mismatch {
        return Err(AddressParseError::ProtocolMismatch {
            protocol: s.to_string(),
            socket_type,
        });
    }
    Ok(protocol)
}
