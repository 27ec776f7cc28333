use std::ffi::OsStr;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Largest socket-address image a key can carry (a full `sockaddr_un`)
pub const MAX_ADDR_LEN: usize = std::mem::size_of::<libc::sockaddr_un>();

/// Offset of `sun_path` inside `sockaddr_un`
const SUN_PATH_OFFSET: usize = std::mem::offset_of!(libc::sockaddr_un, sun_path);

/// Capacity of `sun_path`, including the terminating NUL of a pathname address
pub const SUN_PATH_LEN: usize = MAX_ADDR_LEN - SUN_PATH_OFFSET;

const HASH_SEED: u32 = 5381;

/// Address family of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4 (`AF_INET`)
    Inet,
    /// IPv6 (`AF_INET6`)
    Inet6,
    /// Local domain (`AF_UNIX`)
    Local,
}

impl Family {
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Family::Inet => libc::AF_INET,
            Family::Inet6 => libc::AF_INET6,
            Family::Local => libc::AF_UNIX,
        }
    }

    /// Returns true for the families that get `SO_REUSEADDR` before bind
    pub fn is_inet(self) -> bool {
        matches!(self, Family::Inet | Family::Inet6)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Family::Inet => "inet",
            Family::Inet6 => "inet6",
            Family::Local => "unix",
        })
    }
}

/// Socket type of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    Stream,
    Datagram,
    SeqPacket,
}

impl SocketType {
    pub fn as_raw(self) -> libc::c_int {
        match self {
            SocketType::Stream => libc::SOCK_STREAM,
            SocketType::Datagram => libc::SOCK_DGRAM,
            SocketType::SeqPacket => libc::SOCK_SEQPACKET,
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SocketType::Stream => "stream",
            SocketType::Datagram => "dgram",
            SocketType::SeqPacket => "seqpacket",
        })
    }
}

/// Canonical identity of a reserved address
///
/// The address is kept as the exact socket-address image passed to `bind(2)`,
/// so two keys are equal only when family, socket type, protocol and every
/// address byte match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressKey {
    family: Family,
    socket_type: SocketType,
    protocol: libc::c_int,
    addr: Box<[u8]>,
}

impl AddressKey {
    /// Builds a key for an inet or inet6 socket address
    pub fn from_socket_addr(
        socket_type: SocketType,
        protocol: libc::c_int,
        addr: SocketAddr,
    ) -> Self {
        let (family, image) = match addr {
            SocketAddr::V4(v4) => (Family::Inet, inet_image(&v4)),
            SocketAddr::V6(v6) => (Family::Inet6, inet6_image(&v6)),
        };
        Self {
            family,
            socket_type,
            protocol,
            addr: image.into_boxed_slice(),
        }
    }

    /// Builds a key for a local-domain pathname address
    ///
    /// Returns `None` if the path does not fit in `sun_path`.
    pub fn local_path(socket_type: SocketType, path: &Path) -> Option<Self> {
        let bytes = path.as_os_str().as_bytes();
        if bytes.is_empty() || bytes.len() >= SUN_PATH_LEN || bytes.contains(&0) {
            return None;
        }
        let mut image = local_header(bytes.len() + 1);
        image.extend_from_slice(bytes);
        image.push(0);
        Some(Self::local(socket_type, image))
    }

    /// Builds a key for a Linux abstract-namespace local address
    pub fn local_abstract(socket_type: SocketType, name: &[u8]) -> Option<Self> {
        if name.len() >= SUN_PATH_LEN {
            return None;
        }
        let mut image = local_header(name.len() + 1);
        image.push(0);
        image.extend_from_slice(name);
        Some(Self::local(socket_type, image))
    }

    fn local(socket_type: SocketType, image: Vec<u8>) -> Self {
        Self {
            family: Family::Local,
            socket_type,
            protocol: 0,
            addr: image.into_boxed_slice(),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn protocol(&self) -> libc::c_int {
        self.protocol
    }

    /// Raw socket-address image
    pub fn as_bytes(&self) -> &[u8] {
        &self.addr
    }

    /// Bucket hash over the address bytes only
    pub fn bucket_hash(&self) -> u32 {
        hash_address(&self.addr)
    }

    /// Compares the key against the parts of a stored entry
    pub(crate) fn matches(
        &self,
        family: Family,
        socket_type: SocketType,
        protocol: libc::c_int,
        addr: &[u8],
    ) -> bool {
        *self.addr == *addr
            && self.family == family
            && self.socket_type == socket_type
            && self.protocol == protocol
    }

    /// Rebuilds a key from the parts of a stored entry
    pub(crate) fn from_parts(
        family: Family,
        socket_type: SocketType,
        protocol: libc::c_int,
        addr: &[u8],
    ) -> Self {
        Self {
            family,
            socket_type,
            protocol,
            addr: addr.into(),
        }
    }

    /// Decodes the address as an inet socket address
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let bytes = &self.addr;
        let port = u16::from_be_bytes([*bytes.get(2)?, *bytes.get(3)?]);
        match self.family {
            Family::Inet => {
                let octets: [u8; 4] = bytes.get(4..8)?.try_into().ok()?;
                Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
            }
            Family::Inet6 => {
                let octets: [u8; 16] = bytes.get(8..24)?.try_into().ok()?;
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    0,
                    0,
                )))
            }
            Family::Local => None,
        }
    }

    /// Filesystem path of a local pathname address (abstract names have none)
    pub fn path(&self) -> Option<&Path> {
        if self.family != Family::Local {
            return None;
        }
        let raw = self.addr.get(SUN_PATH_OFFSET..)?;
        match raw.first() {
            None | Some(0) => None,
            Some(_) => {
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                Some(Path::new(OsStr::from_bytes(&raw[..end])))
            }
        }
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} ", self.family, self.socket_type, self.protocol)?;
        if let Some(addr) = self.socket_addr() {
            return write!(f, "{addr}");
        }
        if let Some(path) = self.path() {
            return write!(f, "{}", path.display());
        }
        let name = self.addr.get(SUN_PATH_OFFSET + 1..).unwrap_or_default();
        write!(f, "@{}", String::from_utf8_lossy(name))
    }
}

/// djb hash: `h = h * 33 ^ byte`, seeded with 5381
pub fn hash_address(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(HASH_SEED, |h, &b| h.wrapping_mul(33) ^ u32::from(b))
}

fn local_header(path_len: usize) -> Vec<u8> {
    let mut image = Vec::with_capacity(SUN_PATH_OFFSET + path_len);
    image.extend_from_slice(&(libc::AF_UNIX as libc::sa_family_t).to_ne_bytes());
    image
}

fn inet_image(addr: &SocketAddrV4) -> Vec<u8> {
    // Safety: sockaddr_in is plain old data; zeroing also clears sin_zero
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    struct_bytes(&sin)
}

fn inet6_image(addr: &SocketAddrV6) -> Vec<u8> {
    // Safety: sockaddr_in6 is plain old data
    let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sin6.sin6_port = addr.port().to_be();
    sin6.sin6_flowinfo = addr.flowinfo();
    sin6.sin6_addr = libc::in6_addr {
        s6_addr: addr.ip().octets(),
    };
    sin6.sin6_scope_id = addr.scope_id();
    struct_bytes(&sin6)
}

fn struct_bytes<T>(value: &T) -> Vec<u8> {
    // Safety: reads size_of::<T>() initialized bytes of a zero-initialized value
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
    .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_hash_seed_and_mixing() {
        assert_eq!(hash_address(&[]), 5381);
        assert_eq!(hash_address(&[1]), 5381u32.wrapping_mul(33) ^ 1);
        assert_eq!(
            hash_address(&[1, 2]),
            (5381u32.wrapping_mul(33) ^ 1).wrapping_mul(33) ^ 2
        );
    }

    #[test]
    fn test_hash_ignores_type_and_protocol() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let tcp = AddressKey::from_socket_addr(SocketType::Stream, libc::IPPROTO_TCP, addr);
        let udp = AddressKey::from_socket_addr(SocketType::Datagram, libc::IPPROTO_UDP, addr);
        assert_eq!(tcp.bucket_hash(), udp.bucket_hash());
        assert_ne!(tcp, udp);
    }

    #[test]
    fn test_inet_round_trip() {
        let addr: SocketAddr = "10.1.2.3:443".parse().unwrap();
        let key = AddressKey::from_socket_addr(SocketType::Stream, libc::IPPROTO_TCP, addr);
        assert_eq!(key.family(), Family::Inet);
        assert_eq!(key.as_bytes().len(), std::mem::size_of::<libc::sockaddr_in>());
        assert_eq!(key.socket_addr(), Some(addr));
        assert!(key.path().is_none());
    }

    #[test]
    fn test_inet6_round_trip() {
        let addr: SocketAddr = "[::1]:53".parse().unwrap();
        let key = AddressKey::from_socket_addr(SocketType::Datagram, libc::IPPROTO_UDP, addr);
        assert_eq!(key.family(), Family::Inet6);
        assert_eq!(key.as_bytes().len(), 28);
        assert_eq!(key.socket_addr(), Some(addr));
    }

    #[test]
    fn test_local_path() {
        let path = PathBuf::from("/run/reservd/a.sock");
        let key = AddressKey::local_path(SocketType::Stream, &path).unwrap();
        assert_eq!(key.family(), Family::Local);
        assert_eq!(key.path(), Some(path.as_path()));
        assert_eq!(key.as_bytes().last(), Some(&0));
        assert_eq!(key.to_string(), "unix stream 0 /run/reservd/a.sock");
    }

    #[test]
    fn test_local_path_too_long() {
        let long = "/".repeat(SUN_PATH_LEN);
        assert!(AddressKey::local_path(SocketType::Stream, Path::new(&long)).is_none());
        let fits = "/".repeat(SUN_PATH_LEN - 1);
        assert!(AddressKey::local_path(SocketType::Stream, Path::new(&fits)).is_some());
    }

    #[test]
    fn test_abstract_differs_from_path() {
        let abs = AddressKey::local_abstract(SocketType::Stream, b"name").unwrap();
        let path = AddressKey::local_path(SocketType::Stream, Path::new("/name")).unwrap();
        assert_ne!(abs, path);
        assert!(abs.path().is_none());
        assert_eq!(abs.to_string(), "unix stream 0 @name");
    }

    #[test]
    fn test_different_lengths_never_equal() {
        let a = AddressKey::local_path(SocketType::Stream, Path::new("/a")).unwrap();
        let ab = AddressKey::local_path(SocketType::Stream, Path::new("/ab")).unwrap();
        assert_ne!(a, ab);
        assert!(!a.matches(Family::Local, SocketType::Stream, 0, ab.as_bytes()));
        assert!(a.matches(Family::Local, SocketType::Stream, 0, a.as_bytes()));
    }
}
