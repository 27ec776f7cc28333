// Kernel queries on reserved descriptors
//
// A reserved socket is identified by its AddressKey, but what the kernel
// actually holds is only visible through getsockopt(SO_TYPE) and
// getsockname(). These helpers back the introspection methods on
// ReservedSocket and the sanity checks in the tests.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd};

/// Query the socket type of a descriptor with `getsockopt(SO_TYPE)`
pub fn socket_type(fd: BorrowedFd<'_>) -> io::Result<libc::c_int> {
    let mut socket_type: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

    // Safety: the buffer is a c_int and len matches its size
    let result = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut socket_type as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(socket_type)
}

/// Query the address family a descriptor is bound with via `getsockname()`
pub fn bound_family(fd: BorrowedFd<'_>) -> io::Result<libc::c_int> {
    // Storage for any socket address type (IPv4, IPv6, Unix)
    // Safety: sockaddr_storage is plain old data
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    // Safety: addr is large enough for any address and len says so
    let result = unsafe {
        libc::getsockname(
            fd.as_raw_fd(),
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };

    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(addr.ss_family as libc::c_int)
}

/// Human readable family name for diagnostics
pub fn family_name(family: libc::c_int) -> &'static str {
    match family {
        libc::AF_INET => "AF_INET (IPv4)",
        libc::AF_INET6 => "AF_INET6 (IPv6)",
        libc::AF_UNIX => "AF_UNIX (Unix domain)",
        _ => "unknown address family",
    }
}
