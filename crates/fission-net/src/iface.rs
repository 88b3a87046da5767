//! Multicast interface selection.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use get_if_addrs::IfAddr;
use socket2::Socket;

/// Join `group` on every interface that can carry multicast traffic.
///
/// Joining is attempted per interface and individual failures are
/// ignored; if no interface accepts the membership we fall back to
/// letting the OS pick one.
pub(crate) fn join_multicast_v4(socket: &Socket, group: &Ipv4Addr) -> io::Result<()> {
    let mut joined = false;

    for iface in get_if_addrs::get_if_addrs()? {
        let IfAddr::V4(ref addr) = iface.addr else {
            continue;
        };
        match socket.join_multicast_v4(group, &addr.ip) {
            Ok(()) => joined = true,
            Err(e) => {
                log::trace!(target: "net", "Interface {} refused multicast membership: {e}", iface.name);
            }
        }
    }

    if joined {
        Ok(())
    } else {
        socket.join_multicast_v4(group, &Ipv4Addr::UNSPECIFIED)
    }
}

/// IPv6 variant of [`join_multicast_v4`]. Memberships are per interface
/// index; each index is joined at most once.
pub(crate) fn join_multicast_v6(socket: &Socket, group: &Ipv6Addr) -> io::Result<()> {
    let mut indices = Vec::new();

    for iface in get_if_addrs::get_if_addrs()? {
        if !matches!(iface.addr, IfAddr::V6(_)) {
            continue;
        }
        let index = if_index(&iface.name);
        if index != 0 && !indices.contains(&index) {
            indices.push(index);
        }
    }

    let mut joined = false;
    for index in indices {
        match socket.join_multicast_v6(group, index) {
            Ok(()) => joined = true,
            Err(e) => {
                log::trace!(target: "net", "Interface {index} refused multicast membership: {e}");
            }
        }
    }

    if joined {
        Ok(())
    } else {
        socket.join_multicast_v6(group, 0)
    }
}

/// Interface name to index, `0` when unknown.
fn if_index(name: &str) -> u32 {
    let Ok(name) = std::ffi::CString::new(name) else {
        return 0;
    };
    // SAFETY: `name` is a valid NUL-terminated string.
    unsafe { libc::if_nametoindex(name.as_ptr()) }
}
