//! Linux `AF_PACKET` raw socket for the dispatch worker.
//!
//! The socket is bound to one interface and one ethertype, joined to the
//! ATDECC multicast group, and registered with a private [`mio::Poll`] so
//! [`Transport::receive_once`] can wait with a bound instead of spinning.
//! All syscalls are non-blocking; readiness is edge-triggered, so a receive
//! is always attempted before waiting.

use std::ffi::CString;
use std::io::{self, ErrorKind};
use std::mem;
use std::num::NonZeroU32;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use rustix::net::{AddressFamily, Protocol, SocketFlags, SocketType};

use crate::trace::debug;

use super::frame::MAX_PAYLOAD_LEN;
use super::transport::{Connector, LinkParams, Transport};
use super::{ETHERNET_HEADER_LEN, EthernetFrame, InboundFrame, MacAddress};

const RECV_TOKEN: Token = Token(0);

/// Receive buffer; large enough for jumbo-less frames with slack for tags.
const RECV_BUF_SIZE: usize = ETHERNET_HEADER_LEN + MAX_PAYLOAD_LEN + 64;

/// A raw link-layer socket bound to one interface.
pub struct RawSocket {
    fd: OwnedFd,
    ifindex: libc::c_int,
    local: MacAddress,
    poll: Poll,
    events: Events,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
}

impl RawSocket {
    /// Opens a socket on `params.interface` for `params.ethertype` and joins
    /// `params.group`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process lacks `CAP_NET_RAW`, the interface
    /// does not exist, or any socket option is rejected.
    pub fn open(params: &LinkParams) -> io::Result<Self> {
        // AF_PACKET takes the ethertype in network byte order.
        let raw_protocol = u32::from(params.ethertype.to_be());
        let protocol = NonZeroU32::new(raw_protocol).map(Protocol::from_raw);
        let fd = rustix::net::socket_with(
            AddressFamily::PACKET,
            SocketType::RAW,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            protocol,
        )?;

        let ifindex = interface_index(&fd, &params.interface)?;
        let local = hardware_address(fd.as_raw_fd(), &params.interface)?;
        bind_link(fd.as_raw_fd(), ifindex, params.ethertype)?;
        join_group(fd.as_raw_fd(), ifindex, params.group)?;

        if let Some(size) = params.recv_buffer_size {
            // mio doesn't expose socket options, so go through rustix
            rustix::net::sockopt::set_socket_recv_buffer_size(&fd, size)?;
        }

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&fd.as_raw_fd()),
            RECV_TOKEN,
            Interest::READABLE,
        )?;

        let socket = Self {
            fd,
            ifindex,
            local,
            poll,
            events: Events::with_capacity(4),
            recv_buf: vec![0u8; RECV_BUF_SIZE],
            send_buf: Vec::with_capacity(RECV_BUF_SIZE),
        };
        if let Some(_requested) = params.recv_buffer_size {
            // The kernel doubles the request and clamps it to rmem_max.
            let _effective = socket.recv_buffer_size()?;
            debug!(requested = _requested, effective = _effective, "receive buffer sized");
        }
        Ok(socket)
    }

    /// Kernel receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::socket_recv_buffer_size(&self.fd)?)
    }

    /// Non-blocking receive of one frame addressed to us.
    ///
    /// Skips our own transmissions echoed back by the kernel and runts.
    fn try_recv(&mut self) -> io::Result<Option<InboundFrame>> {
        loop {
            // SAFETY: zeroed sockaddr_ll is a valid (empty) address.
            let mut from: libc::sockaddr_ll = unsafe { mem::zeroed() };
            let mut from_len = socklen_of::<libc::sockaddr_ll>();
            // SAFETY: the buffer pointer/length pair describes `recv_buf`, and
            // `from`/`from_len` describe a live sockaddr_ll.
            let n = unsafe {
                libc::recvfrom(
                    self.fd.as_raw_fd(),
                    self.recv_buf.as_mut_ptr().cast(),
                    self.recv_buf.len(),
                    libc::MSG_DONTWAIT,
                    (&raw mut from).cast(),
                    &mut from_len,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    ErrorKind::WouldBlock => return Ok(None),
                    ErrorKind::Interrupted => continue,
                    _ => return Err(err),
                }
            }
            if libc::c_int::from(from.sll_pkttype) == libc::PACKET_OUTGOING as libc::c_int {
                continue;
            }
            #[allow(clippy::cast_sign_loss)] // n >= 0 checked above
            let len = n as usize;
            match EthernetFrame::parse(&self.recv_buf[..len]) {
                Some(frame) => return Ok(Some(frame)),
                None => continue,
            }
        }
    }
}

impl Transport for RawSocket {
    fn local_address(&self) -> MacAddress {
        self.local
    }

    fn transmit(&mut self, frame: &EthernetFrame) -> io::Result<usize> {
        frame.encode_into(&mut self.send_buf);

        // SAFETY: zeroed sockaddr_ll is valid; fields are filled below.
        let mut to: libc::sockaddr_ll = unsafe { mem::zeroed() };
        to.sll_family = libc::AF_PACKET as libc::c_ushort;
        to.sll_protocol = frame.ethertype.to_be();
        to.sll_ifindex = self.ifindex;
        to.sll_halen = 6;
        to.sll_addr[..6].copy_from_slice(&frame.destination.octets());

        // SAFETY: `send_buf` and `to` are live for the duration of the call.
        let n = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                self.send_buf.as_ptr().cast(),
                self.send_buf.len(),
                libc::MSG_DONTWAIT,
                (&raw const to).cast(),
                socklen_of::<libc::sockaddr_ll>(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(clippy::cast_sign_loss)] // n >= 0 checked above
        let sent = n as usize;
        Ok(sent)
    }

    fn receive_once(&mut self, timeout: Duration) -> io::Result<Option<InboundFrame>> {
        if let Some(frame) = self.try_recv()? {
            return Ok(Some(frame));
        }
        if timeout.is_zero() {
            return Ok(None);
        }
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e),
        }
        if self.events.is_empty() {
            return Ok(None);
        }
        self.try_recv()
    }
}

impl AsFd for RawSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Opens a [`RawSocket`] from the worker thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSocketConnector;

impl Connector for RawSocketConnector {
    type Transport = RawSocket;

    fn open(self, params: &LinkParams) -> io::Result<RawSocket> {
        RawSocket::open(params)
    }
}

fn socklen_of<T>() -> libc::socklen_t {
    #[allow(clippy::cast_possible_truncation)] // sockaddr sizes fit in socklen_t
    let len = mem::size_of::<T>() as libc::socklen_t;
    len
}

fn interface_name(name: &str) -> io::Result<CString> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("invalid interface name: {name:?}"),
        ));
    }
    CString::new(name).map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))
}

fn interface_index(fd: &OwnedFd, name: &str) -> io::Result<libc::c_int> {
    interface_name(name)?;
    let index = rustix::net::netdevice::name_to_index(fd, name)?;
    libc::c_int::try_from(index).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
}

fn hardware_address(fd: RawFd, name: &str) -> io::Result<MacAddress> {
    let cname = interface_name(name)?;
    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut req: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(cname.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    // SAFETY: `req` is a live ifreq with a NUL-terminated name (zeroed tail).
    let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &raw mut req) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: SIOCGIFHWADDR fills the hwaddr member of the union.
    let data = unsafe { req.ifr_ifru.ifru_hwaddr.sa_data };
    let mut octets = [0u8; 6];
    for (dst, src) in octets.iter_mut().zip(data.iter()) {
        *dst = *src as u8;
    }
    Ok(MacAddress::new(octets))
}

fn bind_link(fd: RawFd, ifindex: libc::c_int, ethertype: u16) -> io::Result<()> {
    // SAFETY: zeroed sockaddr_ll is valid; fields are filled below.
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = ethertype.to_be();
    addr.sll_ifindex = ifindex;
    // SAFETY: `addr` is a live sockaddr_ll and the length matches it.
    let rc = unsafe {
        libc::bind(
            fd,
            (&raw const addr).cast(),
            socklen_of::<libc::sockaddr_ll>(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn join_group(fd: RawFd, ifindex: libc::c_int, group: MacAddress) -> io::Result<()> {
    // SAFETY: packet_mreq is plain old data.
    let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
    mreq.mr_ifindex = ifindex;
    mreq.mr_type = libc::PACKET_MR_MULTICAST as libc::c_ushort;
    mreq.mr_alen = 6;
    mreq.mr_address[..6].copy_from_slice(&group.octets());
    // SAFETY: `mreq` is live and the length matches it.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            libc::PACKET_ADD_MEMBERSHIP,
            (&raw const mreq).cast(),
            socklen_of::<libc::packet_mreq>(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
