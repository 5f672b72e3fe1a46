//! AF_PACKET link transport (Linux/Unix hosts).
//!
//! Binds a `SOCK_RAW` packet socket to a host interface and moves
//! whole Ethernet frames through it. Receive is `poll(2)` with a
//! bounded timeout so the driver's receive thread can observe
//! shutdown. Opening the socket requires `CAP_NET_RAW`.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::ethernet::EthAddr;
use crate::link::{LinkTransport, RxError, TxError};

#[repr(C)]
union IfReqData {
    hwaddr: libc::sockaddr,
    mtu: libc::c_int,
    _pad: [u8; 24],
}

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    data: IfReqData,
}

impl IfReq {
    fn for_interface(ifname: &str) -> io::Result<Self> {
        if ifname.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }
        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            data: IfReqData { _pad: [0; 24] },
        };
        for (dst, src) in req.name.iter_mut().zip(ifname.bytes()) {
            *dst = src as libc::c_char;
        }
        Ok(req)
    }
}

/// Raw packet socket bound to one host interface.
pub struct RawSocketLink {
    name: String,
    mac: EthAddr,
    mtu: usize,
    fd: RawFd,
    poll_ms: libc::c_int,
}

// SAFETY: the fd is used via send/recv/poll, all of which are safe to
// issue concurrently from the tx and rx threads.
unsafe impl Send for RawSocketLink {}
unsafe impl Sync for RawSocketLink {}

impl RawSocketLink {
    /// Open and bind a packet socket on `ifname`.
    pub fn open(ifname: &str, recv_timeout: Duration) -> io::Result<Self> {
        let c_ifname = CString::new(ifname)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad interface name"))?;

        fn close_on_err(fd: RawFd, e: io::Error) -> io::Error {
            // SAFETY: fd was opened just above and has no other owner.
            unsafe {
                libc::close(fd);
            }
            e
        }

        // SAFETY: plain libc socket/ioctl/bind calls on stack-local,
        // zero-initialized argument structures.
        unsafe {
            let proto = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;
            let fd = libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let ifindex = libc::if_nametoindex(c_ifname.as_ptr());
            if ifindex == 0 {
                return Err(close_on_err(fd, io::Error::last_os_error()));
            }

            let mut sll: libc::sockaddr_ll = mem::zeroed();
            sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
            sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
            sll.sll_ifindex = ifindex as libc::c_int;
            let rc = libc::bind(
                fd,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            );
            if rc < 0 {
                return Err(close_on_err(fd, io::Error::last_os_error()));
            }

            // Non-blocking; receive waits in poll(2) instead.
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(close_on_err(fd, io::Error::last_os_error()));
            }

            let mut req = IfReq::for_interface(ifname).map_err(|e| close_on_err(fd, e))?;
            if libc::ioctl(fd, libc::SIOCGIFHWADDR as _, &mut req) < 0 {
                return Err(close_on_err(fd, io::Error::last_os_error()));
            }
            let mut mac = [0u8; 6];
            for (dst, src) in mac.iter_mut().zip(req.data.hwaddr.sa_data.iter()) {
                *dst = *src as u8;
            }

            let mut req = IfReq::for_interface(ifname).map_err(|e| close_on_err(fd, e))?;
            if libc::ioctl(fd, libc::SIOCGIFMTU as _, &mut req) < 0 {
                return Err(close_on_err(fd, io::Error::last_os_error()));
            }
            let mtu = req.data.mtu as usize;

            log::info!(
                "raw socket on {}: mac {} mtu {}",
                ifname,
                EthAddr(mac),
                mtu
            );

            Ok(RawSocketLink {
                name: ifname.to_owned(),
                mac: EthAddr(mac),
                mtu,
                fd,
                poll_ms: recv_timeout.as_millis().max(1) as libc::c_int,
            })
        }
    }
}

impl LinkTransport for RawSocketLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn mac_address(&self) -> EthAddr {
        self.mac
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn send(&self, frame: &[u8]) -> Result<(), TxError> {
        if frame.is_empty() {
            return Err(TxError::InvalidBuffer);
        }
        loop {
            // SAFETY: fd is open for the lifetime of self; frame is a
            // valid slice.
            let n = unsafe {
                libc::send(
                    self.fd,
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    0,
                )
            };
            if n >= 0 {
                return if n as usize == frame.len() {
                    Ok(())
                } else {
                    Err(TxError::IoError)
                };
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Err(TxError::QueueFull),
                Some(libc::ENETDOWN) => return Err(TxError::LinkDown),
                _ => return Err(TxError::IoError),
            }
        }
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, RxError> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd and buf are valid for the duration of the calls.
        unsafe {
            let rc = libc::poll(&mut pfd, 1, self.poll_ms);
            if rc < 0 {
                return match io::Error::last_os_error().raw_os_error() {
                    Some(libc::EINTR) => Err(RxError::TimedOut),
                    _ => Err(RxError::IoError),
                };
            }
            if rc == 0 {
                return Err(RxError::TimedOut);
            }
            let n = libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0);
            if n < 0 {
                return match io::Error::last_os_error().raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => Err(RxError::TimedOut),
                    Some(libc::ENETDOWN) => Err(RxError::LinkDown),
                    _ => Err(RxError::IoError),
                };
            }
            Ok(n as usize)
        }
    }
}

impl Drop for RawSocketLink {
    fn drop(&mut self) {
        // SAFETY: fd was opened by us and not closed elsewhere.
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Opening needs CAP_NET_RAW and a real interface; a nonsense name
    // must fail cleanly either way.
    #[test]
    fn open_nonexistent_interface_fails() {
        let r = RawSocketLink::open("unet-no-such-if0", Duration::from_millis(10));
        assert!(r.is_err());
    }

    #[test]
    fn overlong_interface_name_fails() {
        let name = "x".repeat(64);
        let r = RawSocketLink::open(&name, Duration::from_millis(10));
        assert!(r.is_err());
    }
}
