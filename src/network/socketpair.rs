use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::{
    fcntl::{FcntlArg, FdFlag, fcntl},
    sys::socket::{AddressFamily, SockFlag, SockType, setsockopt, socketpair, sockopt},
};
use tokio::net::UnixDatagram;

use super::NetworkError;

pub const SEND_BUFFER_SIZE: usize = 1024 * 1024;
pub const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// The guest's end of the frame socket pair. Handing it to a hypervisor consumes it, so each end has exactly one
/// owner for its whole life.
#[derive(Debug)]
pub struct GuestNetEndpoint {
    fd: OwnedFd,
}

impl GuestNetEndpoint {
    /// Give up the endpoint, transferring ownership of the file descriptor to the caller.
    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for GuestNetEndpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn prepare(fd: &OwnedFd) -> Result<(), NetworkError> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(NetworkError::SocketPairFailed)?;
    setsockopt(fd, sockopt::SndBuf, &SEND_BUFFER_SIZE).map_err(NetworkError::SocketPairFailed)?;
    setsockopt(fd, sockopt::RcvBuf, &RECV_BUFFER_SIZE).map_err(NetworkError::SocketPairFailed)?;
    Ok(())
}

/// Create a connected `SOCK_DGRAM` unix socket pair with enlarged buffers on both ends. The second end is returned
/// registered with the tokio reactor for the switch.
pub fn datagram_pair() -> Result<(GuestNetEndpoint, UnixDatagram), NetworkError> {
    let (guest, switch) = socketpair(AddressFamily::Unix, SockType::Datagram, None, SockFlag::empty())
        .map_err(NetworkError::SocketPairFailed)?;
    prepare(&guest)?;
    prepare(&switch)?;

    let switch = std::os::unix::net::UnixDatagram::from(switch);
    switch.set_nonblocking(true).map_err(NetworkError::SwitchIoError)?;
    let switch = UnixDatagram::from_std(switch).map_err(NetworkError::SwitchIoError)?;

    Ok((GuestNetEndpoint { fd: guest }, switch))
}
