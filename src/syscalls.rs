// src/syscalls.rs
use crate::error::{ErrorKind, SysError};
use libc::{c_int, c_short, c_void, socklen_t};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

pub(crate) type SysResult<T> = Result<T, SysError>;

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create a non-blocking TCP listener bound to INADDR_ANY on `port`.
pub(crate) fn create_listen_socket(port: u16, backlog: c_int) -> SysResult<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(SysError::last_os(ErrorKind::Socket));
        }

        // Allow rebinding while old sockets linger in TIME_WAIT
        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        if let Err(err) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(SysError::new(ErrorKind::Socket, err));
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = SysError::last_os(ErrorKind::Bind);
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, backlog) < 0 {
            let err = SysError::last_os(ErrorKind::Listen);
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Accept one pending connection, already marked non-blocking.
/// `Ok(None)` means nothing is waiting.
pub(crate) fn accept_connection(listen_fd: RawFd) -> SysResult<Option<RawFd>> {
    unsafe {
        let fd = libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut());
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(SysError::new(ErrorKind::Accept, err));
        }
        if let Err(err) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(SysError::new(ErrorKind::Accept, err));
        }
        Ok(Some(fd))
    }
}

/// Non-blocking read. `Ok(None)` is would-block; `Ok(Some(0))` is EOF.
/// EINTR is retried locally.
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(None),
            _ => return Err(err),
        }
    }
}

/// Non-blocking write. `Ok(None)` is would-block; EINTR is retried locally.
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<Option<usize>> {
    loop {
        let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(None),
            _ => return Err(err),
        }
    }
}

pub(crate) fn close_fd(fd: RawFd) -> SysResult<()> {
    if unsafe { libc::close(fd) } < 0 {
        return Err(SysError::last_os(ErrorKind::Close));
    }
    Ok(())
}

pub(crate) fn local_port(fd: RawFd) -> io::Result<u16> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
    let res =
        unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(u16::from_be(addr.sin_port))
}

pub(crate) const INTEREST_READ: c_short = libc::POLLIN;
pub(crate) const INTEREST_WRITE: c_short = libc::POLLOUT;

/// Interest set for `poll(2)`, rebuilt by the event loop every iteration.
pub(crate) struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    pub fn new() -> Self {
        Self { fds: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    pub fn push(&mut self, fd: RawFd, interest: c_short) {
        self.fds.push(libc::pollfd {
            fd,
            events: interest,
            revents: 0,
        });
    }

    /// Block until readiness or the timeout. EINTR reads as "nothing ready".
    pub fn wait(&mut self, timeout_ms: c_int) -> SysResult<usize> {
        let res = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(SysError::new(ErrorKind::Select, err));
        }
        Ok(res as usize)
    }

    pub fn readable(&self, idx: usize) -> bool {
        self.fds[idx].revents & libc::POLLIN != 0
    }

    pub fn writable(&self, idx: usize) -> bool {
        self.fds[idx].revents & libc::POLLOUT != 0
    }

    pub fn errored(&self, idx: usize) -> bool {
        self.fds[idx].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
    }
}
