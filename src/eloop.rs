use std::io;
use std::os::unix::io::RawFd;

/// Interest in read readiness.
pub const READABLE: u32 = libc::EPOLLIN as u32;
/// Interest in write readiness.
pub const WRITABLE: u32 = libc::EPOLLOUT as u32;

/// One readiness notification, decoded from the kernel event.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// Level-triggered epoll wrapper with per-fd interest masks.
///
/// The driver subscribes and unsubscribes `READABLE`/`WRITABLE` per fd;
/// registration with the kernel (add/modify/delete) follows from the mask
/// transitions. Level-triggered delivery matters: the read path consumes at
/// most one block per event and relies on being re-notified.
pub struct Poller {
    epfd: RawFd,
    masks: Vec<u32>,
    buf: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new(capacity: usize) -> io::Result<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epfd,
            masks: vec![0; capacity],
            buf: Vec::with_capacity(1024),
        })
    }

    /// Adds `mask` to the fd's interest set.
    pub fn add_event(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
        let old = self.mask(fd)?;
        let new = old | mask;
        if new == old {
            return Ok(());
        }
        let op = if old == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.ctl(op, fd, new)?;
        self.masks[fd as usize] = new;
        Ok(())
    }

    /// Removes `mask` from the fd's interest set, deregistering the fd when
    /// nothing remains.
    pub fn del_event(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
        let old = self.mask(fd)?;
        let new = old & !mask;
        if new == old {
            return Ok(());
        }
        let op = if new == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.ctl(op, fd, new)?;
        self.masks[fd as usize] = new;
        Ok(())
    }

    /// Drops any registration for `fd`. Used right before the fd is closed;
    /// errors are deliberately ignored since close deregisters anyway.
    pub fn forget(&mut self, fd: RawFd) {
        if let Ok(old) = self.mask(fd) {
            if old != 0 {
                let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
                self.masks[fd as usize] = 0;
            }
        }
    }

    /// Waits for readiness and decodes the kernel events into `events`.
    /// A negative `timeout_ms` blocks indefinitely.
    pub fn poll(&mut self, events: &mut Vec<Event>, timeout_ms: i32) -> io::Result<usize> {
        events.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.buf.as_mut_ptr(),
                self.buf.capacity() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        unsafe { self.buf.set_len(n as usize) };
        for ev in &self.buf {
            // Error and hang-up conditions are delivered regardless of the
            // interest mask; route them through the read path so the driver
            // observes the failure and releases the client.
            let kinds = ev.events;
            events.push(Event {
                fd: ev.u64 as RawFd,
                readable: kinds & (READABLE | libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0,
                writable: kinds & WRITABLE != 0,
            });
        }
        Ok(events.len())
    }

    fn mask(&self, fd: RawFd) -> io::Result<u32> {
        self.masks
            .get(fd as usize)
            .copied()
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let r = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn readable_event_fires_on_data() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut sender = TcpStream::connect(addr).unwrap();
        let (receiver, _) = listener.accept().unwrap();
        receiver.set_nonblocking(true).unwrap();

        let fd = receiver.as_raw_fd();
        let mut poller = Poller::new(1024).unwrap();
        poller.add_event(fd, READABLE).unwrap();

        let mut events = Vec::new();
        let n = poller.poll(&mut events, 0).unwrap();
        assert_eq!(n, 0);

        sender.write_all(b"x").unwrap();
        let n = poller.poll(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].fd, fd);
        assert!(events[0].readable);

        // level-triggered: still pending until drained
        let n = poller.poll(&mut events, 0).unwrap();
        assert_eq!(n, 1);

        poller.del_event(fd, READABLE).unwrap();
        let n = poller.poll(&mut events, 0).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn mask_transitions_compose() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _sender = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let fd = stream.as_raw_fd();

        let mut poller = Poller::new(1024).unwrap();
        poller.add_event(fd, READABLE).unwrap();
        poller.add_event(fd, WRITABLE).unwrap();

        // a healthy idle socket is immediately writable
        let mut events = Vec::new();
        poller.poll(&mut events, 100).unwrap();
        assert!(events.iter().any(|e| e.fd == fd && e.writable));

        poller.del_event(fd, WRITABLE).unwrap();
        poller.poll(&mut events, 0).unwrap();
        assert!(!events.iter().any(|e| e.fd == fd && e.writable));

        poller.forget(fd);
        poller.poll(&mut events, 0).unwrap();
        assert!(events.is_empty());
    }
}
