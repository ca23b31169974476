use std::os::unix::io::RawFd;

use bytes::Bytes;
use tracing::warn;

use crate::client::{Client, Clients};
use crate::eloop::{Poller, WRITABLE};

/// Commands the server understands. Anything else, including a known verb
/// with the wrong arity, is `Unsupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Get,
    Set,
    Del,
    Unsupported,
}

impl Command {
    /// Classifies a parsed argument vector. Verbs are case-sensitive.
    pub fn classify(argv: &[Bytes]) -> Command {
        match argv.first().map(|a| &a[..]) {
            Some(b"GET") if argv.len() == 2 => Command::Get,
            Some(b"SET") if argv.len() == 3 => Command::Set,
            Some(b"DEL") if argv.len() == 2 => Command::Del,
            _ => Command::Unsupported,
        }
    }
}

/// One queued command. Owns its argument bytes: the client's input buffer is
/// rewritten as more data arrives, so tasks cannot borrow from it.
#[derive(Debug)]
pub struct Task {
    pub argv: Vec<Bytes>,
    pub fd: RawFd,
    pub cmd: Command,
}

/// A command backend. `submit` enqueues, `execute` drains up to `n` tasks in
/// FIFO order and appends responses to the owning clients' output buffers.
pub trait Executor {
    fn submit(&mut self, argv: Vec<Bytes>, fd: RawFd);

    /// Runs up to `n` queued tasks. `curr_time` is the loop's per-tick clock;
    /// backends currently have no use for it but the driver supplies it so
    /// time never has to be re-read mid-drain.
    fn execute(
        &mut self,
        n: usize,
        curr_time: i64,
        clients: &mut Clients,
        poller: &mut Poller,
    ) -> crate::Result<()>;

    fn task_count(&self) -> usize;
}

/// Settles a completed task's reference on its client. Returns the client for
/// response emission, or `None` when the client is closing, in which case the
/// response is suppressed and the record is released once the last in-flight
/// task has drained.
pub(crate) fn finish_task<'a>(
    clients: &'a mut Clients,
    poller: &mut Poller,
    fd: RawFd,
) -> Option<&'a mut Client> {
    {
        let c = clients.get_mut(fd)?;
        c.ref_count = c.ref_count.saturating_sub(1);
        if c.close {
            if c.ref_count == 0 {
                poller.forget(fd);
                clients.release(fd);
            }
            return None;
        }
    }
    clients.get_mut(fd)
}

/// Write-through: when the response just appended is the only pending output,
/// try one immediate non-blocking write and fall back to write readiness for
/// whatever remains.
pub(crate) fn flush_if_unblocked(c: &mut Client, poller: &mut Poller, fd: RawFd, blocked: bool) {
    if blocked {
        return;
    }
    c.try_write();
    if !c.output.is_empty() {
        if let Err(e) = poller.add_event(fd, WRITABLE) {
            warn!("failed subscribing writable on fd {}: {}", fd, e);
        }
    }
}
