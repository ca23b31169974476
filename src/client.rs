use std::io::Write;
use std::net::TcpStream;
use std::os::unix::io::RawFd;

use bytes::{Buf, BytesMut};

use crate::resp::RespParser;

/// Upper bound of the fd-indexed client table. `Clients::acquire` rejects
/// descriptors at or beyond this.
pub const MAX_CLIENTS: usize = 10240;

/// Per-connection state, owned by the event loop and indexed by fd.
///
/// Destruction closes the socket (by dropping the stream). A record with
/// in-flight tasks (`ref_count > 0`) is kept alive with `close` set until the
/// last task completes; see `server::release_or_mark`.
#[derive(Debug)]
pub struct Client {
    pub stream: TcpStream,
    pub resp: RespParser,
    pub input: BytesMut,
    pub output: BytesMut,
    /// Seconds since the epoch of the last read or write. Negative values
    /// exempt the record from the idle timeout.
    pub last_mod_time: i64,
    /// Number of in-flight tasks referring to this record.
    pub ref_count: u32,
    /// Bytes of `input` already handed to the parser without closing a frame.
    pub consume_len: usize,
    pub close: bool,
}

impl Client {
    pub fn new(stream: TcpStream, last_mod_time: i64) -> Client {
        Client {
            stream,
            resp: RespParser::new(),
            input: BytesMut::new(),
            output: BytesMut::new(),
            last_mod_time,
            ref_count: 0,
            consume_len: 0,
            close: false,
        }
    }

    /// Best-effort write of the pending output. Short writes leave the tail
    /// in place; errors are ignored here and surface on the next writable
    /// event instead.
    pub fn try_write(&mut self) {
        if let Ok(n) = self.stream.write(&self.output) {
            if n > 0 {
                self.output.advance(n);
            }
        }
    }
}

/// Dense fd-indexed table of live client records.
pub struct Clients {
    slots: Vec<Option<Client>>,
}

impl Clients {
    pub fn new() -> Clients {
        let mut slots = Vec::new();
        slots.resize_with(MAX_CLIENTS, || None);
        Clients { slots }
    }

    /// Registers `client` under `fd`. Fails when the fd is out of table range
    /// or the slot is occupied, handing the record back to the caller.
    pub fn acquire(&mut self, fd: RawFd, client: Client) -> Result<(), Client> {
        match self.slots.get_mut(fd as usize) {
            Some(slot @ None) => {
                *slot = Some(client);
                Ok(())
            }
            _ => Err(client),
        }
    }

    /// Removes the record under `fd`; dropping it closes the socket.
    pub fn release(&mut self, fd: RawFd) -> Option<Client> {
        self.slots.get_mut(fd as usize).and_then(Option::take)
    }

    pub fn get(&self, fd: RawFd) -> Option<&Client> {
        self.slots.get(fd as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Client> {
        self.slots.get_mut(fd as usize).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawFd, &Client)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, slot)| slot.as_ref().map(|c| (fd as RawFd, c)))
    }
}

impl Default for Clients {
    fn default() -> Self {
        Clients::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[test]
    fn acquire_release_round_trip() {
        let (stream, _peer) = connected_pair();
        let fd = stream.as_raw_fd();

        let mut clients = Clients::new();
        clients.acquire(fd, Client::new(stream, 0)).unwrap();
        assert!(clients.get(fd).is_some());

        // slot occupied
        let (other, _peer2) = connected_pair();
        assert!(clients.acquire(fd, Client::new(other, 0)).is_err());

        assert!(clients.release(fd).is_some());
        assert!(clients.get(fd).is_none());
        assert!(clients.release(fd).is_none());
    }

    #[test]
    fn acquire_rejects_out_of_range_fd() {
        let (stream, _peer) = connected_pair();
        let mut clients = Clients::new();
        let client = Client::new(stream, 0);
        assert!(clients.acquire(MAX_CLIENTS as RawFd, client).is_err());
    }
}
