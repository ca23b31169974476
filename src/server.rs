use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes};
use tracing::{debug, warn};

use crate::client::{Client, Clients, MAX_CLIENTS};
use crate::eloop::{Event, Poller, READABLE, WRITABLE};
use crate::executor::Executor;
use crate::net;
use crate::resp::ParseState;

pub const PORT: u16 = 6379;
pub const BACKLOG: i32 = 511;
pub const CRON_INTERVAL: i64 = 1;
pub const MAX_ACCEPT_PER_CALL: usize = 1000;
pub const TCP_KEEPALIVE: u64 = 300;
pub const READ_LENGTH: usize = 4096;
pub const TIMEOUT: i64 = 360;
pub const MAX_INPUT_BUFFER: usize = 10 * 1024 * 1024;

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Runs the event loop until a fatal error occurs.
///
/// Per tick: poll readiness (sleeping only when no tasks are queued), accept
/// and service clients, drain half of the pending tasks, then expire idle
/// connections. The half-drain keeps response work from starving socket I/O
/// during bursts.
pub fn run(listener: TcpListener, executor: &mut dyn Executor) -> crate::Result<()> {
    let mut poller = Poller::new(MAX_CLIENTS)?;
    let mut clients = Clients::new();
    let mut events: Vec<Event> = Vec::new();

    let listen_fd = listener.as_raw_fd();
    poller.add_event(listen_fd, READABLE)?;

    let mut last_cron_time = now();
    loop {
        let timeout_ms = if executor.task_count() > 0 {
            0
        } else {
            (CRON_INTERVAL * 1000) as i32
        };
        poller.poll(&mut events, timeout_ms)?;
        let curr_time = now();

        for &ev in &events {
            if ev.fd == listen_fd {
                accept_clients(&listener, &mut clients, &mut poller, curr_time);
                continue;
            }
            // the record can disappear or start closing between two events of
            // the same batch; closing clients get no further I/O
            if ev.readable && clients.get(ev.fd).is_some_and(|c| !c.close) {
                read_from_client(ev.fd, &mut clients, &mut poller, executor, curr_time);
            }
            if ev.writable && clients.get(ev.fd).is_some_and(|c| !c.close) {
                write_to_client(ev.fd, &mut clients, &mut poller, curr_time);
            }
        }

        let plan = (executor.task_count() + 1) / 2;
        executor.execute(plan, curr_time, &mut clients, &mut poller)?;

        server_cron(&mut last_cron_time, curr_time, &mut clients, &mut poller);
    }
}

/// Two-path client teardown: destroy immediately when no tasks are in
/// flight, otherwise mark the record closing and drop its readiness
/// subscriptions so no further I/O happens while the queue drains.
pub(crate) fn release_or_mark(clients: &mut Clients, poller: &mut Poller, fd: RawFd) {
    let Some(c) = clients.get_mut(fd) else {
        return;
    };
    if c.ref_count == 0 {
        poller.forget(fd);
        clients.release(fd);
    } else {
        c.close = true;
        let _ = poller.del_event(fd, READABLE | WRITABLE);
    }
}

fn accept_clients(listener: &TcpListener, clients: &mut Clients, poller: &mut Poller, curr_time: i64) {
    for _ in 0..MAX_ACCEPT_PER_CALL {
        let (stream, peer) = match net::tcp_accept(listener) {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("failed accepting: {}", e);
                break;
            }
        };
        if let Err(e) = net::configure_client(&stream, TCP_KEEPALIVE) {
            warn!("failed configuring {}: {}", peer, e);
        }

        let fd = stream.as_raw_fd();
        if clients.acquire(fd, Client::new(stream, curr_time)).is_err() {
            // dropping the rejected record closes the socket
            warn!("failed acquiring fd {}", fd);
            continue;
        }
        if let Err(e) = poller.add_event(fd, READABLE) {
            clients.release(fd);
            warn!("failed adding readable event for fd {}: {}", fd, e);
            break;
        }
        debug!("accepted {}", peer);
    }
}

fn read_from_client(
    fd: RawFd,
    clients: &mut Clients,
    poller: &mut Poller,
    executor: &mut dyn Executor,
    curr_time: i64,
) {
    enum Outcome {
        Progress,
        PeerClosed,
        Failed(io::Error),
        Overflow(usize),
    }

    let outcome = {
        let Some(c) = clients.get_mut(fd) else {
            return;
        };
        let mut buf = [0u8; READ_LENGTH];
        match c.stream.read(&mut buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => Outcome::Failed(e),
            Ok(0) => Outcome::PeerClosed,
            Ok(n) => {
                c.input.extend_from_slice(&buf[..n]);
                c.last_mod_time = curr_time;
                if c.input.len() > MAX_INPUT_BUFFER {
                    Outcome::Overflow(c.input.len())
                } else {
                    Outcome::Progress
                }
            }
        }
    };
    match outcome {
        Outcome::Progress => {}
        Outcome::PeerClosed => {
            release_or_mark(clients, poller, fd);
            return;
        }
        Outcome::Failed(e) => {
            debug!("read error on fd {}: {}", fd, e);
            release_or_mark(clients, poller, fd);
            return;
        }
        Outcome::Overflow(len) => {
            warn!("closing fd {}: input buffer at {} bytes", fd, len);
            release_or_mark(clients, poller, fd);
            return;
        }
    }

    // feed the parser until it runs out of buffered bytes; every completed
    // frame becomes one owned task
    loop {
        let Some(c) = clients.get_mut(fd) else {
            return;
        };
        if c.consume_len >= c.input.len() {
            return;
        }
        let consumed = c.resp.input(&c.input[c.consume_len..]);
        c.consume_len += consumed;
        match c.resp.state() {
            ParseState::Success => {
                let argv: Vec<Bytes> = c
                    .resp
                    .argv()
                    .iter()
                    .map(|r| Bytes::copy_from_slice(&c.input[r.clone()]))
                    .collect();
                c.ref_count += 1;
                c.resp.reset();
                c.input.advance(c.consume_len);
                c.consume_len = 0;
                executor.submit(argv, fd);
            }
            ParseState::Process => return,
            state => {
                debug!("parse error on fd {}: {:?}", fd, state);
                release_or_mark(clients, poller, fd);
                return;
            }
        }
    }
}

fn write_to_client(fd: RawFd, clients: &mut Clients, poller: &mut Poller, curr_time: i64) {
    let drained = {
        let Some(c) = clients.get_mut(fd) else {
            return;
        };
        match c.stream.write(&c.output) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                debug!("write error on fd {}: {}", fd, e);
                release_or_mark(clients, poller, fd);
                return;
            }
            Ok(n) => {
                c.last_mod_time = curr_time;
                c.output.advance(n);
                c.output.is_empty()
            }
        }
    };
    if drained {
        let _ = poller.del_event(fd, WRITABLE);
    }
}

fn server_cron(last_cron_time: &mut i64, curr_time: i64, clients: &mut Clients, poller: &mut Poller) {
    if curr_time - *last_cron_time < CRON_INTERVAL {
        return;
    }
    *last_cron_time = curr_time;

    let expired: Vec<RawFd> = clients
        .iter()
        .filter(|(_, c)| c.last_mod_time >= 0 && curr_time - c.last_mod_time > TIMEOUT)
        .map(|(fd, _)| fd)
        .collect();
    for fd in expired {
        debug!("expiring idle fd {}", fd);
        release_or_mark(clients, poller, fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskExecutor;
    use crate::mem::MemExecutor;
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    fn spawn_server(mut executor: Box<dyn Executor + Send>) -> std::net::SocketAddr {
        let listener = net::tcp_server("127.0.0.1", 0, BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let _ = run(listener, executor.as_mut());
        });
        addr
    }

    fn connect(addr: std::net::SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn run_scenarios(addr: std::net::SocketAddr) {
        // pipelined SET + GET
        let mut c = connect(addr);
        c.write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n")
            .unwrap();
        assert_eq!(read_exactly(&mut c, 14), b"+OK\r\n$3\r\nbar\r\n");

        // GET of an absent key
        c.write_all(b"*2\r\n$3\r\nGET\r\n$6\r\nabsent\r\n").unwrap();
        assert_eq!(read_exactly(&mut c, 5), b"*-1\r\n");

        // inline request for an unknown command
        c.write_all(b"PING\r\n").unwrap();
        assert_eq!(read_exactly(&mut c, 22), b"-Unsupported Command\r\n");

        // DEL of a key never set
        c.write_all(b"*2\r\n$3\r\nDEL\r\n$1\r\nk\r\n").unwrap();
        assert_eq!(read_exactly(&mut c, 5), b"+OK\r\n");

        // a frame split across two writes
        let raw: &[u8] = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbaz\r\n*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
        let half = raw.len() / 2;
        c.write_all(&raw[..half]).unwrap();
        thread::sleep(Duration::from_millis(50));
        c.write_all(&raw[half..]).unwrap();
        assert_eq!(read_exactly(&mut c, 14), b"+OK\r\n$3\r\nbaz\r\n");
    }

    #[test]
    fn memory_backend_end_to_end() {
        let addr = spawn_server(Box::new(MemExecutor::new()));
        run_scenarios(addr);
    }

    #[test]
    fn disk_backend_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_server(Box::new(DiskExecutor::open(dir.path()).unwrap()));
        run_scenarios(addr);

        // values survive DEL of an unrelated key
        let mut c = connect(addr);
        c.write_all(b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$2\r\nxy\r\n").unwrap();
        assert_eq!(read_exactly(&mut c, 5), b"+OK\r\n");
        c.write_all(b"*2\r\n$3\r\nDEL\r\n$1\r\nb\r\n").unwrap();
        assert_eq!(read_exactly(&mut c, 5), b"+OK\r\n");
        c.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n").unwrap();
        assert_eq!(read_exactly(&mut c, 8), b"$2\r\nxy\r\n");
    }

    #[test]
    fn parse_error_closes_connection() {
        let addr = spawn_server(Box::new(MemExecutor::new()));
        let mut c = connect(addr);
        c.write_all(b"*notanumber\r\n").unwrap();

        let mut buf = [0; 1];
        // server drops the connection: read observes EOF
        assert_eq!(c.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn many_clients_interleave() {
        let addr = spawn_server(Box::new(MemExecutor::new()));
        let mut conns: Vec<TcpStream> = (0..8).map(|_| connect(addr)).collect();

        for (i, c) in conns.iter_mut().enumerate() {
            let key = format!("k{}", i);
            let val = format!("v{}", i);
            let msg = format!(
                "*3\r\n$3\r\nSET\r\n${}\r\n{}\r\n${}\r\n{}\r\n",
                key.len(),
                key,
                val.len(),
                val
            );
            c.write_all(msg.as_bytes()).unwrap();
        }
        for c in conns.iter_mut() {
            assert_eq!(read_exactly(c, 5), b"+OK\r\n");
        }
        for (i, c) in conns.iter_mut().enumerate() {
            let key = format!("k{}", i);
            let msg = format!("*2\r\n$3\r\nGET\r\n${}\r\n{}\r\n", key.len(), key);
            c.write_all(msg.as_bytes()).unwrap();
            let val = format!("v{}", i);
            let expect = format!("${}\r\n{}\r\n", val.len(), val);
            assert_eq!(read_exactly(c, expect.len()), expect.as_bytes());
        }
    }
}
