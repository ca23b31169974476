pub mod arena;
pub mod index;
pub mod log;

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::path::Path;

use bytes::{BufMut, Bytes};
use tracing::debug;

use crate::client::Clients;
use crate::eloop::Poller;
use crate::executor::{finish_task, flush_if_unblocked, Command, Executor, Task};
use crate::resp;

use self::index::{pack_lengths, pack_rep, unpack_lengths, unpack_rep, Index};
use self::log::{DataLog, MAX_DATA_FILE_SIZE, RECORD_HEADER_SIZE};

pub const INDEX_FILENAME: &str = "cheapis-dakv.index";

/// Disk backend: an append-only segmented record log indexed by a persistent
/// page tree.
///
/// SET appends `header || key || value` to the log and points the index at
/// the new record; the old record is simply abandoned. Execution batches all
/// SET payloads of a drain into one write and only touches the index after
/// the write lands, so the index never references bytes past the log's end.
pub struct DiskExecutor {
    tasks: VecDeque<Task>,
    index: Index,
    log: DataLog,
    buf: Vec<u8>,
    batch: Vec<u32>,
}

impl DiskExecutor {
    pub fn open(dir: &Path) -> crate::Result<DiskExecutor> {
        DiskExecutor::open_with_limit(dir, MAX_DATA_FILE_SIZE)
    }

    pub(crate) fn open_with_limit(dir: &Path, max_file_size: u64) -> crate::Result<DiskExecutor> {
        let index = Index::open(&dir.join(INDEX_FILENAME))?;
        let log = DataLog::open_with_limit(dir, index.log_cursor(), max_file_size)?;
        Ok(DiskExecutor {
            tasks: VecDeque::new(),
            index,
            log,
            buf: Vec::new(),
            batch: Vec::new(),
        })
    }

    /// Kernel readahead for the record an existing key points at: header and
    /// key for the equality check, plus the value when the command will
    /// return it. Saturated packed lengths understate long records; the
    /// remainder is fetched synchronously at execute time.
    fn prefetch(&self, key: &[u8], with_value: bool) {
        match self.index.get_rep(&self.log, key) {
            Ok(Some(rep)) => {
                let (id, lens, offset) = unpack_rep(rep);
                let (packed_k, packed_v) = unpack_lengths(lens);
                let mut len = RECORD_HEADER_SIZE + packed_k as usize;
                if with_value {
                    len += packed_v as usize;
                }
                self.log.prefetch(id, offset as u64, len);
            }
            Ok(None) => {}
            Err(e) => debug!("prefetch lookup failed: {}", e),
        }
    }
}

impl Executor for DiskExecutor {
    fn submit(&mut self, argv: Vec<Bytes>, fd: RawFd) {
        let cmd = Command::classify(&argv);
        match cmd {
            Command::Get => self.prefetch(&argv[1], true),
            Command::Set | Command::Del => self.prefetch(&argv[1], false),
            Command::Unsupported => {}
        }
        self.tasks.push_back(Task { argv, fd, cmd });
    }

    fn execute(
        &mut self,
        n: usize,
        _curr_time: i64,
        clients: &mut Clients,
        poller: &mut Poller,
    ) -> crate::Result<()> {
        if n == 0 {
            return Ok(());
        }
        self.log.create_file_if_need()?;

        // first pass: gather every live SET into one contiguous batch,
        // remembering each record's future offset
        self.buf.clear();
        self.batch.clear();
        let mut offset = self.log.offset();
        for task in self.tasks.iter().take(n) {
            if task.cmd != Command::Set {
                continue;
            }
            if clients.get(task.fd).map_or(true, |c| c.close) {
                continue;
            }
            let key = &task.argv[1];
            let value = &task.argv[2];
            self.buf.put_u16_le(key.len() as u16);
            self.buf.put_u16_le(value.len() as u16);
            self.buf.extend_from_slice(key);
            self.buf.extend_from_slice(value);

            self.batch.push(offset as u32);
            offset += (RECORD_HEADER_SIZE + key.len() + value.len()) as u64;
        }

        self.log.append(&self.buf)?;
        self.index.set_log_cursor(self.log.curr_id(), self.log.offset());

        // second pass: settle each task against the index and emit responses
        let mut next_batch = 0;
        for _ in 0..n {
            let Some(task) = self.tasks.pop_front() else {
                break;
            };
            let fd = task.fd;
            let Some(c) = finish_task(clients, poller, fd) else {
                continue;
            };

            let blocked = !c.output.is_empty();
            match task.cmd {
                Command::Get => match self.index.get(&self.log, &task.argv[1])? {
                    Some(value) => resp::append_bulk_string(&mut c.output, &value),
                    None => resp::append_null_array(&mut c.output),
                },
                Command::Set => {
                    let key = &task.argv[1];
                    let rep = pack_rep(
                        self.log.curr_id(),
                        pack_lengths(key.len(), task.argv[2].len()),
                        self.batch[next_batch],
                    );
                    next_batch += 1;
                    self.index.add(&self.log, key, rep, move |_, slot| {
                        *slot = rep;
                        true
                    })?;
                    resp::append_simple_string(&mut c.output, b"OK");
                }
                Command::Del => {
                    self.index.del(&self.log, &task.argv[1])?;
                    resp::append_simple_string(&mut c.output, b"OK");
                }
                Command::Unsupported => {
                    resp::append_error(&mut c.output, b"Unsupported Command");
                }
            }

            flush_if_unblocked(c, poller, fd, blocked);
        }
        Ok(())
    }

    fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    struct Harness {
        clients: Clients,
        poller: Poller,
        fd: RawFd,
        peer: TcpStream,
    }

    fn harness() -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let (stream, _) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let fd = stream.as_raw_fd();

        let mut clients = Clients::new();
        clients.acquire(fd, Client::new(stream, 0)).unwrap();
        Harness {
            clients,
            poller: Poller::new(1024).unwrap(),
            fd,
            peer,
        }
    }

    impl Harness {
        fn submit(&mut self, executor: &mut DiskExecutor, args: &[&[u8]]) {
            let argv = args.iter().map(|a| Bytes::copy_from_slice(a)).collect();
            if let Some(c) = self.clients.get_mut(self.fd) {
                c.ref_count += 1;
            }
            executor.submit(argv, self.fd);
        }

        fn drain(&mut self, executor: &mut DiskExecutor) {
            let n = executor.task_count();
            executor
                .execute(n, 0, &mut self.clients, &mut self.poller)
                .unwrap();
        }

        fn read_response(&mut self, len: usize) -> Vec<u8> {
            let mut buf = vec![0; len];
            self.peer.read_exact(&mut buf).unwrap();
            buf
        }
    }

    #[test]
    fn set_get_del_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = DiskExecutor::open(dir.path()).unwrap();
        let mut h = harness();

        h.submit(&mut executor, &[b"SET", b"foo", b"bar"]);
        h.submit(&mut executor, &[b"GET", b"foo"]);
        h.drain(&mut executor);
        assert_eq!(h.read_response(14), b"+OK\r\n$3\r\nbar\r\n");

        h.submit(&mut executor, &[b"DEL", b"foo"]);
        h.submit(&mut executor, &[b"GET", b"foo"]);
        h.submit(&mut executor, &[b"DEL", b"foo"]);
        h.drain(&mut executor);
        assert_eq!(h.read_response(15), b"+OK\r\n*-1\r\n+OK\r\n");
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut executor = DiskExecutor::open(dir.path()).unwrap();
            let mut h = harness();
            h.submit(&mut executor, &[b"SET", b"durable", b"yes"]);
            h.drain(&mut executor);
            assert_eq!(h.read_response(5), b"+OK\r\n");
        }

        let mut executor = DiskExecutor::open(dir.path()).unwrap();
        let mut h = harness();
        h.submit(&mut executor, &[b"GET", b"durable"]);
        h.drain(&mut executor);
        assert_eq!(h.read_response(9), b"$3\r\nyes\r\n");
    }

    #[test]
    fn rollover_spreads_records_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        // record size here is 4 + 4 + 8 = 16 bytes; two per segment
        let mut executor = DiskExecutor::open_with_limit(dir.path(), 32).unwrap();
        let mut h = harness();

        for i in 0..6u32 {
            let key = format!("key{}", i);
            let value = format!("value-{:02}", i)[..8].to_string();
            h.submit(&mut executor, &[b"SET", key.as_bytes(), value.as_bytes()]);
            h.drain(&mut executor);
            assert_eq!(h.read_response(5), b"+OK\r\n");
        }
        assert!(executor.log.curr_id() >= 2);

        for i in 0..6u32 {
            let key = format!("key{}", i);
            let value = format!("value-{:02}", i)[..8].to_string();
            h.submit(&mut executor, &[b"GET", key.as_bytes()]);
            h.drain(&mut executor);
            let expect = format!("$8\r\n{}\r\n", value);
            assert_eq!(h.read_response(expect.len()), expect.as_bytes());
        }
    }

    #[test]
    fn closed_client_task_is_consumed_silently() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = DiskExecutor::open(dir.path()).unwrap();
        let mut h = harness();

        h.submit(&mut executor, &[b"SET", b"k", b"v"]);
        if let Some(c) = h.clients.get_mut(h.fd) {
            c.close = true;
        }
        h.drain(&mut executor);
        assert!(h.clients.get(h.fd).is_none());

        // the skipped SET must not have touched the index
        let mut h2 = harness();
        h2.submit(&mut executor, &[b"GET", b"k"]);
        h2.drain(&mut executor);
        assert_eq!(h2.read_response(5), b"*-1\r\n");
    }

    #[test]
    fn unsupported_commands_report_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = DiskExecutor::open(dir.path()).unwrap();
        let mut h = harness();

        h.submit(&mut executor, &[b"EXPIRE", b"k", b"10"]);
        h.drain(&mut executor);
        assert_eq!(h.read_response(22), b"-Unsupported Command\r\n");
    }
}
