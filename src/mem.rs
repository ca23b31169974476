use std::collections::{BTreeMap, VecDeque};
use std::os::unix::io::RawFd;

use bytes::Bytes;

use crate::client::Clients;
use crate::eloop::Poller;
use crate::executor::{finish_task, flush_if_unblocked, Command, Executor, Task};
use crate::resp;

/// In-memory backend: an ordered map of owned byte strings.
pub struct MemExecutor {
    tasks: VecDeque<Task>,
    map: BTreeMap<Bytes, Bytes>,
}

impl MemExecutor {
    pub fn new() -> MemExecutor {
        MemExecutor {
            tasks: VecDeque::new(),
            map: BTreeMap::new(),
        }
    }
}

impl Default for MemExecutor {
    fn default() -> Self {
        MemExecutor::new()
    }
}

impl Executor for MemExecutor {
    fn submit(&mut self, argv: Vec<Bytes>, fd: RawFd) {
        let cmd = Command::classify(&argv);
        self.tasks.push_back(Task { argv, fd, cmd });
    }

    fn execute(
        &mut self,
        n: usize,
        _curr_time: i64,
        clients: &mut Clients,
        poller: &mut Poller,
    ) -> crate::Result<()> {
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
                Command::Get => match self.map.get(&task.argv[1]) {
                    Some(v) => resp::append_bulk_string(&mut c.output, v),
                    None => resp::append_null_array(&mut c.output),
                },
                Command::Set => {
                    let mut args = task.argv.into_iter();
                    if let (Some(k), Some(v)) = (args.nth(1), args.next()) {
                        self.map.insert(k, v);
                    }
                    resp::append_simple_string(&mut c.output, b"OK");
                }
                Command::Del => {
                    self.map.remove(&task.argv[1]);
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
