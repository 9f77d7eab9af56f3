use crate::prelude::*;
use proctrace::{EventStream, OpenData, Pid};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;

/// Every file each process opened since pst started, in the order the tracer reported them
#[derive(Debug, Default)]
pub struct OpenLog {
    /// Per-process limit, the oldest opens are dropped first. `None` keeps everything.
    capacity: Option<usize>,
    entries: RwLock<HashMap<Pid, VecDeque<OpenData>>>,
}

impl OpenLog {
    /// A `capacity` of 0 means unbounded
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: (capacity > 0).then_some(capacity),
            entries: RwLock::default(),
        }
    }

    pub fn append(&self, pid: Pid, open: OpenData) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let log = entries.entry(pid).or_default();
        if let Some(capacity) = self.capacity {
            while log.len() >= capacity {
                log.pop_front();
            }
        }
        log.push_back(open);
    }

    /// Opens of `pid`, oldest first, empty when none were seen
    pub fn get(&self, pid: Pid) -> Vec<OpenData> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Append every open of `stream` until it closes
    pub fn subscribe(self: &Arc<Self>, mut stream: EventStream<OpenData>) -> JoinHandle<()> {
        let log = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                log.append(event.pid, event.value);
            }
            debug!("Open stream closed, {} processes logged", log.len());
        })
    }

    /// Keep only the logs of the pids matching `keep`
    pub fn retain_pids(&self, mut keep: impl FnMut(Pid) -> bool) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|pid, _| keep(*pid));
    }

    /// Number of processes with at least one logged open
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctrace::Traced;

    fn pid(raw: u32) -> Pid {
        Pid::new(raw).unwrap()
    }

    fn open(fd: i32, path: &str) -> OpenData {
        OpenData {
            fd,
            path: path.to_owned(),
        }
    }

    fn paths(log: &OpenLog, raw: u32) -> Vec<String> {
        log.get(pid(raw)).into_iter().map(|open| open.path).collect()
    }

    #[test]
    fn test_insertion_order_is_preserved() {
        let log = OpenLog::new(0);
        log.append(pid(3), open(3, "/etc/passwd"));
        log.append(pid(4), open(3, "/tmp/other"));
        log.append(pid(3), open(4, "/etc/group"));
        log.append(pid(3), open(3, "/etc/passwd"));

        assert_eq!(paths(&log, 3), ["/etc/passwd", "/etc/group", "/etc/passwd"]);
        assert_eq!(paths(&log, 4), ["/tmp/other"]);
    }

    #[test]
    fn test_unknown_pid_is_empty() {
        let log = OpenLog::new(0);
        assert!(log.get(pid(12345)).is_empty());
        assert!(log.is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let log = OpenLog::new(2);
        for path in ["/a", "/b", "/c"] {
            log.append(pid(1), open(3, path));
        }
        log.append(pid(2), open(3, "/z"));

        assert_eq!(paths(&log, 1), ["/b", "/c"]);
        assert_eq!(paths(&log, 2), ["/z"]);
    }

    #[test]
    fn test_retain_pids() {
        let log = OpenLog::new(0);
        for raw in 1..=4 {
            log.append(pid(raw), open(3, "/dev/null"));
        }
        log.retain_pids(|pid| pid.as_u32() % 2 == 0);

        assert_eq!(log.len(), 2);
        assert!(log.get(pid(1)).is_empty());
        assert_eq!(paths(&log, 2), ["/dev/null"]);
    }

    #[tokio::test]
    async fn test_subscribe_appends_stream() {
        let log = Arc::new(OpenLog::new(0));
        let (tx, rx) = tokio::sync::mpsc::channel(2);
        let task = log.subscribe(rx);

        for (raw, path) in [(7, "/one"), (8, "/two"), (7, "/three")] {
            tx.send(Traced {
                pid: pid(raw),
                value: open(5, path),
            })
            .await
            .unwrap();
        }
        drop(tx);
        task.await.unwrap();

        assert_eq!(paths(&log, 7), ["/one", "/three"]);
        assert_eq!(paths(&log, 8), ["/two"]);
    }
}
