use crate::prelude::*;
use crate::proc_table::ProcessTable;
use proctrace::pid::sort_for_display;
use proctrace::{EventStream, ExecData, Pid};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;

/// What the cache remembers about a process between reads
#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedProcess {
    ppid: Option<Pid>,
    command: String,
}

/// A process as shown by the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    pub command: String,
    /// Read from the process table on every lookup, never cached
    pub children: Vec<Pid>,
}

/// Merged view of the process table: a snapshot taken at startup, overlaid with every exec
/// seen by the tracer since then.
pub struct ProcessCache {
    table: Arc<dyn ProcessTable>,
    entries: RwLock<HashMap<Pid, CachedProcess>>,
    bootstrapped: AtomicBool,
}

impl ProcessCache {
    /// Create the cache and take the startup snapshot
    pub fn new(table: Arc<dyn ProcessTable>) -> Result<Self> {
        let cache = Self {
            table,
            entries: RwLock::new(HashMap::new()),
            bootstrapped: AtomicBool::new(false),
        };
        cache.bootstrap()?;
        Ok(cache)
    }

    /// Insert every live process with its command name, the parent is left unknown.
    ///
    /// Only the first call does anything, later calls return 0.
    pub fn bootstrap(&self) -> Result<usize> {
        if self.bootstrapped.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }

        let pids = self
            .table
            .all_pids()
            .context("Failed to list the running processes")?;

        // Read the table outside the lock, this touches /proc once per process
        let snapshot: Vec<(Pid, String)> = pids
            .into_iter()
            .filter_map(|pid| self.table.command(pid).map(|command| (pid, command)))
            .collect();
        let inserted = snapshot.len();

        let mut entries = self.write();
        for (pid, command) in snapshot {
            // An exec applied meanwhile is newer than the snapshot
            entries
                .entry(pid)
                .or_insert(CachedProcess { ppid: None, command });
        }
        debug!("Process cache bootstrapped with {inserted} processes");
        Ok(inserted)
    }

    /// Overwrite the cached entry with what the tracer reported
    pub fn apply_exec(&self, pid: Pid, exec: ExecData) {
        trace!("exec {pid}: {} (parent {:?})", exec.command, exec.ppid);
        self.write().insert(
            pid,
            CachedProcess {
                ppid: exec.ppid,
                command: exec.command,
            },
        );
    }

    /// Apply every exec of `stream` until it closes
    pub fn subscribe(self: &Arc<Self>, mut stream: EventStream<ExecData>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut applied = 0usize;
            while let Some(event) = stream.recv().await {
                cache.apply_exec(event.pid, event.value);
                applied += 1;
            }
            debug!("Exec stream closed after {applied} events");
        })
    }

    /// Look a process up, probing the process table on a miss.
    ///
    /// A process the table cannot describe yields an empty command.
    pub fn get_process(&self, pid: Pid) -> ProcessRecord {
        let cached = self.read().get(&pid).cloned();
        let entry = match cached {
            Some(entry) => entry,
            None => {
                let probed = CachedProcess {
                    ppid: None,
                    command: self.table.command(pid).unwrap_or_default(),
                };
                self.write().entry(pid).or_insert(probed).clone()
            }
        };
        self.record(pid, entry)
    }

    /// Every cached process whose command contains `filter`, in pid display order
    pub fn get_processes(&self, filter: &str) -> Vec<ProcessRecord> {
        let matching: Vec<(Pid, CachedProcess)> = self
            .read()
            .iter()
            .filter(|(_, entry)| entry.command.contains(filter))
            .map(|(pid, entry)| (*pid, entry.clone()))
            .sorted_by(|(a, _), (b, _)| a.display_cmp(b))
            .collect();

        matching
            .into_iter()
            .map(|(pid, entry)| self.record(pid, entry))
            .collect()
    }

    /// Current children of `pid`, empty when they cannot be read
    pub fn children(&self, pid: Pid) -> Vec<Pid> {
        match self.table.children(pid) {
            Ok(mut children) => {
                sort_for_display(&mut children);
                children
            }
            Err(e) => {
                trace!("No children for {pid}: {e:#}");
                Vec::new()
            }
        }
    }

    /// Drop the entries of processes that no longer exist and return their pids
    pub fn reap_exited(&self) -> Vec<Pid> {
        let cached: Vec<Pid> = self.read().keys().copied().collect();
        let exited: Vec<Pid> = cached
            .into_iter()
            .filter(|pid| !self.table.is_alive(*pid))
            .collect();

        if !exited.is_empty() {
            let mut entries = self.write();
            for pid in &exited {
                entries.remove(pid);
            }
            debug!("Reaped {} exited processes", exited.len());
        }
        exited
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, pid: Pid, entry: CachedProcess) -> ProcessRecord {
        ProcessRecord {
            pid,
            ppid: entry.ppid,
            command: entry.command,
            children: self.children(pid),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Pid, CachedProcess>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Pid, CachedProcess>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc_table::testing::{FakeProcess, FakeProcessTable, pid};
    use proctrace::Traced;
    use rstest::rstest;

    fn exec(ppid: u32, command: &str) -> ExecData {
        ExecData {
            ppid: Pid::new(ppid),
            command: command.to_owned(),
        }
    }

    fn cache_over(commands: &[(u32, &str)]) -> (Arc<FakeProcessTable>, ProcessCache) {
        let table = Arc::new(FakeProcessTable::with_commands(commands));
        let cache = ProcessCache::new(table.clone()).unwrap();
        (table, cache)
    }

    fn pids(records: &[ProcessRecord]) -> Vec<u32> {
        records.iter().map(|record| record.pid.as_u32()).collect()
    }

    #[test]
    fn test_bootstrap_runs_once() {
        let (table, cache) = cache_over(&[(1, "init"), (2, "kthreadd")]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_process(pid(1)).ppid, None);

        table.insert(
            pid(3),
            FakeProcess {
                command: "late".into(),
                ..Default::default()
            },
        );
        assert_eq!(cache.bootstrap().unwrap(), 0);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_exec_overlay_last_write_wins() {
        let (_table, cache) = cache_over(&[(5, "sh")]);

        cache.apply_exec(pid(5), exec(1, "bash"));
        cache.apply_exec(pid(5), exec(1, "vim"));
        cache.apply_exec(pid(9), exec(5, "ls"));

        let record = cache.get_process(pid(5));
        assert_eq!(record.command, "vim");
        assert_eq!(record.ppid, Some(pid(1)));
        assert_eq!(cache.get_process(pid(9)).command, "ls");
    }

    #[test]
    fn test_miss_probes_the_table_once() {
        let (table, cache) = cache_over(&[]);
        table.insert(
            pid(77),
            FakeProcess {
                command: "late".into(),
                ..Default::default()
            },
        );

        assert_eq!(cache.get_process(pid(77)).command, "late");
        table.remove(pid(77));
        assert_eq!(cache.get_process(pid(77)).command, "late");

        // Unknown to everyone: empty defaults, never an error
        let unknown = cache.get_process(pid(4242));
        assert_eq!(unknown.command, "");
        assert_eq!(unknown.ppid, None);
        assert!(unknown.children.is_empty());
    }

    #[rstest]
    #[case("", vec![1, 5, 12, 100])]
    #[case("ba", vec![5, 100])]
    #[case("bash", vec![5])]
    #[case("Bash", vec![])]
    #[case("zz-no-such-proc", vec![])]
    fn test_filter(#[case] filter: &str, #[case] expected: Vec<u32>) {
        let (_table, cache) =
            cache_over(&[(100, "sbatch"), (12, "sshd"), (5, "bash"), (1, "init")]);
        assert_eq!(pids(&cache.get_processes(filter)), expected);
    }

    #[test]
    fn test_listing_uses_display_order() {
        let (_table, cache) = cache_over(&[(10, "a"), (9, "a"), (100, "a"), (2, "a")]);
        assert_eq!(pids(&cache.get_processes("a")), vec![2, 9, 10, 100]);
    }

    #[test]
    fn test_children_are_never_cached() {
        let (table, cache) = cache_over(&[(1, "init"), (20, "a"), (3, "b")]);
        table.set_children(pid(1), &[20]);
        assert_eq!(cache.get_process(pid(1)).children, vec![pid(20)]);

        table.set_children(pid(1), &[20, 3]);
        assert_eq!(cache.get_process(pid(1)).children, vec![pid(3), pid(20)]);
        assert_eq!(cache.children(pid(1)), vec![pid(3), pid(20)]);

        table.remove(pid(1));
        assert!(cache.children(pid(1)).is_empty());
        assert_eq!(cache.get_process(pid(1)).command, "init");
    }

    #[test]
    fn test_concurrent_writers_lose_no_update() {
        let (_table, cache) = cache_over(&[]);
        let cache = Arc::new(cache);

        std::thread::scope(|scope| {
            for writer in 0..8u32 {
                let cache = &cache;
                scope.spawn(move || {
                    for i in 1..=250u32 {
                        let raw = writer * 1000 + i;
                        cache.apply_exec(pid(raw), exec(1, &format!("cmd{raw}")));
                        if i % 50 == 0 {
                            assert!(!cache.get_processes("cmd").is_empty());
                        }
                    }
                });
            }
        });

        assert_eq!(cache.len(), 2000);
        assert_eq!(cache.get_process(pid(7250)).command, "cmd7250");
    }

    #[test]
    fn test_probe_never_overwrites_concurrent_execs() {
        let (table, cache) = cache_over(&[]);
        // Known to the table only, every first lookup is a miss going through the probe
        for raw in 1..=16u32 {
            table.insert(
                pid(raw),
                FakeProcess {
                    command: format!("probed{raw}"),
                    ..Default::default()
                },
            );
        }
        let cache = Arc::new(cache);

        std::thread::scope(|scope| {
            for writer in 0..4u32 {
                let cache = &cache;
                scope.spawn(move || {
                    for round in 0..100u32 {
                        for raw in 1..=16u32 {
                            cache.apply_exec(pid(raw), exec(1, &format!("w{writer}r{round}-{raw}")));
                        }
                    }
                });
            }
            for _ in 0..4 {
                let cache = &cache;
                scope.spawn(move || {
                    for _ in 0..100 {
                        for raw in (1..=16u32).rev() {
                            let record = cache.get_process(pid(raw));
                            assert!(
                                record.command == format!("probed{raw}")
                                    || record.command.ends_with(&format!("-{raw}")),
                                "{raw}: {}",
                                record.command
                            );
                        }
                    }
                });
            }
        });

        // Every writer ran to completion, a late probe must not have replaced its value
        assert_eq!(cache.len(), 16);
        for raw in 1..=16u32 {
            let record = cache.get_process(pid(raw));
            assert!(
                record.command.starts_with('w') && record.command.ends_with(&format!("r99-{raw}")),
                "{raw}: {}",
                record.command
            );
            assert_eq!(record.ppid, Some(pid(1)));
        }
    }

    #[test]
    fn test_reap_exited() {
        let (table, cache) = cache_over(&[(1, "init"), (2, "a"), (3, "b")]);
        cache.apply_exec(pid(44), exec(1, "gone-already"));
        table.remove(pid(2));

        let mut reaped = cache.reap_exited();
        reaped.sort();
        assert_eq!(reaped, vec![pid(2), pid(44)]);
        assert_eq!(pids(&cache.get_processes("")), vec![1, 3]);
        assert!(cache.reap_exited().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_applies_stream() {
        let (_table, cache) = cache_over(&[(5, "sh")]);
        let cache = Arc::new(cache);
        let (tx, rx) = tokio::sync::mpsc::channel(4);

        let task = cache.subscribe(rx);
        for (raw, command) in [(5, "bash"), (6, "ls"), (5, "vim")] {
            tx.send(Traced {
                pid: pid(raw),
                value: exec(1, command),
            })
            .await
            .unwrap();
        }
        drop(tx);
        task.await.unwrap();

        assert_eq!(cache.get_process(pid(5)).command, "vim");
        assert_eq!(cache.get_process(pid(6)).command, "ls");
    }
}
