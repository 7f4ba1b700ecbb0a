//! Terminating a process together with everything it spawned
//!
//! Two strategies sit behind [`TreeTerminator`]: signalling a process
//! group where the OS has one, and enumerating descendants where it does
//! not. [`platform_terminator`] picks one once; call sites never branch on
//! the platform themselves.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use crate::error::RegressResult;

/// Capability to stop a whole process tree
pub trait TreeTerminator: Send + Sync {
    /// Strategy name for logs and reports
    fn name(&self) -> &'static str;

    /// Ask every process in the tree rooted at `root` to exit
    fn terminate_tree(&self, root: u32) -> RegressResult<()>;

    /// Forcefully kill whatever is left of the tree
    fn kill_tree(&self, root: u32) -> RegressResult<()>;

    /// Whether any process of the tree is still running
    fn tree_alive(&self, root: u32) -> bool;
}

/// Strategy for the current platform
pub fn platform_terminator() -> Box<dyn TreeTerminator> {
    #[cfg(unix)]
    {
        Box::new(ProcessGroupTerminator::default())
    }
    #[cfg(windows)]
    {
        Box::new(DescendantTerminator::new(windows_table::CimProcessTable))
    }
}

/// POSIX: signal the process group the root was spawned into
#[cfg(unix)]
#[derive(Default)]
pub struct ProcessGroupTerminator {
    // Resolved on first use; the root may already be reaped later on
    pgid: Mutex<Option<i32>>,
}

#[cfg(unix)]
impl ProcessGroupTerminator {
    fn group(&self, root: u32) -> nix::unistd::Pid {
        use nix::unistd::{getpgid, Pid};

        let mut pgid = self.pgid.lock().unwrap_or_else(|e| e.into_inner());
        let id = *pgid.get_or_insert_with(|| {
            getpgid(Some(Pid::from_raw(root as i32)))
                .map(|p| p.as_raw())
                .unwrap_or(root as i32)
        });
        Pid::from_raw(id)
    }

    fn signal(&self, root: u32, signal: nix::sys::signal::Signal) -> RegressResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;

        let pgid = self.group(root);
        debug!("Sending {} to process group {}", signal, pgid);
        match killpg(pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }
}

#[cfg(unix)]
impl TreeTerminator for ProcessGroupTerminator {
    fn name(&self) -> &'static str {
        "process-group"
    }

    fn terminate_tree(&self, root: u32) -> RegressResult<()> {
        self.signal(root, nix::sys::signal::Signal::SIGTERM)
    }

    fn kill_tree(&self, root: u32) -> RegressResult<()> {
        self.signal(root, nix::sys::signal::Signal::SIGKILL)
    }

    fn tree_alive(&self, root: u32) -> bool {
        let pgid = self.group(root);
        nix::sys::signal::killpg(pgid, None).is_ok() && group_has_live_member(pgid.as_raw())
    }
}

/// Unreaped zombies keep a group signalable; only running members count
#[cfg(target_os = "linux")]
fn group_has_live_member(pgid: i32) -> bool {
    match ProcTable::group_members(pgid) {
        Ok(members) => members.iter().any(|e| e.running),
        Err(_) => true,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn group_has_live_member(_pgid: i32) -> bool {
    true
}

/// One row of the OS process table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    /// False for processes that exited but were not reaped yet
    pub running: bool,
}

/// Source of process listings and a way to stop one process
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> RegressResult<Vec<ProcessEntry>>;

    fn stop(&self, pid: u32, force: bool) -> RegressResult<()>;
}

/// Descendants of `root`, parents before children. `root` is not included.
pub fn descendants(table: &[ProcessEntry], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in table {
        if entry.pid != entry.ppid {
            children.entry(entry.ppid).or_default().push(entry.pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if child != root && !found.contains(&child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }
    found
}

/// Enumerate the root's descendants and stop them, deepest first, then
/// the root itself. The set is remembered because orphaned descendants
/// are re-parented once the root exits.
pub struct DescendantTerminator<T: ProcessTable> {
    table: T,
    targets: Mutex<Vec<u32>>,
}

impl<T: ProcessTable> DescendantTerminator<T> {
    pub fn new(table: T) -> Self {
        Self {
            table,
            targets: Mutex::new(Vec::new()),
        }
    }

    fn refresh_targets(&self, root: u32) -> RegressResult<Vec<u32>> {
        let snapshot = self.table.snapshot()?;
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        for pid in descendants(&snapshot, root).into_iter().chain([root]) {
            if !targets.contains(&pid) {
                targets.push(pid);
            }
        }
        Ok(targets.clone())
    }

    fn stop_all(&self, root: u32, force: bool) -> RegressResult<()> {
        let mut targets = self.refresh_targets(root)?;
        // Deepest processes first, the root last
        targets.retain(|&pid| pid != root);
        targets.reverse();
        targets.push(root);

        for pid in targets {
            debug!("Stopping pid {} (force: {})", pid, force);
            self.table.stop(pid, force)?;
        }
        Ok(())
    }
}

impl<T: ProcessTable> TreeTerminator for DescendantTerminator<T> {
    fn name(&self) -> &'static str {
        "descendants"
    }

    fn terminate_tree(&self, root: u32) -> RegressResult<()> {
        self.stop_all(root, false)
    }

    fn kill_tree(&self, root: u32) -> RegressResult<()> {
        self.stop_all(root, true)
    }

    fn tree_alive(&self, _root: u32) -> bool {
        let targets = self.targets.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match self.table.snapshot() {
            Ok(snapshot) => snapshot
                .iter()
                .any(|e| e.running && targets.contains(&e.pid)),
            // Unknown counts as alive so the caller reports it
            Err(_) => true,
        }
    }
}

/// Process table read from `/proc`
#[cfg(target_os = "linux")]
pub struct ProcTable;

#[cfg(target_os = "linux")]
impl ProcTable {
    /// Parse `/proc/<pid>/stat`. The command name may contain spaces and
    /// parentheses, so fields are counted from the last `)`.
    pub fn parse_stat(stat: &str) -> Option<ProcessEntry> {
        Self::parse_stat_with_group(stat).map(|(entry, _)| entry)
    }

    fn parse_stat_with_group(stat: &str) -> Option<(ProcessEntry, i32)> {
        let (head, tail) = stat.rsplit_once(')')?;
        let pid = head.split_whitespace().next()?.parse().ok()?;
        let mut fields = tail.split_whitespace();
        let state = fields.next()?;
        let ppid = fields.next()?.parse().ok()?;
        let pgrp = fields.next()?.parse().ok()?;
        let entry = ProcessEntry {
            pid,
            ppid,
            running: state != "Z" && state != "X",
        };
        Some((entry, pgrp))
    }

    fn read_stats() -> RegressResult<Vec<String>> {
        let mut stats = Vec::new();
        for dir in std::fs::read_dir("/proc")? {
            let dir = dir?;
            if !dir.file_name().to_string_lossy().chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            // Processes may vanish between listing and reading
            if let Ok(stat) = std::fs::read_to_string(dir.path().join("stat")) {
                stats.push(stat);
            }
        }
        Ok(stats)
    }

    /// Members of process group `pgid`
    pub fn group_members(pgid: i32) -> RegressResult<Vec<ProcessEntry>> {
        Ok(Self::read_stats()?
            .iter()
            .filter_map(|stat| Self::parse_stat_with_group(stat))
            .filter(|(_, pgrp)| *pgrp == pgid)
            .map(|(entry, _)| entry)
            .collect())
    }
}

#[cfg(target_os = "linux")]
impl ProcessTable for ProcTable {
    fn snapshot(&self) -> RegressResult<Vec<ProcessEntry>> {
        Ok(Self::read_stats()?
            .iter()
            .filter_map(|stat| Self::parse_stat(stat))
            .collect())
    }

    fn stop(&self, pid: u32, force: bool) -> RegressResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }
}

/// `<pid> <ppid>` lines as printed by the CIM query. Lines that do not
/// parse, such as PowerShell warnings, are skipped.
#[cfg(any(windows, test))]
fn parse_pid_pairs(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            Some(ProcessEntry {
                pid: parts.next()?.parse().ok()?,
                ppid: parts.next()?.parse().ok()?,
                running: true,
            })
        })
        .collect()
}

#[cfg(windows)]
pub mod windows_table {
    //! Process table via CIM; Windows has no process groups to signal

    use super::{parse_pid_pairs, ProcessTable};
    use crate::command::{run, run_command, CommandSpec};
    use tracing::debug;
    use crate::error::RegressResult;

    pub struct CimProcessTable;

    impl ProcessTable for CimProcessTable {
        fn snapshot(&self) -> RegressResult<Vec<ProcessEntry>> {
            let output = run_command(&CommandSpec::new("powershell").args([
                "-NoProfile",
                "-Command",
                "Get-CimInstance Win32_Process | ForEach-Object { \"$($_.ProcessId) $($_.ParentProcessId)\" }",
            ]))?;
            Ok(parse_pid_pairs(&output))
        }

        fn stop(&self, pid: u32, force: bool) -> RegressResult<()> {
            let mut spec = CommandSpec::new("taskkill").args(["/PID".to_string(), pid.to_string()]);
            if force {
                spec = spec.arg("/F");
            }
            // taskkill also fails for processes that are already gone
            if let Err(e) = run(&spec) {
                debug!("taskkill of {} failed: {}", pid, e);
            }
            Ok(())
        }
    }
}
