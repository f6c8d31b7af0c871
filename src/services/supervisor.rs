//! # Process Supervisor
//!
//! Starts a backing service as a detached child process when it is absent and
//! terminates every process that belongs to a known service name.
//!
//! ## Key behaviours:
//! - **Non-blocking start**: the launch command is spawned and left running; readiness
//!   is established separately by re-probing the service's port
//! - **Isolated termination**: a failure to kill one process never stops the others;
//!   every process gets its own entry in the report
//! - **Bounded wait**: each killed process is polled until it exits or the termination
//!   deadline passes
//!
//! OS access goes through the [`ProcessTable`] trait so the supervisor can be exercised
//! against a fake table in tests.

use serde::Serialize;
use std::fmt;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, System};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::BackingServiceDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("process {0} refused the kill signal")]
    KillRefused(u32),
    #[error("process table task failed: {0}")]
    Join(String),
}

/// A running process matched by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

/// Access to the operating system's process table.
pub trait ProcessTable: Send + Sync {
    fn find_by_name(&self, name: &str) -> Vec<ProcessEntry>;

    /// Launch the service without waiting for it. Returns the child pid.
    fn spawn(&self, descriptor: &BackingServiceDescriptor) -> std::io::Result<u32>;

    fn terminate(&self, pid: u32) -> Result<(), SupervisorError>;

    fn is_running(&self, pid: u32) -> bool;
}

/// [`ProcessTable`] backed by `sysinfo` and `std::process`.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn find_by_name(&self, name: &str) -> Vec<ProcessEntry> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes();
        system
            .processes_by_exact_name(name)
            .filter(|process| process.status() != ProcessStatus::Zombie)
            .map(|process| ProcessEntry {
                pid: process.pid().as_u32(),
                name: process.name().to_string(),
            })
            .collect()
    }

    fn spawn(&self, descriptor: &BackingServiceDescriptor) -> std::io::Result<u32> {
        let mut command = Command::new(&descriptor.launch.program);
        command
            .args(&descriptor.launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let Some(dir) = &descriptor.working_dir {
            command.current_dir(dir);
        }

        // Own process group on unix, no console on windows.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            command.creation_flags(DETACHED_PROCESS);
        }

        let mut child = command.spawn()?;
        let pid = child.id();

        // Reaper; the child is never waited on otherwise.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> Result<(), SupervisorError> {
        let system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let process = system
            .process(Pid::from_u32(pid))
            .ok_or(SupervisorError::NotFound(pid))?;
        if process.kill() {
            Ok(())
        } else {
            Err(SupervisorError::KillRefused(pid))
        }
    }

    fn is_running(&self, pid: u32) -> bool {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return false;
        }
        system
            .process(pid)
            .map(|process| process.status() != ProcessStatus::Zombie)
            .unwrap_or(false)
    }
}

/// Result of [`ProcessSupervisor::ensure_started`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning { pids: Vec<u32> },
    Started { pid: u32 },
    StartFailed { reason: String },
}

impl fmt::Display for StartOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartOutcome::AlreadyRunning { pids } => write!(f, "already running (pids {:?})", pids),
            StartOutcome::Started { pid } => write!(f, "started (pid {})", pid),
            StartOutcome::StartFailed { reason } => write!(f, "start failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum TerminationResult {
    Terminated,
    Failed(String),
    TimedOut,
}

/// Outcome for one process matched during [`ProcessSupervisor::terminate_all`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessTermination {
    pub service: String,
    /// `None` when the process lookup itself failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(flatten)]
    pub result: TerminationResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TerminationReport {
    pub processes: Vec<ProcessTermination>,
}

impl TerminationReport {
    pub fn is_clean(&self) -> bool {
        self.processes
            .iter()
            .all(|entry| entry.result == TerminationResult::Terminated)
    }

    /// One line per process, for the `{result, content}` envelope.
    pub fn summary(&self) -> String {
        self.processes
            .iter()
            .map(|entry| {
                let target = match entry.pid {
                    Some(pid) => format!("{} (pid {})", entry.service, pid),
                    None => entry.service.clone(),
                };
                match &entry.result {
                    TerminationResult::Terminated => format!("{}: terminated", target),
                    TerminationResult::Failed(reason) => format!("{}: failed: {}", target, reason),
                    TerminationResult::TimedOut => format!("{}: did not exit in time", target),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct ProcessSupervisor {
    table: Arc<dyn ProcessTable>,
    terminate_timeout: Duration,
    poll_interval: Duration,
}

impl ProcessSupervisor {
    pub fn new(table: Arc<dyn ProcessTable>, terminate_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            table,
            terminate_timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Start the service unless a process with its name already exists.
    ///
    /// Never waits for the service to become reachable.
    pub async fn ensure_started(&self, descriptor: &BackingServiceDescriptor) -> StartOutcome {
        let table = Arc::clone(&self.table);
        let descriptor = descriptor.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let running = table.find_by_name(&descriptor.name);
            if !running.is_empty() {
                return StartOutcome::AlreadyRunning {
                    pids: running.iter().map(|entry| entry.pid).collect(),
                };
            }

            info!(service = %descriptor.kind, command = %descriptor.launch, "no {} process, launching", descriptor.name);
            match table.spawn(&descriptor) {
                Ok(pid) => StartOutcome::Started { pid },
                Err(err) => StartOutcome::StartFailed {
                    reason: format!("could not launch `{}`: {}", descriptor.launch, err),
                },
            }
        })
        .await;

        outcome.unwrap_or_else(|err| StartOutcome::StartFailed {
            reason: SupervisorError::Join(err.to_string()).to_string(),
        })
    }

    /// Terminate every process matching any of `service_names`.
    pub async fn terminate_all(&self, service_names: &[String]) -> TerminationReport {
        let mut report = TerminationReport::default();

        for name in service_names {
            let table = Arc::clone(&self.table);
            let lookup = name.clone();
            let entries = match tokio::task::spawn_blocking(move || table.find_by_name(&lookup)).await {
                Ok(entries) => entries,
                Err(err) => {
                    error!(service = %name, error = %err, "process lookup failed");
                    report.processes.push(ProcessTermination {
                        service: name.clone(),
                        pid: None,
                        result: TerminationResult::Failed(SupervisorError::Join(err.to_string()).to_string()),
                    });
                    continue;
                }
            };

            if entries.is_empty() {
                debug!(service = %name, "no running process");
            }

            for entry in entries {
                let result = self.terminate_one(entry.pid).await;
                match &result {
                    TerminationResult::Terminated => info!(service = %name, pid = entry.pid, "process terminated"),
                    TerminationResult::Failed(reason) => {
                        warn!(service = %name, pid = entry.pid, reason = %reason, "failed to terminate process")
                    }
                    TerminationResult::TimedOut => {
                        warn!(service = %name, pid = entry.pid, "process did not exit before the deadline")
                    }
                }
                report.processes.push(ProcessTermination {
                    service: name.clone(),
                    pid: Some(entry.pid),
                    result,
                });
            }
        }

        report
    }

    async fn terminate_one(&self, pid: u32) -> TerminationResult {
        let table = Arc::clone(&self.table);
        match tokio::task::spawn_blocking(move || table.terminate(pid)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return TerminationResult::Failed(err.to_string()),
            Err(err) => return TerminationResult::Failed(SupervisorError::Join(err.to_string()).to_string()),
        }

        let deadline = Instant::now() + self.terminate_timeout;
        loop {
            let table = Arc::clone(&self.table);
            match tokio::task::spawn_blocking(move || table.is_running(pid)).await {
                Ok(false) => return TerminationResult::Terminated,
                Ok(true) => {}
                Err(err) => return TerminationResult::Failed(SupervisorError::Join(err.to_string()).to_string()),
            }
            if Instant::now() >= deadline {
                return TerminationResult::TimedOut;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// In-memory process table.
    #[derive(Default)]
    pub struct FakeProcessTable {
        pub processes: Mutex<HashMap<String, Vec<u32>>>,
        pub refuse_kill: Mutex<HashSet<u32>>,
        pub ignore_kill: Mutex<HashSet<u32>>,
        pub fail_spawn: Mutex<HashSet<String>>,
        pub spawned: Mutex<Vec<String>>,
        pub kill_attempts: AtomicUsize,
        next_pid: AtomicU32,
    }

    impl FakeProcessTable {
        pub fn with_processes(processes: &[(&str, &[u32])]) -> Self {
            let table = Self::default();
            {
                let mut map = table.processes.lock().unwrap();
                for (name, pids) in processes {
                    map.insert(name.to_string(), pids.to_vec());
                }
            }
            table
        }

        pub fn spawn_count(&self) -> usize {
            self.spawned.lock().unwrap().len()
        }
    }

    impl ProcessTable for FakeProcessTable {
        fn find_by_name(&self, name: &str) -> Vec<ProcessEntry> {
            self.processes
                .lock()
                .unwrap()
                .get(name)
                .map(|pids| {
                    pids.iter()
                        .map(|pid| ProcessEntry { pid: *pid, name: name.to_string() })
                        .collect()
                })
                .unwrap_or_default()
        }

        fn spawn(&self, descriptor: &BackingServiceDescriptor) -> std::io::Result<u32> {
            if self.fail_spawn.lock().unwrap().contains(&descriptor.name) {
                return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "program not found"));
            }
            let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.spawned.lock().unwrap().push(descriptor.name.clone());
            self.processes
                .lock()
                .unwrap()
                .entry(descriptor.name.clone())
                .or_default()
                .push(pid);
            Ok(pid)
        }

        fn terminate(&self, pid: u32) -> Result<(), SupervisorError> {
            self.kill_attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse_kill.lock().unwrap().contains(&pid) {
                return Err(SupervisorError::KillRefused(pid));
            }
            if self.ignore_kill.lock().unwrap().contains(&pid) {
                return Ok(());
            }
            for pids in self.processes.lock().unwrap().values_mut() {
                pids.retain(|candidate| *candidate != pid);
            }
            Ok(())
        }

        fn is_running(&self, pid: u32) -> bool {
            self.processes
                .lock()
                .unwrap()
                .values()
                .any(|pids| pids.contains(&pid))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeProcessTable;
    use super::*;
    use crate::services::testing::descriptor;
    use crate::services::ServiceKind;
    use std::sync::atomic::Ordering;

    fn supervisor(table: Arc<FakeProcessTable>) -> ProcessSupervisor {
        ProcessSupervisor::new(table, Duration::from_millis(30), Duration::from_millis(5))
    }

    fn names() -> Vec<String> {
        vec!["ollama".to_string(), "chroma".to_string(), "faster-whisper".to_string()]
    }

    #[tokio::test]
    async fn test_ensure_started_reports_existing_process() {
        let table = Arc::new(FakeProcessTable::with_processes(&[("ollama", &[42])]));
        let outcome = supervisor(table.clone())
            .ensure_started(&descriptor(ServiceKind::Generation))
            .await;

        assert_eq!(outcome, StartOutcome::AlreadyRunning { pids: vec![42] });
        assert_eq!(table.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_ensure_started_spawns_missing_process() {
        let table = Arc::new(FakeProcessTable::default());
        let outcome = supervisor(table.clone())
            .ensure_started(&descriptor(ServiceKind::VectorStore))
            .await;

        assert!(matches!(outcome, StartOutcome::Started { .. }));
        assert_eq!(table.spawned.lock().unwrap().as_slice(), ["chroma".to_string()]);
    }

    #[tokio::test]
    async fn test_ensure_started_reports_launch_failure() {
        let table = Arc::new(FakeProcessTable::default());
        table.fail_spawn.lock().unwrap().insert("faster-whisper".to_string());

        let outcome = supervisor(table)
            .ensure_started(&descriptor(ServiceKind::Transcription))
            .await;

        match outcome {
            StartOutcome::StartFailed { reason } => assert!(reason.contains("program not found")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminate_all_continues_after_failure() {
        let table = Arc::new(FakeProcessTable::with_processes(&[
            ("ollama", &[10, 11]),
            ("chroma", &[20]),
            ("faster-whisper", &[30]),
        ]));
        table.refuse_kill.lock().unwrap().insert(10);

        let report = supervisor(table.clone()).terminate_all(&names()).await;

        assert_eq!(table.kill_attempts.load(Ordering::SeqCst), 4);
        assert_eq!(report.processes.len(), 4);
        assert!(matches!(report.processes[0].result, TerminationResult::Failed(_)));
        assert_eq!(report.processes[0].pid, Some(10));
        for entry in &report.processes[1..] {
            assert_eq!(entry.result, TerminationResult::Terminated, "pid {:?}", entry.pid);
        }
        assert!(!report.is_clean());
        assert!(report.summary().contains("ollama (pid 10): failed"));
    }

    #[tokio::test]
    async fn test_terminate_all_reports_hung_process() {
        let table = Arc::new(FakeProcessTable::with_processes(&[("chroma", &[20])]));
        table.ignore_kill.lock().unwrap().insert(20);

        let report = supervisor(table).terminate_all(&names()).await;

        assert_eq!(report.processes.len(), 1);
        assert_eq!(report.processes[0].result, TerminationResult::TimedOut);
    }

    /// Table whose lookups or kills panic inside the blocking task.
    struct PanickingTable {
        panic_on_lookup: bool,
    }

    impl ProcessTable for PanickingTable {
        fn find_by_name(&self, name: &str) -> Vec<ProcessEntry> {
            if self.panic_on_lookup {
                panic!("process table unavailable");
            }
            vec![ProcessEntry { pid: 7, name: name.to_string() }]
        }

        fn spawn(&self, _descriptor: &BackingServiceDescriptor) -> std::io::Result<u32> {
            Ok(1)
        }

        fn terminate(&self, _pid: u32) -> Result<(), SupervisorError> {
            panic!("kill syscall crashed");
        }

        fn is_running(&self, _pid: u32) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_terminate_all_records_failed_lookup() {
        let supervisor = ProcessSupervisor::new(
            Arc::new(PanickingTable { panic_on_lookup: true }),
            Duration::from_millis(30),
            Duration::from_millis(5),
        );

        let report = supervisor.terminate_all(&["ollama".to_string(), "chroma".to_string()]).await;

        assert_eq!(report.processes.len(), 2);
        assert_eq!(report.processes[0].service, "ollama");
        assert_eq!(report.processes[0].pid, None);
        assert!(matches!(report.processes[0].result, TerminationResult::Failed(_)));
        assert!(!report.is_clean());
        assert!(report.summary().starts_with("ollama: failed: process table task failed"));
    }

    #[tokio::test]
    async fn test_terminate_one_reports_crashed_kill() {
        let supervisor = ProcessSupervisor::new(
            Arc::new(PanickingTable { panic_on_lookup: false }),
            Duration::from_millis(30),
            Duration::from_millis(5),
        );

        let report = supervisor.terminate_all(&["chroma".to_string()]).await;

        assert_eq!(report.processes.len(), 1);
        assert_eq!(report.processes[0].pid, Some(7));
        match &report.processes[0].result {
            TerminationResult::Failed(reason) => assert!(reason.starts_with("process table task failed")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminate_all_with_nothing_running() {
        let table = Arc::new(FakeProcessTable::default());
        let report = supervisor(table).terminate_all(&names()).await;
        assert!(report.processes.is_empty());
        assert!(report.is_clean());
    }
}
