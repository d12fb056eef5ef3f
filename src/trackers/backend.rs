use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use sysinfo::System;
use chrono::Utc;

use crate::events::{BackendMode, ExitInfo, ProcessScan, ProcessSnapshot};

#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend cannot run on this host (missing kernel feature,
    /// insufficient privilege, unsupported platform). Triggers fallback.
    #[error("backend capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// The backend became permanently unusable mid-run.
    #[error("backend failed: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Source of process observations.
///
/// `scan` returns the full current process table plus per-pid read
/// failures and observed exits; it must never block unboundedly.
pub trait ProcessBackend: Send {
    fn mode(&self) -> BackendMode;
    fn scan(&mut self) -> Result<ProcessScan, BackendError>;
    fn shutdown(&mut self) {}
}

/// Pick the highest-fidelity backend available on this host.
///
/// Kernel-event initialization failure is not fatal; it logs a warning and
/// falls back to polling.
pub fn select_backend(prefer_kernel: bool) -> Box<dyn ProcessBackend> {
    if prefer_kernel {
        match KernelBackend::create() {
            Ok(backend) => {
                info!("Process backend: kernel events (netlink proc connector)");
                return Box::new(backend);
            }
            Err(e) => {
                warn!("Kernel-event backend unavailable, falling back to polling: {}", e);
            }
        }
    }
    info!("Process backend: polling");
    Box::new(PollingBackend::new())
}

/// Convert a sysinfo process entry into a snapshot.
fn snapshot_from(pid: u32, process: &sysinfo::Process) -> ProcessSnapshot {
    let cmd = process.cmd();
    let (command, args) = if cmd.is_empty() {
        (process.name().to_string(), Vec::new())
    } else {
        (cmd[0].clone(), cmd[1..].to_vec())
    };

    ProcessSnapshot {
        pid,
        parent_pid: process.parent().map(|p| p.as_u32()),
        name: process.name().to_string(),
        command,
        args,
        exe_path: process.exe().map(|p| p.display().to_string()),
        working_dir: process.cwd().map(|p| p.display().to_string()),
        user: process.user_id().map(|u| u.to_string()),
        cpu_percent: Some(process.cpu_usage()),
        memory_bytes: Some(process.memory()),
        started_at: chrono::DateTime::from_timestamp(process.start_time() as i64, 0)
            .unwrap_or_else(Utc::now),
    }
}

/// Cross-platform polling backend over sysinfo.
pub struct PollingBackend {
    system: System,
}

impl PollingBackend {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
        }
    }
}

impl Default for PollingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessBackend for PollingBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Polling
    }

    fn scan(&mut self) -> Result<ProcessScan, BackendError> {
        self.system.refresh_processes();

        let mut scan = ProcessScan::default();
        for (pid, process) in self.system.processes() {
            let pid_val = pid.as_u32();
            scan.processes.insert(pid_val, snapshot_from(pid_val, process));
        }

        Ok(scan)
    }
}

/// Raw event read off the netlink proc connector.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
enum KernelEvent {
    Fork { parent: u32, child: u32 },
    Exec { pid: u32 },
    Exit { pid: u32, status: i32 },
}

/// Kernel-event backend: netlink process-events connector.
///
/// A reader thread drains fork/exec/exit notifications into a channel;
/// `scan` applies pending events to an internally maintained table and
/// refreshes metrics for live entries. Requires Linux and the privilege to
/// bind the connector multicast group.
#[cfg(target_os = "linux")]
pub struct KernelBackend {
    socket_fd: std::os::unix::io::RawFd,
    events: crossbeam::channel::Receiver<KernelEvent>,
    reader: Option<std::thread::JoinHandle<()>>,
    running: std::sync::Arc<std::sync::atomic::AtomicBool>,
    reader_failed: std::sync::Arc<std::sync::atomic::AtomicBool>,
    system: System,
    table: HashMap<u32, ProcessSnapshot>,
}

#[cfg(target_os = "linux")]
impl KernelBackend {
    pub fn create() -> Result<Self, BackendError> {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let socket_fd = netlink::open_proc_connector()
            .map_err(|e| BackendError::CapabilityUnavailable(e.to_string()))?;

        let (tx, rx) = crossbeam::channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let reader_failed = Arc::new(AtomicBool::new(false));

        let thread_running = running.clone();
        let thread_failed = reader_failed.clone();
        let reader = std::thread::Builder::new()
            .name("agentwatch-netlink".to_string())
            .spawn(move || {
                netlink::reader_loop(socket_fd, tx, thread_running, thread_failed);
            })
            .map_err(BackendError::Io)?;

        // Seed the table with the processes already running.
        let mut system = System::new_all();
        system.refresh_processes();
        let mut table = HashMap::new();
        for (pid, process) in system.processes() {
            let pid_val = pid.as_u32();
            table.insert(pid_val, snapshot_from(pid_val, process));
        }

        Ok(Self {
            socket_fd,
            events: rx,
            reader: Some(reader),
            running,
            reader_failed,
            system,
            table,
        })
    }

    /// Read one pid's details from the OS; `None` means the process
    /// vanished mid-read.
    fn enrich(&mut self, pid: u32) -> Option<ProcessSnapshot> {
        let sys_pid = sysinfo::Pid::from_u32(pid);
        if !self.system.refresh_process(sys_pid) {
            return None;
        }
        self.system.process(sys_pid).map(|p| snapshot_from(pid, p))
    }
}

#[cfg(target_os = "linux")]
impl ProcessBackend for KernelBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::KernelEvents
    }

    fn scan(&mut self) -> Result<ProcessScan, BackendError> {
        use std::sync::atomic::Ordering;

        if self.reader_failed.load(Ordering::Relaxed) {
            return Err(BackendError::Fatal(
                "netlink reader thread terminated".to_string(),
            ));
        }

        let mut scan = ProcessScan::default();

        // Apply pending kernel events to the table.
        while let Ok(event) = self.events.try_recv() {
            match event {
                KernelEvent::Fork { parent, child } => {
                    match self.enrich(child) {
                        Some(mut snapshot) => {
                            if snapshot.parent_pid.is_none() {
                                snapshot.parent_pid = Some(parent);
                            }
                            self.table.insert(child, snapshot);
                        }
                        None => {
                            // Vanished between fork and read; omit this
                            // cycle, exit event will reconcile.
                            debug!("Fork enrichment failed for pid {}", child);
                            scan.failed_reads.insert(child);
                        }
                    }
                }
                KernelEvent::Exec { pid } => {
                    // Command line and exe change on exec; re-read them.
                    if let Some(snapshot) = self.enrich(pid) {
                        self.table.insert(pid, snapshot);
                    } else if !self.table.contains_key(&pid) {
                        scan.failed_reads.insert(pid);
                    }
                }
                KernelEvent::Exit { pid, status } => {
                    self.table.remove(&pid);
                    scan.exits.insert(pid, ExitInfo::from_wait_status(status));
                }
            }
        }

        // Refresh metrics for live entries.
        let pids: Vec<u32> = self.table.keys().copied().collect();
        for pid in pids {
            let sys_pid = sysinfo::Pid::from_u32(pid);
            if self.system.refresh_process(sys_pid) {
                if let Some(process) = self.system.process(sys_pid) {
                    if let Some(entry) = self.table.get_mut(&pid) {
                        entry.cpu_percent = Some(process.cpu_usage());
                        entry.memory_bytes = Some(process.memory());
                    }
                }
            } else if !scan.exits.contains_key(&pid) {
                // Gone from /proc but no exit event drained yet; keep the
                // entry and let the event reconcile it.
                scan.failed_reads.insert(pid);
            }
        }

        scan.processes = self.table.clone();
        Ok(scan)
    }

    fn shutdown(&mut self) {
        use std::sync::atomic::Ordering;

        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        netlink::close_proc_connector(self.socket_fd);
    }
}

#[cfg(target_os = "linux")]
impl Drop for KernelBackend {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.shutdown();
        }
    }
}

/// Stub on non-Linux hosts; selection always falls through to polling.
#[cfg(not(target_os = "linux"))]
pub struct KernelBackend;

#[cfg(not(target_os = "linux"))]
impl KernelBackend {
    pub fn create() -> Result<Self, BackendError> {
        Err(BackendError::CapabilityUnavailable(
            "netlink proc connector requires Linux".to_string(),
        ))
    }
}

#[cfg(not(target_os = "linux"))]
impl ProcessBackend for KernelBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::KernelEvents
    }

    fn scan(&mut self) -> Result<ProcessScan, BackendError> {
        Err(BackendError::Fatal("unsupported platform".to_string()))
    }
}

/// Netlink proc connector plumbing.
///
/// Message layout: nlmsghdr (16 bytes), cn_msg (20 bytes), proc_event
/// payload (what, cpu, timestamp_ns, then the per-type fields). Offsets are
/// decoded manually so no repr(C) unions are needed.
#[cfg(target_os = "linux")]
mod netlink {
    use crossbeam::channel::Sender;
    use std::io;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tracing::warn;

    use super::KernelEvent;

    const CN_IDX_PROC: u32 = 1;
    const CN_VAL_PROC: u32 = 1;
    const PROC_CN_MCAST_LISTEN: u32 = 1;
    const PROC_CN_MCAST_IGNORE: u32 = 2;

    const PROC_EVENT_FORK: u32 = 0x0000_0001;
    const PROC_EVENT_EXEC: u32 = 0x0000_0002;
    const PROC_EVENT_EXIT: u32 = 0x8000_0000;

    const NLMSG_HDR_LEN: usize = 16;
    const CN_MSG_LEN: usize = 20;
    /// proc_event header before the per-type fields: what + cpu + timestamp.
    const EVENT_HDR_LEN: usize = 16;

    /// Open the connector socket, join the proc multicast group, and send
    /// the LISTEN control message. EPERM here means missing privilege.
    pub fn open_proc_connector() -> io::Result<RawFd> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_CONNECTOR,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = std::process::id();
        addr.nl_groups = CN_IDX_PROC;

        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        if let Err(err) = send_mcast_op(fd, PROC_CN_MCAST_LISTEN) {
            unsafe { libc::close(fd) };
            return Err(err);
        }

        // Bounded receive timeout so the reader thread can observe stop.
        let timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: 500_000,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(fd)
    }

    pub fn close_proc_connector(fd: RawFd) {
        let _ = send_mcast_op(fd, PROC_CN_MCAST_IGNORE);
        unsafe { libc::close(fd) };
    }

    fn send_mcast_op(fd: RawFd, op: u32) -> io::Result<()> {
        let mut buf = [0u8; NLMSG_HDR_LEN + CN_MSG_LEN + 4];
        let buf_len = buf.len();

        // nlmsghdr
        buf[0..4].copy_from_slice(&(buf_len as u32).to_ne_bytes());
        buf[4..6].copy_from_slice(&(libc::NLMSG_DONE as u16).to_ne_bytes());
        buf[12..16].copy_from_slice(&std::process::id().to_ne_bytes());

        // cn_msg
        buf[16..20].copy_from_slice(&CN_IDX_PROC.to_ne_bytes());
        buf[20..24].copy_from_slice(&CN_VAL_PROC.to_ne_bytes());
        buf[32..34].copy_from_slice(&4u16.to_ne_bytes());

        // payload: proc_cn_mcast_op
        buf[36..40].copy_from_slice(&op.to_ne_bytes());

        let sent = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
        buf.get(offset..offset + 4)
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Parse all proc events contained in one datagram.
    fn parse_datagram(buf: &[u8], out: &mut Vec<KernelEvent>) {
        let mut offset = 0usize;
        while offset + NLMSG_HDR_LEN <= buf.len() {
            let msg_len = match read_u32(buf, offset) {
                Some(len) if len as usize >= NLMSG_HDR_LEN => len as usize,
                _ => break,
            };
            let msg_end = (offset + msg_len).min(buf.len());

            let event_base = offset + NLMSG_HDR_LEN + CN_MSG_LEN;
            if event_base + EVENT_HDR_LEN <= msg_end {
                let what = read_u32(buf, event_base).unwrap_or(0);
                let data = event_base + EVENT_HDR_LEN;

                match what {
                    PROC_EVENT_FORK => {
                        // parent_pid, parent_tgid, child_pid, child_tgid
                        if let (Some(parent_tgid), Some(child_pid), Some(child_tgid)) = (
                            read_u32(buf, data + 4),
                            read_u32(buf, data + 8),
                            read_u32(buf, data + 12),
                        ) {
                            // Thread clones share a tgid; only whole
                            // processes count as spawns.
                            if child_pid == child_tgid {
                                out.push(KernelEvent::Fork {
                                    parent: parent_tgid,
                                    child: child_tgid,
                                });
                            }
                        }
                    }
                    PROC_EVENT_EXEC => {
                        if let Some(tgid) = read_u32(buf, data + 4) {
                            out.push(KernelEvent::Exec { pid: tgid });
                        }
                    }
                    PROC_EVENT_EXIT => {
                        if let (Some(pid), Some(tgid), Some(code)) = (
                            read_u32(buf, data),
                            read_u32(buf, data + 4),
                            read_u32(buf, data + 8),
                        ) {
                            if pid == tgid {
                                out.push(KernelEvent::Exit {
                                    pid: tgid,
                                    status: code as i32,
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }

            // Netlink messages are 4-byte aligned.
            offset += (msg_len + 3) & !3;
        }
    }

    pub fn reader_loop(
        fd: RawFd,
        tx: Sender<KernelEvent>,
        running: Arc<AtomicBool>,
        failed: Arc<AtomicBool>,
    ) {
        let mut buf = [0u8; 4096];
        let mut events = Vec::new();

        while running.load(Ordering::Relaxed) {
            let received =
                unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };

            if received < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => continue,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        warn!("Netlink reader terminating: {}", err);
                        failed.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            }

            events.clear();
            parse_datagram(&buf[..received as usize], &mut events);
            for event in events.drain(..) {
                if tx.send(event).is_err() {
                    return;
                }
            }
        }
    }
}
