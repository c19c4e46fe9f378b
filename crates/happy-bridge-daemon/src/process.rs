//! OS process queries.

use std::io;

/// Read access to the OS process table, plus termination.
pub trait ProcessTable: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// Command line of `pid` with arguments joined by single spaces.
    fn command_line(&self, pid: u32) -> Option<String>;

    /// Ask `pid` to exit (SIGTERM on unix).
    ///
    /// # Errors
    /// Returns error if the signal cannot be delivered.
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// The real process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

#[cfg(unix)]
impl ProcessTable for SystemProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        // pid 0 and values above i32::MAX would address process groups.
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs only the existence and permission check.
        #[allow(unsafe_code)]
        let result = unsafe { libc::kill(pid, 0) };
        result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        if let Ok(raw) = std::fs::read(format!("/proc/{pid}/cmdline")) {
            let joined = raw
                .split(|b| *b == 0)
                .filter(|arg| !arg.is_empty())
                .map(String::from_utf8_lossy)
                .collect::<Vec<_>>()
                .join(" ");
            if !joined.is_empty() {
                return Some(joined);
            }
        }
        let output = std::process::Command::new("ps")
            .args(["-o", "args=", "-p", &pid.to_string()])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let line = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!line.is_empty()).then_some(line)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: plain signal delivery to a single positive pid.
        #[allow(unsafe_code)]
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(unix))]
impl ProcessTable for SystemProcessTable {
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    fn command_line(&self, _pid: u32) -> Option<String> {
        None
    }

    fn terminate(&self, _pid: u32) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "process signals need unix"))
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        let table = SystemProcessTable;
        let pid = std::process::id();
        assert!(table.is_alive(pid));
        assert!(table.command_line(pid).is_some());
    }

    #[test]
    fn test_out_of_range_pids() {
        let table = SystemProcessTable;
        assert!(!table.is_alive(0));
        assert!(!table.is_alive(u32::MAX));
        assert!(table.terminate(0).is_err());
    }
}
