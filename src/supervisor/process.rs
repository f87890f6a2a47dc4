// Command construction and signal delivery for supervised processes.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::SupervisorError;
use crate::manifest::ServiceManifestEntry;
use crate::model::InstanceId;

pub const INSTANCE_ID_ENV: &str = "MESHD_INSTANCE_ID";
pub const SERVICE_ENV: &str = "MESHD_SERVICE";
pub const CPU_HINT_ENV: &str = "MESHD_CPU_HINT";
pub const MEMORY_HINT_ENV: &str = "MESHD_MEMORY_HINT";

/// Builds the command for one instance of `entry` listening on `port`.
///
/// Commands given as a path (anything containing `/`) are checked up front so
/// a missing or non-executable binary is reported as a spawn failure instead
/// of an exit. Bare names are resolved through `PATH` by the OS.
pub fn build_command(
    entry: &ServiceManifestEntry,
    port: u16,
    id: &InstanceId,
    port_env: &str,
) -> Result<Command, SupervisorError> {
    let program = resolve_program(entry)?;

    let mut cmd = std::process::Command::new(&program);
    cmd.args(entry.args_for_port(port))
        .envs(&entry.env)
        .env(port_env, port.to_string())
        .env(INSTANCE_ID_ENV, id.as_str())
        .env(SERVICE_ENV, &entry.name)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    if let Some(cpu) = entry.resources.cpu {
        cmd.env(CPU_HINT_ENV, cpu.to_string());
    }
    if let Some(memory) = &entry.resources.memory {
        cmd.env(MEMORY_HINT_ENV, memory);
    }
    if let Some(cwd) = &entry.cwd {
        cmd.current_dir(cwd);
    }

    // Own process group: terminal signals aimed at the orchestrator do not
    // reach children, and stop signals reach the whole subtree.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut cmd = Command::from(cmd);
    cmd.kill_on_drop(true);
    Ok(cmd)
}

fn resolve_program(entry: &ServiceManifestEntry) -> Result<PathBuf, SupervisorError> {
    let program = PathBuf::from(&entry.command);
    if !entry.command.contains('/') {
        return Ok(program);
    }

    let full = match (&entry.cwd, program.is_relative()) {
        (Some(cwd), true) => cwd.join(&program),
        _ => program.clone(),
    };
    check_executable(&full).map_err(|reason| SupervisorError::spawn_failed(&entry.name, reason))?;
    Ok(program)
}

fn check_executable(path: &Path) -> Result<(), String> {
    let meta = std::fs::metadata(path).map_err(|e| format!("{}: {e}", path.display()))?;
    if !meta.is_file() {
        return Err(format!("{} is not a regular file", path.display()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(format!("{} is not executable", path.display()));
        }
    }
    Ok(())
}

/// Sends `signal` to the process group led by `pid`.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory safety preconditions.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: i32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "signals are unix only"))
}

#[cfg(unix)]
pub fn terminate_signal() -> libc::c_int {
    libc::SIGTERM
}

#[cfg(not(unix))]
pub fn terminate_signal() -> i32 {
    15
}
