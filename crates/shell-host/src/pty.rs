//! PTY and process primitives (libc/nix).

use std::env;
use std::ffi::{CString, OsString};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

const PTY_COLS: u16 = 120;
const PTY_ROWS: u16 = 40;
const PTY_TERM: &str = "xterm-256color";

/// Master side of a freshly spawned PTY plus the child's pid.
#[derive(Debug)]
pub struct PtyChild {
    pub master: OwnedFd,
    pub pid: Pid,
}

/// Result of a non-blocking liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    /// Exit code, or 128 + signal number when killed by a signal.
    Exited(i32),
    /// Reaped elsewhere or never ours; it no longer exists.
    Gone,
}

/// Fork `<shell> -c <command>` on a new PTY with `cwd` as its working
/// directory. The master fd is returned non-blocking and close-on-exec.
pub fn spawn_shell(shell: &str, command: &str, cwd: &Path) -> io::Result<PtyChild> {
    if !cwd.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("working directory {} does not exist", cwd.display()),
        ));
    }
    let program = resolve_program(shell)?;

    // Everything the child needs is built before fork: after fork only
    // async-signal-safe calls are allowed.
    let c_program = cstring(program.as_os_str().as_bytes())?;
    let c_cwd = cstring(cwd.as_os_str().as_bytes())?;
    let c_args = [cstring(shell.as_bytes())?, cstring(b"-c")?, cstring(command.as_bytes())?];
    let c_env = child_environment()?;

    let c_argv: Vec<*const libc::c_char> = c_args
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let c_envp: Vec<*const libc::c_char> = c_env
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let mut winsize = libc::winsize {
        ws_row: PTY_ROWS,
        ws_col: PTY_COLS,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: sigemptyset initializes the zeroed set.
    let empty_mask = unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        set
    };
    let mut master_fd: libc::c_int = -1;
    // SAFETY: forkpty writes the master fd and returns the child pid; all
    // pointers are valid for the duration of the call.
    let pid = unsafe {
        libc::forkpty(
            &mut master_fd as *mut libc::c_int,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut winsize as *mut libc::winsize,
        )
    };

    if pid < 0 {
        return Err(io::Error::last_os_error());
    }

    if pid == 0 {
        // Child: chdir, exec, or die. Never return into the parent's code.
        // The Rust runtime ignores SIGPIPE; pipelines like `cmd | head`
        // need the default disposition back, and an empty signal mask.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            libc::sigprocmask(libc::SIG_SETMASK, &empty_mask, std::ptr::null_mut());
            if libc::chdir(c_cwd.as_ptr()) != 0 {
                libc::_exit(126);
            }
            libc::execve(c_program.as_ptr(), c_argv.as_ptr(), c_envp.as_ptr());
            libc::_exit(127);
        }
    }

    // SAFETY: master_fd is valid from forkpty and owned by nobody else.
    let master = unsafe { OwnedFd::from_raw_fd(master_fd) };
    set_flags(master_fd)?;
    Ok(PtyChild {
        master,
        pid: Pid::from_raw(pid),
    })
}

fn cstring(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "argument contains a NUL byte")
    })
}

fn child_environment() -> io::Result<Vec<CString>> {
    let mut vars: Vec<CString> = Vec::new();
    for (key, value) in env::vars_os() {
        if key == "TERM" {
            continue;
        }
        let mut pair: OsString = key;
        pair.push("=");
        pair.push(value);
        // Skip anything unrepresentable instead of failing the spawn.
        if let Ok(c) = CString::new(pair.into_vec()) {
            vars.push(c);
        }
    }
    vars.push(cstring(format!("TERM={PTY_TERM}").as_bytes())?);
    Ok(vars)
}

/// Locate `name` on `PATH`, or accept it verbatim when it contains a `/`.
fn resolve_program(name: &str) -> io::Result<PathBuf> {
    if name.contains('/') {
        return Ok(PathBuf::from(name));
    }
    let path = env::var_os("PATH").unwrap_or_default();
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            candidate
                .metadata()
                .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        })
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{name} not found on PATH")))
}

fn set_flags(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// One `read(2)` from a non-blocking fd. `WouldBlock` means no data yet.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for buf.len() bytes.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// One `write(2)` to a non-blocking fd; returns bytes accepted.
pub fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    // SAFETY: data is valid for data.len() bytes.
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Signal the child's process group (it is a session leader, so the
/// group is the whole pipeline), falling back to the pid alone. Returns
/// whether anything received the signal. Failures are not errors: the
/// target may already be gone.
pub fn signal_child(pid: Pid, sig: Signal) -> bool {
    signal::killpg(pid, sig).is_ok() || signal::kill(pid, sig).is_ok()
}

/// Non-blocking liveness probe. Reaps the child when it has exited, so a
/// finished process does not linger as a zombie that still answers
/// signal 0.
pub fn probe_child(pid: Pid) -> ChildState {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => ChildState::Exited(code),
        Ok(WaitStatus::Signaled(_, sig, _)) => ChildState::Exited(128 + sig as i32),
        Ok(_) => ChildState::Running,
        Err(Errno::ECHILD) => match signal::kill(pid, None) {
            Ok(()) => ChildState::Running,
            Err(_) => ChildState::Gone,
        },
        Err(_) => ChildState::Gone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::time::{Duration, Instant};

    fn wait_exit(pid: Pid) -> ChildState {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let state = probe_child(pid);
            if state != ChildState::Running || Instant::now() > deadline {
                return state;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn resolve_finds_sh() {
        let p = resolve_program("sh").unwrap();
        assert!(p.is_absolute());
        assert!(p.ends_with("sh"));
    }

    #[test]
    fn resolve_missing_program_is_not_found() {
        let err = resolve_program("__no_such_shell_12345__").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn resolve_keeps_explicit_paths() {
        assert_eq!(resolve_program("/bin/sh").unwrap(), PathBuf::from("/bin/sh"));
    }

    #[test]
    fn spawn_rejects_missing_cwd() {
        let err = spawn_shell("sh", "true", Path::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn spawn_rejects_nul_in_command() {
        let err = spawn_shell("sh", "echo \0", Path::new("/tmp")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn exit_code_is_reported_and_reaped() {
        let child = spawn_shell("sh", "exit 3", Path::new("/tmp")).unwrap();
        assert_eq!(wait_exit(child.pid), ChildState::Exited(3));
        assert_ne!(probe_child(child.pid), ChildState::Running);
    }

    #[test]
    fn signal_terminates_child() {
        let child = spawn_shell("sh", "sleep 30", Path::new("/tmp")).unwrap();
        assert_eq!(probe_child(child.pid), ChildState::Running);
        assert!(signal_child(child.pid, Signal::SIGKILL));
        assert_eq!(wait_exit(child.pid), ChildState::Exited(128 + libc::SIGKILL));
    }

    /// Read the master until the child side closes, then reap.
    fn run_to_end(child: PtyChild) -> String {
        let fd = child.master.as_raw_fd();
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match read_fd(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(_) => break,
            }
        }
        wait_exit(child.pid);
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn child_runs_in_cwd_with_term_set() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().canonicalize().unwrap();
        let child = spawn_shell("sh", "pwd; echo \"term=$TERM\"", &cwd).unwrap();
        let text = run_to_end(child);
        assert!(text.contains(cwd.to_str().unwrap()), "got {text:?}");
        assert!(text.contains("term=xterm-256color"), "got {text:?}");
    }

    #[test]
    fn pipeline_into_head_ends_quietly() {
        let child = spawn_shell(
            "sh",
            "seq 1 1000000 | head -1; echo pipeline-done",
            Path::new("/tmp"),
        )
        .unwrap();
        let text = run_to_end(child);
        assert!(text.contains("pipeline-done"), "got {text:?}");
        assert!(!text.contains("Broken pipe"), "got {text:?}");
    }

    #[test]
    fn child_starts_with_default_sigpipe_and_empty_mask() {
        if !Path::new("/proc/self/status").exists() {
            return;
        }
        // SigBlk and SigIgn in /proc/<pid>/status are hex signal masks.
        let child = spawn_shell(
            "sh",
            "exec grep -E '^Sig(Blk|Ign)' /proc/self/status",
            Path::new("/tmp"),
        )
        .unwrap();
        let text = run_to_end(child);
        let mask = |name: &str| -> u64 {
            let line = text
                .lines()
                .find(|l| l.starts_with(name))
                .unwrap_or_else(|| panic!("{name} missing from {text:?}"));
            u64::from_str_radix(line.split_whitespace().nth(1).unwrap().trim(), 16).unwrap()
        };
        assert_eq!(mask("SigBlk:"), 0);
        assert_eq!(mask("SigIgn:") & (1 << (libc::SIGPIPE - 1)), 0);
    }
}
