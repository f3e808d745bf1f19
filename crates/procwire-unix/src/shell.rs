//! Shell wrapper and side channel plumbing.
//!
//! The user command runs as a background job of `sh -c`. The shell reports
//! the job's pid and later its exit code as two decimal lines on fd 3, which
//! the parent reads from the other end of a pipe.

use procwire_core::{ExitOutcome, ProcessError, Result};
use std::io;
use std::os::fd::RawFd;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Descriptor number of the side channel inside the shell.
pub const SIDE_CHANNEL_FD: RawFd = 3;

/// Rewrites `command` so the shell reports the job's pid and exit code on fd 3.
///
/// Inside the braces fd 3 is a copy of stdin so the background job keeps the
/// real stdin instead of `/dev/null`; outside them fd 3 is the side channel.
pub fn wrap_command(command: &str) -> String {
    format!(
        "{{ ({command}) <&3 3<&- 3>/dev/null & }} 3<&0; \
         trap \"\" INT TERM QUIT HUP; \
         pid=$!; echo $pid >&3; wait $pid; RC=$?; echo $RC >&3; exit $RC"
    )
}

/// Reads the first side channel line: the pid of the user command.
pub async fn read_pid<R>(side_channel: &mut R) -> Result<u32>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    side_channel
        .read_line(&mut line)
        .await
        .map_err(|e| ProcessError::StartFailed(format!("Could not read PID: {e}")))?;

    parse_pid(&line)
}

pub fn parse_pid(line: &str) -> Result<u32> {
    let trimmed = line.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProcessError::StartFailed(
            "Could not determine PID".to_string(),
        ));
    }

    match trimmed.parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(ProcessError::StartFailed(
            "Could not determine PID".to_string(),
        )),
    }
}

/// Reads the second side channel line: the exit code of the user command.
///
/// End of stream before the line arrives means the shell died without
/// reporting, which is never mapped to a clean exit.
pub async fn read_exit_code<R>(side_channel: &mut R) -> ExitOutcome
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    match side_channel.read_line(&mut line).await {
        Ok(0) => Err(ProcessError::EndedUnexpectedly),
        Ok(_) => line.trim().parse::<i32>().map_err(|_| {
            ProcessError::ExitCodeUnavailable(format!("received {:?}", line.trim()))
        }),
        Err(e) => Err(ProcessError::ExitCodeUnavailable(e.to_string())),
    }
}

/// Descriptors above the side channel that are open in this process.
///
/// Enumerated before spawning because the child may not allocate.
pub fn open_descriptors() -> Vec<RawFd> {
    for dir in ["/dev/fd", "/proc/self/fd"] {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };

        return entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<RawFd>().ok())
            .filter(|fd| *fd > SIDE_CHANNEL_FD)
            .collect();
    }

    Vec::new()
}

/// Runs in the forked child before `exec`. Only async-signal-safe calls.
///
/// Moves the side channel onto fd 3 and points every inheritable descriptor
/// from `inherited` at `/dev/null`, so no parent pipe stays open in the child.
pub fn prepare_child_descriptors(side_fd: RawFd, inherited: &[RawFd]) -> io::Result<()> {
    // SAFETY: plain descriptor syscalls on integers owned by this forked child.
    unsafe {
        if side_fd == SIDE_CHANNEL_FD {
            // dup2 onto itself would keep close-on-exec set.
            if libc::fcntl(side_fd, libc::F_SETFD, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
        } else if libc::dup2(side_fd, SIDE_CHANNEL_FD) == -1 {
            return Err(io::Error::last_os_error());
        }

        let mut null_fd: RawFd = -1;
        for &fd in inherited {
            if fd <= SIDE_CHANNEL_FD || fd == null_fd {
                continue;
            }

            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags == -1 || flags & libc::FD_CLOEXEC != 0 {
                continue;
            }

            if null_fd == -1 {
                null_fd = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR | libc::O_CLOEXEC);
                if null_fd == -1 {
                    return Err(io::Error::last_os_error());
                }
            }

            if libc::dup2(null_fd, fd) == -1 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    Ok(())
}
