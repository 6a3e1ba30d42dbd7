use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

/// How a spawned process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Ok,
    Fail(Option<i32>),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub status: TaskStatus,
    /// Most recent non-empty output lines, stdout and stderr interleaved.
    pub lines: Vec<String>,
}

/// Put the child in its own process group so a Ctrl-C aimed at us never reaches it.
#[cfg(unix)]
fn detach_group(c: &mut Command) {
    unsafe {
        c.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach_group(_c: &mut Command) {}

#[cfg(unix)]
fn shell_command(cmd: &str) -> Command {
    let mut c = Command::new("sh");
    c.arg("-c").arg(cmd);
    c
}

#[cfg(not(unix))]
fn shell_command(cmd: &str) -> Command {
    let mut c = Command::new("cmd");
    c.arg("/C").arg(cmd);
    c
}

#[cfg(unix)]
pub fn kill_process_group(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(-(pid as i32)),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_child: &Child) {
    // Best-effort: Windows needs Job Objects to reliably terminate process trees.
}

/// Spawn an already-configured command in its own group. Output goes to an
/// unlinked temp file, never a pipe, so the child keeps running (and writing)
/// after whoever was watching it is gone.
pub fn spawn_detached(mut c: Command) -> Result<(Child, File)> {
    let log = tempfile::tempfile().context("creating output capture file")?;
    detach_group(&mut c);
    c.stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log.try_clone()?));
    let child = c.spawn()?;
    Ok((child, log))
}

/// Last `keep` non-empty lines of a capture file.
fn tail_lines(mut log: File, keep: usize) -> Result<Vec<String>> {
    log.seek(SeekFrom::Start(0))?;
    let mut lines: VecDeque<String> = VecDeque::new();
    for raw in BufReader::new(log).split(b'\n') {
        let raw = raw?;
        let line = String::from_utf8_lossy(&raw).trim_end().to_string();
        if line.trim().is_empty() {
            continue;
        }
        debug!("{line}");
        lines.push_back(line);
        while lines.len() > keep {
            lines.pop_front();
        }
    }
    Ok(lines.into_iter().collect())
}

/// Run a shell command to completion, bounded by `limit`, keeping the last `keep` lines.
pub async fn run_shell(cmd: &str, cwd: &Path, limit: Duration, keep: usize) -> Result<TaskOutput> {
    let mut c = shell_command(cmd);
    c.current_dir(cwd);
    run_to_completion(c, limit, keep).await
}

/// Dropping this future stops the wait only; the child is neither killed nor cut off.
pub async fn run_to_completion(c: Command, limit: Duration, keep: usize) -> Result<TaskOutput> {
    let (mut child, log) = spawn_detached(c)?;

    let status = match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => {
            let status = status?;
            if status.success() {
                TaskStatus::Ok
            } else {
                TaskStatus::Fail(status.code())
            }
        }
        Err(_) => {
            kill_process_group(&child);
            let _ = child.start_kill();
            TaskStatus::TimedOut
        }
    };

    let lines = tokio::task::spawn_blocking(move || tail_lines(log, keep))
        .await
        .context("reading captured output")??;
    Ok(TaskOutput { status, lines })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = std::env::temp_dir();
        let out = run_shell("echo hello; echo oops >&2; exit 3", &dir, Duration::from_secs(10), 10)
            .await
            .unwrap();
        assert_eq!(out.status, TaskStatus::Fail(Some(3)));
        assert!(out.lines.iter().any(|l| l == "hello"));
        assert!(out.lines.iter().any(|l| l == "oops"));
    }

    #[tokio::test]
    async fn keeps_only_the_tail() {
        let dir = std::env::temp_dir();
        let out = run_shell("for i in 1 2 3 4 5; do echo $i; done", &dir, Duration::from_secs(10), 2)
            .await
            .unwrap();
        assert_eq!(out.status, TaskStatus::Ok);
        assert_eq!(out.lines, vec!["4", "5"]);
    }

    #[tokio::test]
    async fn long_running_command_is_bounded() {
        let dir = std::env::temp_dir();
        let out = run_shell("sleep 30", &dir, Duration::from_millis(200), 10).await.unwrap();
        assert_eq!(out.status, TaskStatus::TimedOut);
    }

    #[test]
    fn child_outlives_an_abandoned_wait() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("done");
        let script = format!(
            "sleep 1; echo progress; echo progress >&2; touch '{}'",
            marker.display()
        );

        let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let waited = tokio::time::timeout(
                Duration::from_millis(200),
                run_shell(&script, dir.path(), Duration::from_secs(30), 10),
            )
            .await;
            assert!(waited.is_err());
        });
        drop(rt);

        for _ in 0..50 {
            if marker.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        assert!(marker.exists(), "child stopped once nobody was waiting on it");
    }
}
