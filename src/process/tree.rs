//! Process-tree termination.
//!
//! A speak session is a worker process that spawns further children (an
//! external player, a one-shot synthesizer). Killing only the immediate child
//! leaves audio playing, so termination walks the subtree: children first,
//! awaited, then the parent. Some shells defer their own SIGTERM while a
//! foreground child runs, which is why the parent goes last.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use sysinfo::{Pid as SysPid, ProcessStatus, ProcessesToUpdate, System};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// How long to wait after SIGTERM before escalating to SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(1500);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Check if a PID is alive. Zombies count as dead: they only await reaping.
pub fn is_alive(pid: u32) -> bool {
    if !pid_exists(pid) {
        return false;
    }
    let mut sys = System::new();
    let target = SysPid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    match sys.process(target) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Check if a PID exists using the null signal.
pub fn pid_exists(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// All descendants of `root`, ordered deepest-first.
pub fn descendants(root: u32) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }

    let mut ordered = Vec::new();
    collect_post_order(root, &children, &mut ordered);
    ordered.pop(); // root itself
    ordered
}

fn collect_post_order(pid: u32, children: &HashMap<u32, Vec<u32>>, out: &mut Vec<u32>) {
    if let Some(kids) = children.get(&pid) {
        for &kid in kids {
            // Guard against PID reuse loops in a racy snapshot.
            if !out.contains(&kid) && kid != pid {
                collect_post_order(kid, children, out);
            }
        }
    }
    out.push(pid);
}

/// Terminate `root` and every process below it.
///
/// Children are signalled first and awaited, then the root. Each process gets
/// SIGTERM with a grace period before SIGKILL. Already-exited processes are
/// not an error.
pub async fn terminate_tree(root: u32) -> io::Result<()> {
    let children = descendants(root);
    debug!("Terminating process tree of {root}: children={children:?}");

    for &pid in &children {
        send(pid, Signal::SIGTERM)?;
    }
    wait_all_exit(&children).await;

    send(root, Signal::SIGTERM)?;
    wait_all_exit(&[root]).await;

    // Anything the parent spawned while we were waiting.
    for pid in descendants(root) {
        let _ = send(pid, Signal::SIGKILL);
    }
    Ok(())
}

async fn wait_all_exit(pids: &[u32]) {
    if pids.is_empty() {
        return;
    }
    let deadline = Instant::now() + TERM_GRACE;
    loop {
        let alive: Vec<u32> = pids.iter().copied().filter(|&p| is_alive(p)).collect();
        if alive.is_empty() {
            return;
        }
        if Instant::now() >= deadline {
            for pid in alive {
                warn!("Process {pid} ignored SIGTERM, sending SIGKILL");
                let _ = send(pid, Signal::SIGKILL);
            }
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
}

fn send(pid: u32, sig: Signal) -> io::Result<()> {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::other(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[test]
    fn pid_exists_for_self() {
        assert!(pid_exists(std::process::id()));
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn pid_exists_false_for_impossible_pid() {
        assert!(!pid_exists(999_999));
        assert!(!is_alive(999_999));
    }

    #[tokio::test]
    async fn terminate_tree_kills_grandchildren() {
        // sh waits on a foreground sleep and defers its own SIGTERM meanwhile.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("sleep 30; echo done")
            .spawn()
            .expect("failed to spawn sh");
        let pid = child.id().expect("no pid");

        // Give sh time to fork the sleep.
        let mut grandchildren = Vec::new();
        for _ in 0..40 {
            grandchildren = descendants(pid);
            if !grandchildren.is_empty() {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        assert!(!grandchildren.is_empty(), "sleep was never forked");

        terminate_tree(pid).await.expect("terminate_tree failed");
        tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("sh did not exit")
            .expect("wait failed");

        for g in grandchildren {
            assert!(!is_alive(g), "grandchild {g} survived");
        }
    }

    #[tokio::test]
    async fn terminate_tree_tolerates_exited_process() {
        let mut child = Command::new("true").spawn().expect("failed to spawn true");
        let pid = child.id().expect("no pid");
        let _ = child.wait().await;
        assert!(terminate_tree(pid).await.is_ok());
    }
}
