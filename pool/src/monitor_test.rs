use super::*;
use std::process::{Child, Command};

struct Sleeper(Child);

impl Sleeper {
    fn spawn() -> Self {
        Self(Command::new("sleep").arg("30").spawn().unwrap())
    }

    fn pid(&self) -> u32 {
        self.0.id()
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn test_empty_pid_set_has_no_workers() {
    let mut monitor = ResourceMonitor::for_pids(Vec::new());

    let snapshot = monitor.aggregate_memory();
    assert_eq!(snapshot.worker_count, 0);
    assert_eq!(snapshot.workers_rss_sum, 0);
    assert_eq!(snapshot.per_worker_avg, 0);
    assert!(snapshot.parent_rss > 0);
    assert_eq!(snapshot.total(), snapshot.parent_rss);
    assert!(monitor.worker_memory().is_empty());
}

#[test]
fn test_exited_pid_is_skipped() {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();

    let mut monitor = ResourceMonitor::for_pids([pid]);
    assert!(monitor.workers().is_empty());
    assert_eq!(monitor.aggregate_memory().worker_count, 0);
}

#[test]
fn test_explicit_pids_are_measured() {
    let sleeper = Sleeper::spawn();
    let mut monitor = ResourceMonitor::for_pids([sleeper.pid()]);

    assert_eq!(monitor.workers(), vec![sleeper.pid()]);

    let snapshot = monitor.aggregate_memory();
    assert_eq!(snapshot.worker_count, 1);
    assert!(snapshot.workers_rss_sum > 0);
    assert_eq!(snapshot.per_worker_avg, snapshot.workers_rss_sum);

    let memory = monitor.worker_memory();
    assert_eq!(memory.len(), 1);
    assert_eq!(memory[0].pid, sleeper.pid());
    assert!(memory[0].resident_bytes > 0);
}

#[test]
fn test_children_scope_finds_spawned_child() {
    let sleeper = Sleeper::spawn();
    let mut monitor = ResourceMonitor::new();

    // Other tests spawn children concurrently, so only check membership
    assert!(monitor.workers().contains(&sleeper.pid()));
}

#[test]
fn test_set_pids_replaces_scope() {
    let mut monitor = ResourceMonitor::new();
    assert_eq!(monitor.scope(), &Scope::Children);
    monitor.set_pids([1, 2]);
    assert_eq!(monitor.scope(), &Scope::Pids(vec![1, 2]));
}

#[test]
fn test_process_tree_includes_parent() {
    let sleeper = Sleeper::spawn();
    let mut monitor = ResourceMonitor::for_pids([sleeper.pid()]);

    let tree = monitor.process_tree();
    let parent = tree.parent.unwrap();
    assert_eq!(parent.pid, std::process::id());
    assert_eq!(tree.workers.len(), 1);
    assert_eq!(tree.workers[0].name, "sleep");
}

#[test]
fn test_aggregate_cpu_does_not_fail() {
    let mut monitor = ResourceMonitor::for_pids(Vec::new());
    let cpu = monitor.aggregate_cpu();
    assert_eq!(cpu.workers, 0.0);
    assert!(cpu.total >= cpu.parent);
}

#[tokio::test]
async fn test_sample_cpu_idle_worker() {
    let sleeper = Sleeper::spawn();
    let mut monitor = ResourceMonitor::for_pids([sleeper.pid()]);

    let samples = monitor.sample_cpu(Duration::from_millis(100)).await;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].0, sleeper.pid());
    assert!(samples[0].1 < 1.0);
}

/// Child that keeps one core busy.
fn spinner() -> Sleeper {
    Sleeper(
        Command::new("sh")
            .args(["-c", "while :; do :; done"])
            .spawn()
            .unwrap(),
    )
}

#[tokio::test]
async fn test_sample_measures_cpu_across_ticks() {
    let busy = spinner();
    let mut monitor = ResourceMonitor::for_pids([busy.pid()]);

    let first = monitor.sample();
    assert_eq!(first.memory.worker_count, 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let second = monitor.sample();

    assert_eq!(second.memory.worker_count, 1);
    assert!(second.memory.workers_rss_sum > 0);
    assert!(
        second.cpu.workers > 50.0,
        "busy worker measured at {}%",
        second.cpu.workers
    );
    assert!(second.cpu.total >= second.cpu.workers);
}

#[test]
fn test_parse_private_bytes() {
    let smaps = "\
00400000-7fff00000000 ---p 00000000 00:00 0                  [rollup]
Rss:                4512 kB
Pss:                1200 kB
Shared_Clean:       3000 kB
Private_Clean:       100 kB
Private_Dirty:       412 kB
Swap:                  0 kB
";
    assert_eq!(parse_private_bytes(smaps), Some(512 * 1024));
    assert_eq!(parse_private_bytes("Rss: 10 kB\n"), None);
}

