// Two schedulers with their own connections race for the same occurrence.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use defidash_core::config::DatabaseConfig;
use defidash_jobs::{JobArgs, JobContext, JobError, Priority, Queue, Registry, Scheduler};

const HOUR: Duration = Duration::from_secs(3600);

async fn noop(_ctx: JobContext, _args: JobArgs) -> Result<(), JobError> {
    Ok(())
}

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 19, h, m, 0).unwrap()
}

fn registry() -> Arc<Registry> {
    let mut builder = Registry::builder();
    builder
        .register_job("cleanup", noop)
        .unwrap()
        .register_schedule("cleanup", HOUR)
        .unwrap();
    Arc::new(builder.build().unwrap())
}

fn instance(config: &DatabaseConfig, registry: &Arc<Registry>) -> (Scheduler, Queue) {
    let open = || defidash_core::db::open(config).unwrap();
    let queue = Queue::new(open()).unwrap();
    let scheduler = Scheduler::new(open(), Arc::clone(registry), queue.clone()).unwrap();
    (scheduler, queue)
}

fn config(dir: &tempfile::TempDir) -> DatabaseConfig {
    DatabaseConfig {
        path: dir.path().join("dash.db").to_string_lossy().into_owned(),
        busy_timeout_ms: 10_000,
    }
}

#[test]
fn only_one_instance_fires_a_due_occurrence() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let registry = registry();

    let (a, queue) = instance(&config, &registry);
    let (b, _) = instance(&config, &registry);
    a.reconcile(at(12, 30)).unwrap();
    b.reconcile(at(12, 31)).unwrap();
    assert_eq!(a.list().unwrap().len(), 1);

    let fire_at = at(14, 2);
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [a, b]
        .into_iter()
        .map(|scheduler| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                scheduler.run_once(fire_at).unwrap()
            })
        })
        .collect();

    let fired: Vec<String> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(fired, vec!["cleanup"]);

    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].priority, Priority::High);
}

#[test]
fn loser_of_the_race_sees_zero_rows() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let registry = registry();
    let (a, queue) = instance(&config, &registry);
    let (b, _) = instance(&config, &registry);
    a.reconcile(at(12, 10)).unwrap();

    // Both saw the row as due before either claimed it.
    assert_eq!(a.due(at(13, 2)).unwrap(), vec!["cleanup"]);
    assert_eq!(b.due(at(13, 2)).unwrap(), vec!["cleanup"]);

    // next_run was 13:00; the fire at 13:02 lands on the 14:00 grid point.
    let won = a.try_claim_occurrence("cleanup", HOUR, at(13, 2)).unwrap().unwrap();
    assert_eq!(won.next_run, at(14, 0));
    assert!(b.try_claim_occurrence("cleanup", HOUR, at(13, 2)).unwrap().is_none());
    assert!(b.run_once(at(13, 2)).unwrap().is_empty());
    assert!(queue.is_empty().unwrap());
}

#[test]
fn schedules_stay_on_grid_across_late_fires() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let registry = registry();
    let (s, _) = instance(&config, &registry);
    s.reconcile(at(9, 10)).unwrap();
    assert_eq!(s.list().unwrap()[0].next_run, at(10, 0));

    for (fire, expected) in [(at(10, 7), at(11, 0)), (at(11, 1), at(12, 0)), (at(12, 20), at(13, 0))] {
        assert_eq!(s.run_once(fire).unwrap(), vec!["cleanup"]);
        assert_eq!(s.list().unwrap()[0].next_run, expected);
    }
}

#[test]
fn unregistered_rows_are_removed_on_reconcile() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);

    let mut old = Registry::builder();
    old.register_job("cleanup", noop)
        .unwrap()
        .register_job("legacy-report", noop)
        .unwrap()
        .register_schedule("cleanup", HOUR)
        .unwrap()
        .register_schedule("legacy-report", Duration::from_secs(86_400))
        .unwrap();
    let (previous, _) = instance(&config, &Arc::new(old.build().unwrap()));
    previous.reconcile(at(8, 0)).unwrap();
    assert_eq!(previous.list().unwrap().len(), 2);

    let (current, _) = instance(&config, &registry());
    current.reconcile(at(8, 5)).unwrap();
    let ids: Vec<String> = current.list().unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["cleanup"]);
}
