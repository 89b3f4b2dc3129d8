use rand::Rng;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use super::directory::reload_shared_directory;
use super::runtime_config::directory_sync_interval;

static DIRECTORY_SYNC_STARTED: OnceLock<()> = OnceLock::new();

const DISABLED_RECHECK: Duration = Duration::from_secs(1);
const SYNC_JITTER_CAP: Duration = Duration::from_secs(3);
const FAILURE_BACKOFF_FACTOR: u32 = 8;

/// Starts the periodic directory reload thread (once per process).
pub(crate) fn ensure_directory_sync() {
    DIRECTORY_SYNC_STARTED.get_or_init(|| {
        let spawned = thread::Builder::new()
            .name("relay-directory-sync".to_string())
            .spawn(|| {
                run_sync_loop(
                    directory_sync_interval,
                    reload_shared_directory,
                    thread::sleep,
                    crate::shutdown_requested,
                )
            });
        if let Err(err) = spawned {
            log::error!("event=directory_sync_spawn_failed err={}", err);
        }
    });
}

fn run_sync_loop<I, T, S, Q>(interval: I, mut task: T, mut sleep: S, should_stop: Q)
where
    I: Fn() -> Option<Duration>,
    T: FnMut() -> Result<(), String>,
    S: FnMut(Duration),
    Q: Fn() -> bool,
{
    let mut rng = rand::thread_rng();
    let mut consecutive_failures = 0u32;
    while !should_stop() {
        // 中文注释：间隔为 0 表示关闭同步，仍定期检查配置，热更新后可重新开启。
        let Some(base) = interval() else {
            consecutive_failures = 0;
            sleep(DISABLED_RECHECK);
            continue;
        };
        sleep(next_sync_delay(base, consecutive_failures, sampled_jitter(&mut rng)));
        if should_stop() {
            break;
        }
        match task() {
            Ok(()) => consecutive_failures = 0,
            Err(err) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                log::warn!(
                    "event=directory_sync_failed consecutive_failures={} err={}",
                    consecutive_failures,
                    err
                );
            }
        }
    }
}

fn sampled_jitter<R: Rng + ?Sized>(rng: &mut R) -> Duration {
    Duration::from_millis(rng.gen_range(0..=SYNC_JITTER_CAP.as_millis() as u64))
}

fn next_sync_delay(interval: Duration, consecutive_failures: u32, jitter: Duration) -> Duration {
    failure_backoff(interval, consecutive_failures)
        .checked_add(jitter.min(SYNC_JITTER_CAP))
        .unwrap_or(Duration::MAX)
}

/// `interval * 2^(failures-1)`, capped at `interval * 8`.
fn failure_backoff(interval: Duration, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return interval;
    }
    let shift = consecutive_failures.saturating_sub(1).min(20);
    let cap = interval.saturating_mul(FAILURE_BACKOFF_FACTOR);
    interval.saturating_mul(1u32 << shift).min(cap)
}
