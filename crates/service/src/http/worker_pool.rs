use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread;
use tiny_http::Request;

const HTTP_WORKER_FACTOR: usize = 4;
const HTTP_WORKER_MIN: usize = 8;
const HTTP_STREAM_WORKER_FACTOR: usize = 1;
const HTTP_STREAM_WORKER_MIN: usize = 2;
const HTTP_QUEUE_FACTOR: usize = 4;
const HTTP_QUEUE_MIN: usize = 32;
const HTTP_STREAM_QUEUE_FACTOR: usize = 2;
const HTTP_STREAM_QUEUE_MIN: usize = 16;
const ENV_HTTP_WORKER_FACTOR: &str = "CHANNELRELAY_HTTP_WORKER_FACTOR";
const ENV_HTTP_WORKER_MIN: &str = "CHANNELRELAY_HTTP_WORKER_MIN";
const ENV_HTTP_STREAM_WORKER_FACTOR: &str = "CHANNELRELAY_HTTP_STREAM_WORKER_FACTOR";
const ENV_HTTP_STREAM_WORKER_MIN: &str = "CHANNELRELAY_HTTP_STREAM_WORKER_MIN";
const ENV_HTTP_QUEUE_FACTOR: &str = "CHANNELRELAY_HTTP_QUEUE_FACTOR";
const ENV_HTTP_QUEUE_MIN: &str = "CHANNELRELAY_HTTP_QUEUE_MIN";
const ENV_HTTP_STREAM_QUEUE_FACTOR: &str = "CHANNELRELAY_HTTP_STREAM_QUEUE_FACTOR";
const ENV_HTTP_STREAM_QUEUE_MIN: &str = "CHANNELRELAY_HTTP_STREAM_QUEUE_MIN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolSizing {
    workers: usize,
    stream_workers: usize,
    queue: usize,
    stream_queue: usize,
}

fn available_cpus() -> usize {
    thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(4)
}

fn scaled(base: usize, factor_env: &str, factor: usize, min_env: &str, min: usize) -> usize {
    let factor = env_usize_or(factor_env, factor).max(1);
    let min = env_usize_or(min_env, min).max(1);
    base.saturating_mul(factor).max(min)
}

fn pool_sizing(cpus: usize) -> PoolSizing {
    // 中文注释：长流会占住 worker；worker 与队列都有上限，高峰时由有界队列施加背压。
    let workers = scaled(
        cpus,
        ENV_HTTP_WORKER_FACTOR,
        HTTP_WORKER_FACTOR,
        ENV_HTTP_WORKER_MIN,
        HTTP_WORKER_MIN,
    );
    let stream_workers = scaled(
        cpus,
        ENV_HTTP_STREAM_WORKER_FACTOR,
        HTTP_STREAM_WORKER_FACTOR,
        ENV_HTTP_STREAM_WORKER_MIN,
        HTTP_STREAM_WORKER_MIN,
    );
    PoolSizing {
        workers,
        stream_workers,
        queue: scaled(
            workers,
            ENV_HTTP_QUEUE_FACTOR,
            HTTP_QUEUE_FACTOR,
            ENV_HTTP_QUEUE_MIN,
            HTTP_QUEUE_MIN,
        ),
        stream_queue: scaled(
            stream_workers,
            ENV_HTTP_STREAM_QUEUE_FACTOR,
            HTTP_STREAM_QUEUE_FACTOR,
            ENV_HTTP_STREAM_QUEUE_MIN,
            HTTP_STREAM_QUEUE_MIN,
        ),
    }
}

fn env_usize_or(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

/// Two bounded queues: one for requests that announce an event stream, one for
/// everything else, so long streams cannot starve short calls.
pub(crate) struct WorkerPool {
    normal_tx: Sender<Request>,
    stream_tx: Sender<Request>,
}

impl WorkerPool {
    pub(crate) fn start<H>(handler: H) -> Self
    where
        H: Fn(Request) + Send + Sync + Clone + 'static,
    {
        let sizing = pool_sizing(available_cpus());
        let (normal_tx, normal_rx) = bounded::<Request>(sizing.queue);
        let (stream_tx, stream_rx) = bounded::<Request>(sizing.stream_queue);
        spawn_workers("relay-http", sizing.workers, normal_rx, handler.clone());
        spawn_workers("relay-http-stream", sizing.stream_workers, stream_rx, handler);
        log::info!(
            "event=http_pool_started workers={} stream_workers={} queue={} stream_queue={}",
            sizing.workers,
            sizing.stream_workers,
            sizing.queue,
            sizing.stream_queue
        );
        Self {
            normal_tx,
            stream_tx,
        }
    }

    /// Blocks while both queues are full. Fails only when every worker is gone.
    pub(crate) fn enqueue(&self, request: Request) -> Result<(), ()> {
        let (preferred, fallback) = if request_is_stream_like(&request) {
            (&self.stream_tx, &self.normal_tx)
        } else {
            (&self.normal_tx, &self.stream_tx)
        };
        match preferred.send(request) {
            Ok(()) => Ok(()),
            Err(err) => fallback.send(err.into_inner()).map_err(|_| ()),
        }
    }
}

fn spawn_workers<H>(name: &str, count: usize, rx: Receiver<Request>, handler: H)
where
    H: Fn(Request) + Send + Sync + Clone + 'static,
{
    for index in 0..count {
        let worker_rx = rx.clone();
        let worker_handler = handler.clone();
        let spawned = thread::Builder::new()
            .name(format!("{name}-{index}"))
            .spawn(move || {
                while let Ok(request) = worker_rx.recv() {
                    worker_handler(request);
                }
            });
        if let Err(err) = spawned {
            log::error!("event=http_worker_spawn_failed name={} err={}", name, err);
        }
    }
}

fn request_is_stream_like(request: &Request) -> bool {
    request
        .headers()
        .iter()
        .find(|header| header.field.equiv("Accept"))
        .is_some_and(|header| {
            header
                .value
                .as_str()
                .to_ascii_lowercase()
                .contains("text/event-stream")
        })
}
