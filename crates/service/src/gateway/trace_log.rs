use channelrelay_core::storage::now_ts;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::OnceLock;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_TRACE_QUEUE_CAPACITY: usize = 2048;
const ENV_TRACE_QUEUE_CAPACITY: &str = "CHANNELRELAY_TRACE_QUEUE_CAPACITY";
const TRACE_FILE_NAME: &str = "gateway-trace.log";

static TRACE_WRITER: OnceLock<TraceWriter> = OnceLock::new();
static TRACE_SEQ: AtomicU64 = AtomicU64::new(1);

enum TraceCommand {
    Append(String),
    Flush(SyncSender<()>),
}

struct TraceWriter {
    tx: SyncSender<TraceCommand>,
    dropped: AtomicU64,
    capacity: usize,
}

impl TraceWriter {
    fn spawn(path: PathBuf) -> Self {
        let capacity = trace_queue_capacity();
        let (tx, rx) = mpsc::sync_channel::<TraceCommand>(capacity);
        let spawn_result = thread::Builder::new()
            .name("relay-trace-writer".to_string())
            .spawn(move || trace_writer_loop(rx, TraceFile::new(path)));
        if let Err(err) = spawn_result {
            log::warn!("event=trace_writer_spawn_failed err={}", err);
        }
        Self {
            tx,
            dropped: AtomicU64::new(0),
            capacity,
        }
    }

    fn append(&self, line: String) {
        match self.tx.try_send(TraceCommand::Append(line)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1024 == 0 {
                    log::warn!(
                        "event=trace_queue_full dropped_lines={} capacity={}",
                        dropped,
                        self.capacity
                    );
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("event=trace_writer_closed");
            }
        }
    }
}

struct TraceFile {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl TraceFile {
    fn new(path: PathBuf) -> Self {
        Self { path, writer: None }
    }

    fn append(&mut self, line: &str) -> std::io::Result<()> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{line}")?;
        }
        Ok(())
    }

    fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

fn trace_writer_loop(rx: Receiver<TraceCommand>, mut file: TraceFile) {
    while let Ok(command) = rx.recv() {
        match command {
            TraceCommand::Append(line) => {
                if let Err(err) = file.append(&line) {
                    log::warn!(
                        "event=trace_write_failed path={} err={}",
                        file.path.display(),
                        err
                    );
                    file.writer = None;
                }
            }
            TraceCommand::Flush(ack) => {
                file.flush();
                let _ = ack.send(());
            }
        }
    }
}

fn trace_queue_capacity() -> usize {
    std::env::var(ENV_TRACE_QUEUE_CAPACITY)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_TRACE_QUEUE_CAPACITY)
}

/// Starts the trace file writer next to the database. Only the server calls this;
/// without it trace events go to the `log` facade at debug level.
pub(crate) fn enable_trace_file() {
    let path = crate::process_env::db_dir().join(TRACE_FILE_NAME);
    let _ = TRACE_WRITER.get_or_init(|| TraceWriter::spawn(path));
}

pub(crate) fn flush() {
    let Some(writer) = TRACE_WRITER.get() else {
        return;
    };
    let (ack_tx, ack_rx) = mpsc::sync_channel(0);
    if writer.tx.send(TraceCommand::Flush(ack_tx)).is_ok() {
        let _ = ack_rx.recv_timeout(std::time::Duration::from_millis(200));
    }
}

fn sanitize_text(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

fn emit(line: String) {
    log::debug!("{line}");
    if let Some(writer) = TRACE_WRITER.get() {
        writer.append(line);
    }
}

pub(crate) fn next_trace_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|v| v.as_millis())
        .unwrap_or(0);
    let seq = TRACE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("trc_{millis}_{seq:x}")
}

pub(crate) fn log_request_start(
    trace_id: &str,
    request_id: &str,
    path: &str,
    group: &str,
    model: &str,
    is_stream: bool,
) {
    emit(format!(
        "ts={} event=REQUEST_START trace_id={} request_id={} path={} group={} model={} stream={}",
        now_ts(),
        sanitize_text(trace_id),
        sanitize_text(request_id),
        sanitize_text(path),
        sanitize_text(group),
        sanitize_text(if model.is_empty() { "-" } else { model }),
        is_stream,
    ));
}

pub(crate) fn log_attempt(trace_id: &str, attempt: usize, channel_id: i64, priority: i64) {
    emit(format!(
        "ts={} event=ATTEMPT trace_id={} attempt={} channel_id={} priority={}",
        now_ts(),
        sanitize_text(trace_id),
        attempt,
        channel_id,
        priority,
    ));
}

pub(crate) fn log_attempt_result(
    trace_id: &str,
    channel_id: i64,
    status: u16,
    retryable: bool,
    error: Option<&str>,
) {
    emit(format!(
        "ts={} event=ATTEMPT_RESULT trace_id={} channel_id={} status={} retryable={} error={}",
        now_ts(),
        sanitize_text(trace_id),
        channel_id,
        status,
        retryable,
        sanitize_text(error.unwrap_or("-")),
    ));
}

pub(crate) fn log_retry_chain(trace_id: &str, chain: &str) {
    emit(format!(
        "ts={} event=RETRY_CHAIN trace_id={} chain={}",
        now_ts(),
        sanitize_text(trace_id),
        sanitize_text(chain),
    ));
}

pub(crate) fn log_request_final(
    trace_id: &str,
    status: u16,
    elapsed_ms: u128,
    prompt_tokens: u64,
    completion_tokens: u64,
    error: Option<&str>,
) {
    emit(format!(
        "ts={} event=REQUEST_FINAL trace_id={} status={} elapsed_ms={} prompt_tokens={} completion_tokens={} error={}",
        now_ts(),
        sanitize_text(trace_id),
        status,
        elapsed_ms,
        prompt_tokens,
        completion_tokens,
        sanitize_text(error.unwrap_or("-")),
    ));
}
