use channelrelay_core::relay::ChatStreamChunk;
use channelrelay_core::storage::now_ts;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde_json::Value;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::capability::RelayMode;
use super::rewrite::{rewrite_response_object, ModelField};

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";
const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";

#[derive(Debug, Clone)]
pub(crate) struct StreamRelayOptions {
    pub(crate) mode: RelayMode,
    pub(crate) model_alias: String,
    pub(crate) queue_capacity: usize,
    pub(crate) drain_grace: Duration,
}

/// What the producer observed once the upstream stream ended.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamSummary {
    /// Concatenated delta text plus tool names/arguments, for completion token counting.
    pub(crate) text: String,
    /// Largest tool-call list seen in a single frame.
    pub(crate) tool_calls: usize,
    pub(crate) forwarded_frames: usize,
    pub(crate) skipped_frames: usize,
    pub(crate) saw_done: bool,
    pub(crate) cancelled: bool,
    pub(crate) read_error: Option<String>,
    pub(crate) first_byte_at: Option<Instant>,
}

struct StreamAccumulator {
    mode: RelayMode,
    text: String,
    tool_calls: usize,
}

impl StreamAccumulator {
    fn new(mode: RelayMode) -> Self {
        Self {
            mode,
            text: String::new(),
            tool_calls: 0,
        }
    }

    fn observe(&mut self, frame: &str) {
        if !matches!(self.mode, RelayMode::ChatCompletions | RelayMode::Completions) {
            return;
        }
        let Ok(chunk) = serde_json::from_str::<ChatStreamChunk>(frame) else {
            return;
        };
        for choice in chunk.choices {
            if self.mode == RelayMode::Completions {
                if let Some(text) = choice.text.as_deref() {
                    self.text.push_str(text);
                }
                continue;
            }
            self.text.push_str(&choice.delta.content.text());
            if let Some(tool_calls) = choice.delta.tool_calls {
                self.tool_calls = self.tool_calls.max(tool_calls.len());
                for tool in tool_calls {
                    self.text.push_str(&tool.function.name);
                    self.text.push_str(&tool.function.arguments);
                }
            }
        }
    }
}

/// Client-side body of a relayed stream. tiny_http pulls from it on the worker thread.
pub(crate) struct SseRelayReader {
    data_rx: Receiver<Vec<u8>>,
    done_rx: Receiver<()>,
    out_cursor: Cursor<Vec<u8>>,
    first_byte: Arc<OnceLock<Instant>>,
    cancelled: Arc<AtomicBool>,
    finished: bool,
}

impl SseRelayReader {
    fn next_item(&mut self) -> Option<Vec<u8>> {
        select! {
            recv(self.data_rx) -> item => item.ok(),
            // 中文注释：完成信号到达后仍先清空队列，队列为空才结束。
            recv(self.done_rx) -> _ => self.data_rx.try_recv().ok(),
        }
    }
}

impl Read for SseRelayReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let read = self.out_cursor.read(buf)?;
            if read > 0 {
                return Ok(read);
            }
            if self.finished {
                return Ok(0);
            }
            match self.next_item() {
                Some(item) => {
                    let _ = self.first_byte.set(Instant::now());
                    self.out_cursor = Cursor::new(item);
                }
                None => self.finished = true,
            }
        }
    }
}

impl Drop for SseRelayReader {
    fn drop(&mut self) {
        if !self.finished {
            self.cancelled.store(true, Ordering::Relaxed);
        }
    }
}

pub(crate) struct StreamRelayHandle {
    join: JoinHandle<StreamSummary>,
    first_byte: Arc<OnceLock<Instant>>,
}

impl StreamRelayHandle {
    /// Waits for the producer. Call after the reader has been fully consumed or dropped.
    pub(crate) fn join(self) -> StreamSummary {
        let mut summary = match self.join.join() {
            Ok(summary) => summary,
            Err(_) => {
                log::error!("event=stream_relay_panicked");
                StreamSummary::default()
            }
        };
        summary.first_byte_at = self.first_byte.get().copied();
        summary
    }
}

pub(crate) fn start_stream_relay(
    upstream: Box<dyn Read + Send>,
    options: StreamRelayOptions,
) -> Result<(SseRelayReader, StreamRelayHandle), String> {
    let (data_tx, data_rx) = bounded::<Vec<u8>>(options.queue_capacity.max(1));
    let (done_tx, done_rx) = bounded::<()>(1);
    let cancelled = Arc::new(AtomicBool::new(false));
    let first_byte = Arc::new(OnceLock::new());

    let producer_cancelled = Arc::clone(&cancelled);
    let join = thread::Builder::new()
        .name("relay-stream-producer".to_string())
        .spawn(move || run_producer(upstream, options, data_tx, done_tx, producer_cancelled))
        .map_err(|err| format!("spawn stream producer failed: {err}"))?;

    let reader = SseRelayReader {
        data_rx,
        done_rx,
        out_cursor: Cursor::new(Vec::new()),
        first_byte: Arc::clone(&first_byte),
        cancelled,
        finished: false,
    };
    Ok((reader, StreamRelayHandle { join, first_byte }))
}

fn event_bytes(frame: &str) -> Vec<u8> {
    let mut event = Vec::with_capacity(DATA_PREFIX.len() + frame.len() + 2);
    event.extend_from_slice(DATA_PREFIX.as_bytes());
    event.extend_from_slice(frame.as_bytes());
    event.extend_from_slice(b"\n\n");
    event
}

fn run_producer(
    upstream: Box<dyn Read + Send>,
    options: StreamRelayOptions,
    data_tx: Sender<Vec<u8>>,
    done_tx: Sender<()>,
    cancelled: Arc<AtomicBool>,
) -> StreamSummary {
    let mut reader = BufReader::new(upstream);
    let mut accumulator = StreamAccumulator::new(options.mode);
    let mut summary = StreamSummary::default();
    let mut rng = rand::thread_rng();
    let mut line = Vec::new();

    loop {
        if cancelled.load(Ordering::Relaxed) {
            summary.cancelled = true;
            break;
        }
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                log::warn!("event=stream_upstream_read_failed err={}", err);
                summary.read_error = Some(err.to_string());
                break;
            }
        }
        let decoded = String::from_utf8_lossy(&line);
        let text = decoded.trim_end_matches(['\n', '\r']);
        if text.len() < DATA_PREFIX.len() {
            continue;
        }
        let payload = match text.strip_prefix(DATA_PREFIX) {
            Some(payload) => payload,
            None if text == DONE_SENTINEL => DONE_SENTINEL,
            None => continue,
        };
        if payload.starts_with(DONE_SENTINEL) {
            if !summary.saw_done {
                summary.saw_done = true;
                if data_tx.send(DONE_EVENT.to_vec()).is_err() {
                    summary.cancelled = true;
                    break;
                }
            }
            // 中文注释：哨兵之后继续读到 EOF，让上游连接正常收尾，但不再转发。
            continue;
        }
        if summary.saw_done {
            summary.skipped_frames += 1;
            continue;
        }

        let mut frame = match serde_json::from_str::<Value>(payload) {
            Ok(Value::Object(frame)) => frame,
            Ok(_) => {
                log::warn!("event=stream_frame_skipped reason=not_object");
                summary.skipped_frames += 1;
                continue;
            }
            Err(err) => {
                log::warn!("event=stream_frame_skipped reason=invalid_json err={}", err);
                summary.skipped_frames += 1;
                continue;
            }
        };
        rewrite_response_object(
            &mut frame,
            &options.model_alias,
            ModelField::ReplaceIfPresent,
            now_ts(),
            &mut rng,
        );
        let serialized = match serde_json::to_string(&frame) {
            Ok(serialized) => serialized,
            Err(err) => {
                log::warn!("event=stream_frame_skipped reason=serialize err={}", err);
                summary.skipped_frames += 1;
                continue;
            }
        };
        accumulator.observe(&serialized);
        if data_tx.send(event_bytes(&serialized)).is_err() {
            summary.cancelled = true;
            break;
        }
        summary.forwarded_frames += 1;
    }

    if !summary.cancelled && !data_tx.is_empty() && !options.drain_grace.is_zero() {
        thread::sleep(options.drain_grace);
    }
    let _ = done_tx.send(());
    summary.text = accumulator.text;
    summary.tool_calls = accumulator.tool_calls;
    summary
}
