use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

mod gateway;
mod http;
mod lock_utils;
pub mod process_env;
#[path = "storage/storage_helpers.rs"]
mod storage_helpers;

pub const DEFAULT_ADDR: &str = "localhost:48770";
pub const ENV_SERVICE_ADDR: &str = "CHANNELRELAY_SERVICE_ADDR";

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub mod portable {
    // 中文注释：发行物使用“同目录可选 env 文件 + 默认 DB”机制，做到解压即用。
    pub fn bootstrap_current_process() {
        crate::process_env::load_env_from_exe_dir();
        crate::process_env::ensure_default_db_path();
    }
}

pub struct ServerHandle {
    pub addr: String,
    join: thread::JoinHandle<()>,
}

impl ServerHandle {
    pub fn join(self) {
        let _ = self.join.join();
    }

    /// Requests shutdown and waits for the accept loop to exit.
    pub fn shutdown(self) {
        request_shutdown(&self.addr);
        self.join();
    }
}

/// Applies env config, prepares the database and loads the ability directory.
fn prepare_runtime() {
    portable::bootstrap_current_process();
    gateway::reload_runtime_config_from_env();
    // 中文注释：启动阶段显式建表一次；不放进每次 open_storage，避免热路径重复做迁移检查。
    if let Err(err) = storage_helpers::initialize_storage() {
        log::warn!("storage startup init skipped: {}", err);
    }
    if let Err(err) = gateway::reload_shared_directory() {
        log::warn!("event=directory_initial_load_failed err={}", err);
    }
}

/// Runs the relay on `addr` until shutdown is requested.
pub fn start_server(addr: &str) -> io::Result<()> {
    clear_shutdown_flag();
    prepare_runtime();
    gateway::enable_trace_file();
    gateway::ensure_directory_sync();
    let result = http::server::start_http(addr);
    gateway::flush_trace_log();
    result
}

/// Starts the relay on a background thread; the returned handle carries the bound address.
/// Pass `127.0.0.1:0` to get an ephemeral port.
pub fn start_background_server(addr: &str) -> io::Result<ServerHandle> {
    clear_shutdown_flag();
    prepare_runtime();
    let running = http::server::spawn_http(addr)?;
    Ok(ServerHandle {
        addr: running.addr,
        join: running.join,
    })
}

/// Reloads the ability directory from the database now.
pub fn reload_directory() -> Result<(), String> {
    gateway::reload_shared_directory()
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

pub fn clear_shutdown_flag() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
}

pub fn request_shutdown(addr: &str) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    // Best-effort wakeups for both IPv4 and IPv6 loopback so whichever listener is active exits.
    let _ = send_shutdown_request(addr);
    let addr_trimmed = addr.trim();
    if addr_trimmed.len() > "localhost:".len()
        && addr_trimmed[..("localhost:".len())].eq_ignore_ascii_case("localhost:")
    {
        let port = &addr_trimmed["localhost:".len()..];
        let _ = send_shutdown_request(&format!("127.0.0.1:{port}"));
        let _ = send_shutdown_request(&format!("[::1]:{port}"));
    }
}

fn send_shutdown_request(addr: &str) -> io::Result<()> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Ok(());
    }
    let addr = addr.strip_prefix("http://").unwrap_or(addr);
    let addr = addr.split('/').next().unwrap_or(addr);
    let mut stream = TcpStream::connect(addr)?;
    let _ = stream.set_write_timeout(Some(Duration::from_millis(200)));
    let _ = stream.set_read_timeout(Some(Duration::from_millis(200)));
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n",
        http::server::SHUTDOWN_PATH
    );
    stream.write_all(request.as_bytes())?;
    Ok(())
}
