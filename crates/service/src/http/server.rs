use std::io;
use std::thread;
use tiny_http::{Request, Server};

use crate::http::router::handle_request;
use crate::http::worker_pool::WorkerPool;

pub(crate) const SHUTDOWN_PATH: &str = "/__shutdown";

pub(crate) struct RunningServer {
    pub(crate) addr: String,
    pub(crate) join: thread::JoinHandle<()>,
}

fn bind(addr: &str) -> io::Result<(Server, String)> {
    let server = Server::http(addr).map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    let bound = server
        .server_addr()
        .to_ip()
        .map(|address| address.to_string())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "server addr missing"))?;
    Ok((server, bound))
}

fn is_local_shutdown(request: &Request) -> bool {
    request.url() == SHUTDOWN_PATH
        && request
            .remote_addr()
            .is_some_and(|remote| remote.ip().is_loopback())
}

fn run_server(server: Server) {
    let pool = WorkerPool::start(handle_request);
    for request in server.incoming_requests() {
        if is_local_shutdown(&request) {
            let _ = request.respond(tiny_http::Response::from_string("shutdown"));
            break;
        }
        if pool.enqueue(request).is_err() {
            log::error!("event=http_enqueue_failed reason=workers_gone");
            break;
        }
    }
    log::info!("event=http_server_stopped");
}

/// Serves on the calling thread until a shutdown request arrives.
pub(crate) fn start_http(addr: &str) -> io::Result<()> {
    let (server, bound) = bind(addr)?;
    log::info!("event=http_server_started addr={}", bound);
    run_server(server);
    Ok(())
}

pub(crate) fn spawn_http(addr: &str) -> io::Result<RunningServer> {
    let (server, bound) = bind(addr)?;
    let join = thread::Builder::new()
        .name("relay-http-accept".to_string())
        .spawn(move || run_server(server))?;
    Ok(RunningServer { addr: bound, join })
}
