fn main() {
    channelrelay_service::portable::bootstrap_current_process();
    let addr = std::env::var(channelrelay_service::ENV_SERVICE_ADDR)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| channelrelay_service::DEFAULT_ADDR.to_string());
    println!("channelrelay-service listening on {addr}");
    if let Err(err) = channelrelay_service::start_server(&addr) {
        eprintln!("service stopped: {err}");
        std::process::exit(1);
    }
}
