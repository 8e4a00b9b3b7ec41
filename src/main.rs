use tracing::info;

use warden::config::Config;
use warden::http::{HttpError, HttpRequest, Response};
use warden::server::HttpServer;

fn hello(request: &HttpRequest) -> Result<Response, HttpError> {
    match request.path.as_str() {
        "/" => Ok(Response::ok("Hello from Warden\n")),
        path => Err(HttpError::not_found(format!("no handler for {path}\n"))),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    info!(loops = cfg.server.io_loops, "starting");

    let mut server = HttpServer::new(cfg.server, hello);
    server.bind()?;
    server.start()?;
    server.join();

    Ok(())
}
