//! Echo server demo
//!
//! ```sh
//! echo 127.0.0.1:9001
//! websocat ws://127.0.0.1:9001/
//! ```

use std::sync::Arc;
use std::time::Duration;

use riptide_ws::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Echo;

impl SubProtocol for Echo {
    fn name(&self) -> &str {
        ""
    }

    fn create_session(&self) -> Box<dyn WsSession> {
        Box::new(EchoSession)
    }
}

struct EchoSession;

impl WsSession for EchoSession {
    fn on_connect(&mut self, ctx: &mut WsContext<'_>) {
        info!(conn = %ctx.handle(), remote = ctx.remote(), "client connected");
    }

    fn on_frame(&mut self, ctx: &mut WsContext<'_>, msg: Message) {
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                ctx.send_message(msg);
            }
            Message::Close(reason) => {
                info!(conn = %ctx.handle(), ?reason, "client closing");
            }
            _ => {}
        }
    }

    fn on_disconnect(&mut self) {
        info!("client gone");
    }
}

struct Index;

impl RequestHandler for Index {
    fn handle(&self, req: &HttpRequest) -> HttpResponse {
        match req.path.as_str() {
            "/" => HttpResponse::text("riptide echo server; connect a WebSocket client\n"),
            _ => HttpResponse::not_found(),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9001".to_string());

    let mut protocols = ProtocolRegistry::new();
    protocols.register(Arc::new(Echo));

    let server = Server::bind(&addr, Config::default(), protocols, Some(Arc::new(Index)))?;
    server.start()?;
    info!(%addr, "echo server running");

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
