//! loopnet-echo: an echo server on the loopnet engine
//!
//! Every decoded frame is written back to its sender. Useful as a smoke
//! test for codecs, transports and load-balancing settings:
//!
//! ```text
//! loopnet-echo --listen tcp://127.0.0.1:9000 --multicore
//! loopnet-echo --config echo.toml --log-level debug
//! ```

mod cli;

use cli::Config;
use loopnet::{serve, Action, Conn, EventHandler, Server};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Echoes frames and keeps a handle for Ctrl-C.
struct EchoHandler {
    server: Arc<Mutex<Option<Server>>>,
}

impl EventHandler for EchoHandler {
    fn on_init_complete(&self, server: &Server) -> Action {
        info!(
            addr = %server.addr(),
            network = %server.network(),
            loops = server.num_event_loop(),
            reuse_port = server.reuse_port(),
            "Echo server ready"
        );
        *self.server.lock() = Some(server.clone());
        Action::None
    }

    fn on_shutdown(&self, _server: &Server) {
        info!("Echo server stopped");
    }

    fn on_opened(&self, conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        debug!(remote = %conn.remote_addr(), loop_id = conn.loop_index(), "Client connected");
        (None, Action::None)
    }

    fn on_closed(&self, conn: &mut Conn, err: Option<&io::Error>) -> Action {
        match err {
            Some(e) => debug!(remote = %conn.remote_addr(), error = %e, "Client disconnected"),
            None => debug!(remote = %conn.remote_addr(), "Client disconnected"),
        }
        Action::None
    }

    fn react(&self, frame: Option<&[u8]>, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (frame.map(<[u8]>::to_vec), Action::None)
    }

    fn tick(&self) -> (Duration, Action) {
        if let Some(server) = self.server.lock().as_ref() {
            info!(connections = server.count_connections(), "Tick");
        }
        (Duration::from_secs(1), Action::None)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        loops = config.options.event_loop_count(),
        reuse_port = config.options.reuse_port,
        lb = ?config.options.load_balancing,
        codec = ?config.options.codec,
        "Starting loopnet-echo"
    );

    let server = Arc::new(Mutex::new(None::<Server>));
    let signal_target = Arc::clone(&server);
    ctrlc::set_handler(move || match signal_target.lock().as_ref() {
        Some(server) => {
            info!("Interrupt received, shutting down");
            server.shutdown();
        }
        None => {
            warn!("Interrupt received before startup finished; exiting");
            std::process::exit(130);
        }
    })?;

    serve(EchoHandler { server }, &config.listen, config.options)?;
    Ok(())
}
