//! Answers every packet with `Hello world!`.
//!
//! ```sh
//! RUST_LOG=info cargo run --example hello_server -- 127.0.0.1:5000
//! ```
//!
//! Then, in another terminal: `nc 127.0.0.1 5000`.

use std::env;

use log::info;

use select_sched::{AcceptLoop, EchoLoop, Error, Listener, Reply, Scheduler, HELLO};

fn main() -> Result<(), Error> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5000".to_string());

    let listener = Listener::bind(&addr)?;

    info!("Listening on {}", listener.local_addr()?);

    let mut scheduler = Scheduler::new();

    scheduler.spawn(AcceptLoop::new(listener, |stream, _peer| {
        EchoLoop::new(stream, Reply::Fixed(HELLO))
    }));

    scheduler.run()
}
