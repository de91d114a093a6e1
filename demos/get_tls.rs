//! Fetch a resource from httpbin.org over TLS, verifying the peer
//! against the system trust roots.

use core::cell::{Cell, RefCell};

use std::rc::Rc;

use embassy_futures::select::select;

use embassy_time::{Duration, Timer};

use futures_lite::future::block_on;

use log::*;

use roost::io::client::Client;
use roost::stack::Tls;

fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let tls = Tls::new().expect("system trust roots");

    let client = Client::new(tls, "httpbin.org");

    client.on_connect(|result| match result {
        Ok(()) => info!("TLS connection established"),
        Err(e) => warn!("TLS connect failed: {e}"),
    });

    let done = Rc::new(Cell::new(false));
    let body = Rc::new(RefCell::new(Vec::new()));

    let request = client.get("/get");

    request
        .on_body_chunk({
            let body = body.clone();

            move |chunk| body.borrow_mut().extend_from_slice(chunk)
        })
        .on_complete({
            let done = done.clone();

            move |result| {
                match result {
                    Ok(()) => info!(
                        "Body:\n=================\n{}\n=================",
                        String::from_utf8_lossy(&body.borrow())
                    ),
                    Err(e) => warn!("Request failed: {e}"),
                }

                done.set(true);
            }
        });

    request.schedule();

    block_on(async {
        select(client.run(), async {
            while !done.get() {
                Timer::after(Duration::from_millis(10)).await;
            }
        })
        .await;
    });
}
