//! Fetch a couple of resources from httpbin.org over plain HTTP, reusing
//! one connection.

use core::cell::{Cell, RefCell};

use std::rc::Rc;

use embassy_futures::select::select;

use embassy_time::{Duration, Timer};

use futures_lite::future::block_on;

use log::*;

use roost::io::client::Client;
use roost::stack::Plain;

fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let client = Client::new(Plain::new(), "httpbin.org");

    let done = Rc::new(Cell::new(0_usize));
    let resources = ["/ip", "/headers"];

    for resource in resources {
        let request = client.get(resource);

        let body = Rc::new(RefCell::new(Vec::new()));

        request
            .on_header(move |header| {
                info!(
                    "{resource} header block:\n{}",
                    String::from_utf8_lossy(header.raw())
                );
            })
            .on_body_chunk({
                let body = body.clone();

                move |chunk| body.borrow_mut().extend_from_slice(chunk)
            })
            .on_complete({
                let done = done.clone();

                move |result| {
                    match result {
                        Ok(()) => info!(
                            "{resource} body:\n=================\n{}\n=================",
                            String::from_utf8_lossy(&body.borrow())
                        ),
                        Err(e) => warn!("{resource} failed: {e}"),
                    }

                    done.set(done.get() + 1);
                }
            });

        client.schedule(&request);
    }

    block_on(async {
        select(client.run(), async {
            while done.get() < resources.len() {
                Timer::after(Duration::from_millis(10)).await;
            }
        })
        .await;
    });
}
