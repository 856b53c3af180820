// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A modal dialog built on a secondary loop.
//!
//! This example shows how to combine:
//! - source adoption, so a worker context can post straight to the window,
//! - a filtered `SecondaryLoop` that holds back window input while the dialog
//!   is open,
//! - coalescing of pointer moves and paints that piled up meanwhile,
//! - `push`/`pop` to divert input into a temporary queue.
//!
//! Run:
//! - `RUST_LOG=understory_dispatch=debug cargo run -p understory_demos --example modal_dialog`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kurbo::{Point, Rect};
use tracing_subscriber::EnvFilter;
use understory_dispatch::{
    Context, DispatchConfig, DispatchError, Event, EventBody, Runtime, SecondaryLoop,
};

const WINDOW: u32 = 1;
const DIALOG: u32 = 2;
const WORKER: u32 = 3;

#[derive(Clone, Debug, PartialEq)]
enum Msg {
    Click,
    Close,
    Progress(u8),
}

type Cx = Context<u32, Msg>;

fn describe(event: &Event<u32, Msg>) -> String {
    let source = match event.source {
        Some(WINDOW) => "window",
        Some(DIALOG) => "dialog",
        Some(WORKER) => "worker",
        _ => "system",
    };
    match &event.body {
        EventBody::Paint(rect) => format!("{source}: paint {rect:?}"),
        EventBody::PointerMove(pos) => format!("{source}: pointer at {pos:?}"),
        other => format!("{source}: {other:?}"),
    }
}

fn main() -> Result<(), DispatchError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runtime: Runtime<u32, Msg> =
        Runtime::with_config(DispatchConfig::default().with_idle_grace(Duration::from_millis(200)));
    let dialog: Arc<Mutex<Option<SecondaryLoop<u32, Msg>>>> = Arc::default();

    let app = {
        let dialog = Arc::clone(&dialog);
        runtime.create_context("app", move |cx: &Cx, event: Event<u32, Msg>| {
            println!("app    <- {}", describe(&event));
            match (event.source, event.body) {
                (Some(WINDOW), EventBody::Other(Msg::Click)) => {
                    // Only dialog (and worker) events get through until it closes.
                    let modal = cx
                        .secondary_loop()
                        .with_filter(|e| e.source != Some(WINDOW))
                        .build();
                    *dialog.lock().unwrap() = Some(modal.clone());
                    println!("app    :: dialog opened");
                    modal.enter();
                    println!("app    :: dialog closed");
                }
                (Some(DIALOG), EventBody::Other(Msg::Close)) => {
                    if let Some(modal) = dialog.lock().unwrap().take() {
                        modal.exit();
                    }
                }
                _ => {}
            }
        })
    };
    app.adopt(WINDOW);
    app.adopt(DIALOG);

    let worker = runtime.create_context("worker", |_: &Cx, event: Event<u32, Msg>| {
        println!("worker <- {}", describe(&event));
    });
    worker.adopt(WORKER);

    // Open the dialog, then pile up window input behind it.
    app.post(Event::other(WINDOW, Msg::Click));
    for x in 0..5 {
        app.post(Event::pointer_move(WINDOW, Point::new(f64::from(x) * 10.0, 0.0)));
    }
    app.post(Event::paint(WINDOW, Rect::new(0.0, 0.0, 10.0, 10.0)));
    app.post(Event::paint(WINDOW, Rect::new(0.0, 0.0, 50.0, 50.0)));

    // The worker talks to the dialog through the app's queue.
    worker.post(Event::other(DIALOG, Msg::Progress(50)));
    worker.post(Event::other(DIALOG, Msg::Close));

    // Blocks until the dialog has closed and the window got the report.
    worker.post_and_wait(Event::other(WINDOW, Msg::Progress(100)))?;

    // Divert app input into a temporary queue, then fold it back.
    let overlay = app.create_queue();
    app.push(&overlay)?;
    app.post(Event::other(WINDOW, Msg::Progress(101)));
    println!("main   :: overlay depth {}, top {}", overlay.depth(), overlay.is_top());
    app.pop()?;

    runtime.shutdown();
    let stopped = runtime.await_termination(Duration::from_secs(5));
    println!("main   :: dispatch threads stopped: {stopped}");
    Ok(())
}
