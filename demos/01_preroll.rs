//! # Prerolling Sink
//!
//! A sink element that prerolls: the `ReadyToPaused` transition stays
//! half done until the first buffer arrives, then the element finishes
//! the walk to `Playing` on its own while the application watches the
//! bus.
//!
//! ```text
//! [producer thread] ──push──> [sink pad] ──chain──> continue_state
//! ```
//!
//! Run: `cargo run --example 01_preroll`

use std::thread;

use sluice::buffer::Buffer;
use sluice::bus::Message;
use sluice::clock::ClockTime;
use sluice::element::{
    Element, ElementImpl, State, StateChange, StateChangeResult, StateChangeSuccess,
};
use sluice::event::{Caps, Event, Segment};
use sluice::flow::FlowSuccess;
use sluice::pad::{Pad, PadDirection};

struct PrerollSink;

impl ElementImpl for PrerollSink {
    fn change_state(&self, _element: &Element, transition: StateChange) -> StateChangeResult {
        match transition {
            // Commit Paused only once the first buffer is in.
            StateChange::ReadyToPaused => Ok(StateChangeSuccess::Async),
            _ => Ok(StateChangeSuccess::Success),
        }
    }
}

#[tokio::main]
async fn main() -> sluice::Result<()> {
    // Initialize tracing to see the state walk
    tracing_subscriber::fmt()
        .with_env_filter("sluice=debug")
        .init();

    let element = Element::new("displaysink", PrerollSink);
    let sink = Pad::new("sink", PadDirection::Sink);
    {
        let element = element.clone();
        sink.set_chain(move |_, buffer| {
            println!(
                "frame {}: {} bytes",
                buffer.meta().sequence,
                buffer.len()
            );
            if buffer.meta().sequence == 0 {
                element.continue_state(StateChangeSuccess::Success);
            }
            Ok(FlowSuccess::Ok)
        });
    }
    element.add_pad(sink.clone())?;

    let src = Pad::new("src", PadDirection::Src);
    src.link(&sink)?;
    src.set_active(true)?;

    let mut rx = element.bus().subscribe();
    let watcher = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            println!("bus: {}", message);
            if matches!(message, Message::AsyncDone { .. }) {
                break;
            }
        }
    });

    match element.set_state(State::Playing) {
        Ok(StateChangeSuccess::Async) => println!("prerolling..."),
        other => println!("unexpected verdict: {:?}", other),
    }

    let producer = thread::spawn(move || {
        src.push_event(Event::StreamStart {
            stream_id: "demo-0".into(),
        })
        .unwrap();
        src.push_event(Event::Caps {
            caps: Caps::new("video/raw"),
        })
        .unwrap();
        src.push_event(Event::Segment {
            segment: Segment::default(),
        })
        .unwrap();
        for seq in 0..5u64 {
            src.push(Buffer::with_size(16).with_sequence(seq)).unwrap();
        }
        src.push_event(Event::Eos).unwrap();
    });

    let (result, state, _) = element.get_state(ClockTime::from_secs(5));
    println!("settled: {:?} in {}", result, state);

    producer.join().unwrap();
    watcher.await.unwrap();

    element.set_state(State::Null).unwrap();
    Ok(())
}
