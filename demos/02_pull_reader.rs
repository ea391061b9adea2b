//! # Pull-Mode Reader
//!
//! Pull scheduling inverts the data plane: the sink drives. Its streaming
//! task pulls ranges from a file-like src pad until EOS, then parks.
//! Activating the sink in pull mode brings the src up with it.
//!
//! ```text
//! [file src] <──pull_range── [reader sink] <── streaming task
//! ```
//!
//! Run: `cargo run --example 02_pull_reader`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sluice::buffer::Buffer;
use sluice::flow::FlowError;
use sluice::pad::{Pad, PadDirection, PadMode};
use sluice::task::TaskPoll;

fn main() -> sluice::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("sluice=debug")
        .init();

    let payload: Vec<u8> = (b'a'..=b'z').collect();

    let src = Pad::new("file", PadDirection::Src);
    src.set_getrange(move |_, offset, size| {
        let offset = offset as usize;
        if offset >= payload.len() {
            return Err(FlowError::Eos);
        }
        let end = (offset + size).min(payload.len());
        Ok(Buffer::from_data(&payload[offset..end]).with_offset(offset as u64))
    });

    let sink = Pad::new("reader", PadDirection::Sink);
    src.link(&sink)?;

    let done = Arc::new(AtomicBool::new(false));
    {
        let reader = sink.clone();
        let done = done.clone();
        let mut offset = 0u64;
        sink.set_task(move || match reader.pull_range(offset, 8) {
            Ok(buffer) => {
                println!(
                    "pulled {:2} bytes at {:2}: {}",
                    buffer.len(),
                    buffer.meta().offset,
                    String::from_utf8_lossy(buffer.data())
                );
                offset += buffer.len() as u64;
                TaskPoll::Continue
            }
            Err(FlowError::Eos) => {
                println!("end of stream, parking the loop");
                done.store(true, Ordering::SeqCst);
                TaskPoll::Pause
            }
            Err(e) => {
                eprintln!("pull failed: {}", e);
                TaskPoll::Stop
            }
        });
    }

    sink.activate_mode(PadMode::Pull, true)?;
    println!("src came up in {} mode", src.mode().name());

    while !done.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }

    sink.set_active(false)?;
    sink.stop_task()?;
    src.set_active(false)?;
    Ok(())
}
