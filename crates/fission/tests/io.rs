//! Pipe round-trip through the IO extension.

#![cfg(unix)]

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;

use fission::{Config, IoInterest, PowerPlant, ReactionHandle};

#[test]
fn test_pipe_roundtrip() {
    let (tx, rx) = mio::unix::pipe::new().unwrap();

    let events: Arc<Mutex<Vec<String>>> = Arc::default();
    let mut plant = PowerPlant::new(Config {
        threads: 1,
        ..Config::default()
    })
    .unwrap();
    let ctx = plant.context();

    events.lock().unwrap().push("Pipe created".to_owned());

    {
        let events = events.clone();
        let handle = ctx.handle();
        ctx.on_io(rx.as_raw_fd(), IoInterest::Read).then(move |e| {
            let mut c = [0u8; 1];
            let bytes = unsafe { libc::read(e.fd, c.as_mut_ptr().cast(), 1) };

            events
                .lock()
                .unwrap()
                .push(format!("Read {bytes} bytes ({}) from pipe", c[0] as char));

            if c[0] == b'o' {
                handle.shutdown();
            }
        });
    }

    let writer: Arc<Mutex<Option<ReactionHandle>>> = Arc::default();
    let binding = {
        let events = events.clone();
        let writer = writer.clone();
        let char_no = AtomicUsize::new(0);

        ctx.on_io(tx.as_raw_fd(), IoInterest::Write).then(move |e| {
            let no = char_no.fetch_add(1, Ordering::SeqCst);
            let c = b"Hello"[no];
            let sent = unsafe { libc::write(e.fd, (&c as *const u8).cast(), 1) };

            events
                .lock()
                .unwrap()
                .push(format!("Wrote {sent} bytes ({}) to pipe", c as char));

            if no + 1 == 5 {
                if let Some(writer) = writer.lock().unwrap().take() {
                    writer.unbind();
                }
            }
        })
    };
    *writer.lock().unwrap() = Some(binding);

    // Wedged pipes should fail the assertions, not hang the test.
    let watchdog = plant.handle();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(30));
        watchdog.shutdown();
    });

    plant.start().unwrap();

    let expected = vec![
        "Pipe created",
        "Wrote 1 bytes (H) to pipe",
        "Read 1 bytes (H) from pipe",
        "Wrote 1 bytes (e) to pipe",
        "Read 1 bytes (e) from pipe",
        "Wrote 1 bytes (l) to pipe",
        "Read 1 bytes (l) from pipe",
        "Wrote 1 bytes (l) to pipe",
        "Read 1 bytes (l) from pipe",
        "Wrote 1 bytes (o) to pipe",
        "Read 1 bytes (o) from pipe",
    ];
    assert_eq!(*events.lock().unwrap(), expected);
}
