//! Two plants meshed over loopback multicast.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fission::net::wire;
use fission::{Config, Handle, PeerJoined, PeerLeft, PowerPlant};

/// A payload type shared by both plants.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Note(String);

impl wire::Encode for Note {
    fn encode(&self, buf: &mut impl bytes::BufMut) {
        (self.0.len() as u16).encode(buf);
        buf.put_slice(self.0.as_bytes());
    }
}

impl wire::Decode for Note {
    fn decode(buf: &mut impl bytes::Buf) -> Result<Self, wire::Error> {
        let len = u16::decode(buf)? as usize;
        let mut bytes = vec![0; len];
        buf.try_copy_to_slice(&mut bytes)?;

        Ok(Self(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

fn network_config(name: &str, port: u16) -> Config {
    Config {
        threads: 2,
        network: Some(fission::net::Config {
            name: name.to_owned(),
            port,
            announce_interval: Duration::from_millis(100),
            ..fission::net::Config::default()
        }),
        ..Config::default()
    }
}

fn test_port() -> u16 {
    static OFFSET: AtomicU16 = AtomicU16::new(100);

    21000 + (std::process::id() % 16384) as u16 + OFFSET.fetch_add(1, Ordering::Relaxed)
}

fn watchdog(handle: Handle) {
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(30));
        handle.shutdown();
    });
}

#[test]
fn test_discovery_typed_payload_and_leave() {
    let port = test_port();

    let joins = Arc::new(AtomicUsize::new(0));
    let received: Arc<Mutex<Option<(String, Note)>>> = Arc::default();

    // Plant B: receives one Note from the mesh, then shuts down.
    let received_b = received.clone();
    let plant_b = thread::Builder::new()
        .name("plant-b".to_owned())
        .spawn(move || {
            let mut plant = PowerPlant::new(network_config("B", port)).unwrap();
            let ctx = plant.context();
            watchdog(plant.handle());

            let handle = ctx.handle();
            ctx.on_network::<Note>().then(move |from| {
                *received_b.lock().unwrap() = Some((from.peer.name.clone(), from.value.clone()));
                handle.shutdown();
            });

            plant.start().unwrap();
        })
        .unwrap();

    // Plant A: on discovering B, sends it a reliable Note; on B's
    // departure, shuts down.
    let joins_a = joins.clone();
    let plant_a = thread::Builder::new()
        .name("plant-a".to_owned())
        .spawn(move || {
            let mut plant = PowerPlant::new(network_config("A", port)).unwrap();
            let ctx = plant.context();
            watchdog(plant.handle());

            {
                let ctx = ctx.clone();
                let joins = joins_a.clone();
                ctx.clone().on::<PeerJoined>().then(move |peer| {
                    if peer.name == "B" {
                        joins.fetch_add(1, Ordering::SeqCst);
                        ctx.emit_network(&Note("hello over the mesh".to_owned()), Some("B"), true);
                    }
                });
            }
            {
                let handle = ctx.handle();
                ctx.on::<PeerLeft>().then(move |peer| {
                    if peer.name == "B" {
                        handle.shutdown();
                    }
                });
            }

            plant.start().unwrap();
        })
        .unwrap();

    plant_b.join().unwrap();
    plant_a.join().unwrap();

    assert!(joins.load(Ordering::SeqCst) >= 1, "A discovered B");

    let received = received.lock().unwrap().take().expect("B received the note");
    assert_eq!(received.0, "A", "payload carries the sender's identity");
    assert_eq!(received.1, Note("hello over the mesh".to_owned()));
}

#[test]
fn test_rejects_invalid_network_config() {
    let config = Config {
        network: Some(fission::net::Config {
            group: "10.0.0.1".to_owned(),
            ..fission::net::Config::default()
        }),
        ..Config::default()
    };
    assert!(PowerPlant::new(config).is_err());

    let config = Config {
        threads: 0,
        ..Config::default()
    };
    assert!(PowerPlant::new(config).is_err());
}
