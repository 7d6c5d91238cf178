// Opens a session over a real joystick and dumps the virtual device's
// events, driving the bridge the way a character-device host would:
//
//     cargo run --example dump -- -I /dev/input/js0 -c my-map.xml -M 13 -m 0

use std::sync::mpsc;

use clap::Parser;
use jshift::host::ReadReply;
use jshift::{Options, Session};
use jshift_core::abi::{JsEvent, EVENT_SIZE, JS_EVENT_INIT};
use nix::errno::Errno;

struct ChannelReply(mpsc::Sender<Result<Vec<u8>, Errno>>);

impl ReadReply for ChannelReply {
    fn data(self: Box<Self>, buf: &[u8]) {
        let _ = self.0.send(Ok(buf.to_vec()));
    }

    fn error(self: Box<Self>, errno: Errno) {
        let _ = self.0.send(Err(errno));
    }
}

fn main() {
    env_logger::init();

    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(e) => {
            let _ = e.print();
            std::process::exit(jshift::opt::EXIT_USAGE);
        }
    };
    let (config, info) = match options.resolve() {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(jshift::opt::EXIT_USAGE);
        }
    };
    println!("would register {} ({}:{})", info.devname, info.major, info.minor);

    let session = Session::new(config).expect("can't start session");
    let fh = match session.open() {
        Ok(fh) => fh,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let (tx, rx) = mpsc::channel();
    loop {
        session.read(fh, Box::new(ChannelReply(tx.clone())), 64 * EVENT_SIZE, false);
        match rx.recv() {
            Ok(Ok(buf)) => {
                for chunk in buf.chunks_exact(EVENT_SIZE) {
                    let event = JsEvent::from_bytes(chunk.try_into().unwrap());
                    let init = if event.kind & JS_EVENT_INIT != 0 { " (init)" } else { "" };
                    println!(
                        "{:10} type {:#04x} number {:3} value {:6}{}",
                        event.time,
                        event.kind & !JS_EVENT_INIT,
                        event.number,
                        event.value,
                        init
                    );
                }
            }
            Ok(Err(errno)) => {
                eprintln!("read failed: {}", errno);
                break;
            }
            Err(_) => break,
        }
    }

    session.release(fh);
}
