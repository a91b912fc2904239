//! Broadcast chat over a length-prefixed framing: every frame a client sends
//! is relayed to all connected clients.
//!
//! Frame layout: 4-byte big-endian length, then the payload.

use mill_reactor::{error::Result, prelude::*};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

const HEADER_LEN: usize = 4;
const MAX_MESSAGE_LEN: usize = 64 * 1024;

type Sessions = Arc<Mutex<HashMap<String, ConnectionHandle>>>;

fn encode(message: &[u8]) -> Vec<u8> {
    let mut buf = Buffer::with_capacity(message.len());
    buf.append(message);
    buf.prepend(&(message.len() as u32).to_be_bytes());
    let len = buf.readable_bytes();
    buf.retrieve_as_bytes(len)
}

/// Pops every complete frame off `buf`; `Err` carries an oversized length.
fn decode(buf: &mut Buffer) -> std::result::Result<Vec<Vec<u8>>, usize> {
    let mut frames = Vec::new();
    while buf.readable_bytes() >= HEADER_LEN {
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&buf.peek()[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(len);
        }
        if buf.readable_bytes() < HEADER_LEN + len {
            break;
        }
        buf.retrieve(HEADER_LEN);
        frames.push(buf.retrieve_as_bytes(len));
    }
    Ok(frames)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let event_loop = EventLoop::new()?;
    let config = TcpServerConfig::builder()
        .address("0.0.0.0:9981".parse().unwrap())
        .name("ChatServer")
        .thread_num(4)
        .logger(Arc::new(TracingLogger))
        .build();
    let server = TcpServer::new(&event_loop, config)?;

    let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));

    let on_connection = sessions.clone();
    server.set_connection_callback(move |conn| {
        let mut sessions = on_connection.lock().unwrap();
        if conn.connected() {
            sessions.insert(conn.name().to_owned(), conn.handle());
        } else {
            sessions.remove(conn.name());
        }
        println!("{} online: {}", conn.name(), sessions.len());
    });

    let on_message = sessions.clone();
    server.set_message_callback(move |conn, buf, _| match decode(buf) {
        Ok(frames) => {
            let peers: Vec<ConnectionHandle> =
                on_message.lock().unwrap().values().cloned().collect();
            for frame in frames {
                let encoded = encode(&frame);
                for peer in &peers {
                    peer.send(encoded.clone());
                }
            }
        }
        Err(len) => {
            println!("{} sent an invalid length {}, closing", conn.name(), len);
            conn.shutdown();
        }
    });

    server.start()?;
    println!("Chat server listening on {}", server.ip_port());
    event_loop.run();
    Ok(())
}
