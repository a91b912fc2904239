use mill_reactor::{error::Result, prelude::*};
use std::{env, sync::Arc};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let threads = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(2);

    let event_loop = EventLoop::with_config(LoopConfig {
        logger: Arc::new(TracingLogger),
        ..LoopConfig::default()
    })?;

    let config = TcpServerConfig::builder()
        .address("0.0.0.0:2007".parse().unwrap())
        .name("EchoServer")
        .thread_num(threads)
        .no_delay(true)
        .logger(Arc::new(TracingLogger))
        .build();

    let server = TcpServer::new(&event_loop, config)?;
    server.set_connection_callback(|conn| {
        println!(
            "{} -> {} is {}",
            conn.peer_addr(),
            conn.local_addr(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
    });
    server.set_message_callback(|conn, buf, receive_time| {
        println!(
            "{} echo {} bytes, received at {}",
            conn.name(),
            buf.readable_bytes(),
            receive_time
        );
        conn.send_buffer(buf);
    });
    server.start()?;

    println!("Echo server listening on {}", server.ip_port());
    event_loop.run();
    Ok(())
}
