use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

/// Builds a non-blocking listening socket with SO_REUSEADDR and the given
/// backlog.
pub fn tcp_server(bind_addr: &str, port: u16, backlog: i32) -> io::Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", bind_addr, port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Accepts one connection and puts it in non-blocking mode. `WouldBlock`
/// surfaces unchanged so the accept loop can stop.
pub fn tcp_accept(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    let (stream, peer) = listener.accept()?;
    stream.set_nonblocking(true)?;
    Ok((stream, peer))
}

/// Enables TCP_NODELAY and keep-alive probing with the given idle time.
pub fn configure_client(stream: &TcpStream, keepalive_idle_secs: u64) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(keepalive_idle_secs));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}
