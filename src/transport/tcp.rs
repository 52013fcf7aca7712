//! Blocking TCP transport.

use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use super::{Connection, Connector};
use crate::config::{NodeId, NodeLocation};
use crate::wire::encode_prologue;

/// Connects over TCP and sends the cluster prologue.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    /// `timeout` bounds connect and every subsequent read/write.
    pub fn new(timeout: Duration) -> Self {
        TcpConnector { timeout }
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        node: &NodeId,
        location: &NodeLocation,
        cluster_id: &str,
    ) -> io::Result<Box<dyn Connection>> {
        let mut last_err = None;
        for addr in (location.host.as_str(), location.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    let mut conn = TcpConnection::new(stream);
                    conn.send(&encode_prologue(cluster_id))?;
                    debug!(node = %node, addr = %addr, "connected");
                    return Ok(Box::new(conn));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} resolved to no addresses", location),
            )
        }))
    }
}

/// A TCP stream with buffered reads.
pub struct TcpConnection {
    reader: BufReader<TcpStream>,
    closed: bool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        TcpConnection {
            reader: BufReader::new(stream),
            closed: false,
        }
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        Ok(())
    }
}

impl Read for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        self.reader.read(buf)
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.check_open()?;
        let stream = self.reader.get_mut();
        stream.write_all(frame)?;
        stream.flush()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.reader.get_ref().shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    use crate::wire::{decode_prologue, decode_string, encode_ok, Request};

    #[test]
    fn test_tcp_prologue_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let cluster = decode_prologue(&mut reader).unwrap();
            let request = Request::decode(&mut reader).unwrap();
            assert_eq!(request, Request::WhoMaster);
            let mut writer = stream;
            writer
                .write_all(&encode_ok(|enc| {
                    enc.put_str(&cluster);
                }))
                .unwrap();
        });

        let connector = TcpConnector::new(Duration::from_secs(2));
        let mut conn = connector
            .connect(&"n0".into(), &NodeLocation::new("127.0.0.1", port), "ricky")
            .unwrap();
        conn.send(&Request::WhoMaster.encode()).unwrap();
        assert_eq!(decode_string(&mut conn).unwrap(), "ricky");

        conn.close();
        let err = conn.send(&Request::WhoMaster.encode()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let connector = TcpConnector::new(Duration::from_millis(500));
        assert!(connector
            .connect(&"n0".into(), &NodeLocation::new("127.0.0.1", port), "ricky")
            .is_err());
    }
}
