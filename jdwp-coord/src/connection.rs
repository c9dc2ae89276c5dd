// JDWP connection management
//
// Handles TCP connection, handshake, and event loop startup

use crate::eventloop::{spawn_event_loop, EventLoopHandle};
use crate::events::EventSet;
use crate::protocol::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct JdwpConnection {
    event_loop: EventLoopHandle,
    next_id: Arc<AtomicU32>,
}

impl JdwpConnection {
    /// Connect to a JVM via JDWP
    pub async fn connect(host: &str, port: u16) -> CoordResult<Self> {
        info!("Connecting to JDWP at {}:{}", host, port);

        let mut stream = TcpStream::connect((host, port)).await?;

        // Perform JDWP handshake
        Self::handshake(&mut stream).await?;

        // Split stream and spawn event loop
        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(reader, writer))
    }

    /// Connect, retrying until the listening JVM comes up or the budget runs out
    pub async fn connect_with_retry(host: &str, port: u16, budget: Duration) -> CoordResult<Self> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            match Self::connect(host, port).await {
                Ok(conn) => return Ok(conn),
                Err(CoordError::Io(e)) if tokio::time::Instant::now() < deadline => {
                    debug!("JDWP port not ready yet: {}", e);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(CoordError::Io(_)) => return Err(CoordError::Timeout(budget)),
                Err(e) => return Err(e),
            }
        }
    }

    /// Wrap an already handshaken byte stream
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            event_loop: spawn_event_loop(reader, writer),
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Perform JDWP handshake
    pub async fn handshake<S>(stream: &mut S) -> CoordResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("Performing JDWP handshake");

        // Send handshake
        stream.write_all(JDWP_HANDSHAKE).await?;
        stream.flush().await?;

        // Receive handshake response
        let mut buf = vec![0u8; JDWP_HANDSHAKE.len()];
        stream.read_exact(&mut buf).await?;

        if buf != JDWP_HANDSHAKE {
            warn!("Invalid handshake response: {:?}", buf);
            return Err(CoordError::InvalidHandshake);
        }

        info!("JDWP handshake successful");
        Ok(())
    }

    /// Send a command and wait for reply
    pub async fn send_command(&mut self, packet: CommandPacket) -> CoordResult<ReplyPacket> {
        debug!("Sending command packet id={}", packet.id);
        self.event_loop.send_command(packet).await
    }

    /// Hand over the event stream (first call only)
    pub fn take_event_stream(&mut self) -> Option<mpsc::UnboundedReceiver<EventSet>> {
        self.event_loop.take_events()
    }

    /// Generate next packet ID
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Build a command packet with a fresh id
    pub(crate) fn packet(&self, command_set: u8, command: u8) -> CommandPacket {
        CommandPacket::new(self.next_id(), command_set, command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_handshake_accepts_echo() {
        let (mut client, mut vm) = duplex(64);
        let vm_side = tokio::spawn(async move {
            let mut buf = [0u8; 14];
            vm.read_exact(&mut buf).await.unwrap();
            vm.write_all(&buf).await.unwrap();
        });

        JdwpConnection::handshake(&mut client).await.unwrap();
        vm_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejects_garbage() {
        let (mut client, mut vm) = duplex(64);
        tokio::spawn(async move {
            let mut buf = [0u8; 14];
            vm.read_exact(&mut buf).await.unwrap();
            vm.write_all(b"Not-A-Handshak").await.unwrap();
        });

        assert!(matches!(
            JdwpConnection::handshake(&mut client).await,
            Err(CoordError::InvalidHandshake)
        ));
    }

    #[tokio::test]
    async fn test_next_id_is_monotonic() {
        let (client, _vm) = duplex(64);
        let (reader, writer) = tokio::io::split(client);
        let conn = JdwpConnection::from_parts(reader, writer);

        assert_eq!(conn.next_id(), 1);
        assert_eq!(conn.next_id(), 2);
        assert_eq!(conn.packet(1, 9).id, 3);
    }
}
