// JDWP Event Loop
//
// Handles concurrent reading of events and replies from the JDWP socket

use crate::commands::{command_sets, vm_commands};
use crate::events::{parse_event_packet, EventSet};
use crate::protocol::{CommandPacket, CoordError, CoordResult, ReplyPacket, HEADER_SIZE, REPLY_FLAG};
use crate::types::SuspendPolicy;
use bytes::BytesMut;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Maximum allowed JDWP packet size (10MB)
/// This prevents memory exhaustion from malicious or buggy JVMs
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Packet id of commands the loop sends on its own; connection ids start at 1
const LOOP_COMMAND_ID: u32 = 0;

/// Request to send a command and get reply
pub struct CommandRequest {
    pub packet: CommandPacket,
    pub reply_tx: oneshot::Sender<CoordResult<ReplyPacket>>,
}

/// Handle to the event loop for sending commands and receiving events
#[derive(Debug)]
pub struct EventLoopHandle {
    command_tx: mpsc::Sender<CommandRequest>,
    event_rx: Option<mpsc::UnboundedReceiver<EventSet>>,
}

impl EventLoopHandle {
    /// Send a command and wait for reply
    pub async fn send_command(&self, packet: CommandPacket) -> CoordResult<ReplyPacket> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let request = CommandRequest { packet, reply_tx };

        // Both channels close when the loop exits, which only happens when the
        // socket is gone
        self.command_tx
            .send(request)
            .await
            .map_err(|_| CoordError::Disconnected)?;

        reply_rx.await.map_err(|_| CoordError::Disconnected)?
    }

    /// Hand over the event stream; only the first caller gets it
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EventSet>> {
        self.event_rx.take()
    }
}

/// Start the event loop task
pub fn spawn_event_loop<R, W>(reader: R, writer: W) -> EventLoopHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(32);
    // Events are never dropped: a stop that nobody reads just queues
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(event_loop_task(reader, writer, command_rx, event_tx));

    EventLoopHandle {
        command_tx,
        event_rx: Some(event_rx),
    }
}

/// Reader task: reads whole packets so the main loop never cancels a partial read
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    packet_tx: mpsc::Sender<CoordResult<(bool, u32, Vec<u8>)>>,
) {
    loop {
        let result = read_packet(&mut reader).await;
        let failed = result.is_err();
        if packet_tx.send(result).await.is_err() || failed {
            break;
        }
    }
}

/// Main event loop task
async fn event_loop_task<R, W>(
    reader: R,
    mut writer: W,
    mut command_rx: mpsc::Receiver<CommandRequest>,
    event_tx: mpsc::UnboundedSender<EventSet>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    info!("Event loop started");

    let (packet_tx, mut packet_rx) = mpsc::channel(32);
    let reader_task = tokio::spawn(read_loop(reader, packet_tx));

    let mut pending_replies: HashMap<u32, oneshot::Sender<CoordResult<ReplyPacket>>> =
        HashMap::new();
    // None once a set could not be decoded; the consumer then sees Disconnected
    let mut event_tx = Some(event_tx);

    loop {
        tokio::select! {
            // Handle outgoing commands
            Some(cmd) = command_rx.recv() => {
                let packet_id = cmd.packet.id;
                debug!(
                    "Sending command id={} set={} cmd={}",
                    packet_id, cmd.packet.command_set, cmd.packet.command
                );

                let encoded = cmd.packet.encode();
                if let Err(e) = writer.write_all(&encoded).await {
                    error!("Failed to write command: {}", e);
                    cmd.reply_tx.send(Err(CoordError::Io(e))).ok();
                    continue;
                }

                if let Err(e) = writer.flush().await {
                    error!("Failed to flush command: {}", e);
                    cmd.reply_tx.send(Err(CoordError::Io(e))).ok();
                    continue;
                }

                pending_replies.insert(packet_id, cmd.reply_tx);
            }

            // Handle incoming packets
            result = packet_rx.recv() => {
                match result {
                    Some(Ok((true, packet_id, data))) => {
                        debug!("Received reply id={}", packet_id);

                        if let Some(tx) = pending_replies.remove(&packet_id) {
                            match ReplyPacket::decode(&data) {
                                Ok(reply) => {
                                    tx.send(Ok(reply)).ok();
                                }
                                Err(e) => {
                                    warn!("Failed to decode reply: {}", e);
                                    tx.send(Err(e)).ok();
                                }
                            }
                        } else if packet_id == LOOP_COMMAND_ID {
                            debug!("Stop release acknowledged");
                        } else {
                            warn!("Received reply for unknown command id={}", packet_id);
                        }
                    }
                    Some(Ok((false, _, data))) => {
                        // Command packets from the VM carry command_set/command in the header
                        if data[9] != command_sets::EVENT {
                            warn!("Ignoring command packet set={} cmd={}", data[9], data[10]);
                            continue;
                        }

                        let Some(tx) = &event_tx else {
                            warn!("Event stream closed, discarding event set");
                            release_stop(&mut writer, &data).await;
                            continue;
                        };

                        match parse_event_packet(&data[HEADER_SIZE..]) {
                            Ok(event_set) => {
                                info!("Parsed event set: {} events, suspend_policy={:?}",
                                      event_set.events.len(), event_set.suspend_policy);

                                if tx.send(event_set).is_err() {
                                    warn!("Event receiver dropped, future events will be discarded");
                                }
                            }
                            Err(e) => {
                                // sets are never skipped, so the stream ends here
                                error!("Failed to parse event set, closing event stream: {}", e);
                                release_stop(&mut writer, &data).await;
                                event_tx = None;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("Failed to read packet: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    reader_task.abort();

    // Dropping pending reply senders fails their waiters with Disconnected,
    // dropping event_tx ends the event stream
    info!(
        "Event loop shutting down, {} replies outstanding",
        pending_replies.len()
    );
}

/// Resume the VM when an event set nobody will see suspended something
async fn release_stop<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) {
    let policy = data.get(HEADER_SIZE).copied().unwrap_or(0);
    if policy == SuspendPolicy::None as u8 {
        return;
    }

    let resume = CommandPacket::new(
        LOOP_COMMAND_ID,
        command_sets::VIRTUAL_MACHINE,
        vm_commands::RESUME,
    );
    let written = match writer.write_all(&resume.encode()).await {
        Ok(()) => writer.flush().await,
        Err(e) => Err(e),
    };
    match written {
        Ok(()) => warn!("Resumed the VM after an undeliverable stop (policy {})", policy),
        Err(e) => error!("Failed to resume the VM after an undeliverable stop: {}", e),
    }
}

/// Read a packet and report whether it is a reply
async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> CoordResult<(bool, u32, Vec<u8>)> {
    // Read header
    let mut header = BytesMut::with_capacity(HEADER_SIZE);
    header.resize(HEADER_SIZE, 0);

    reader
        .read_exact(&mut header)
        .await
        .map_err(CoordError::Io)?;

    // Parse header
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let packet_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let flags = header[8];

    if length < HEADER_SIZE {
        return Err(CoordError::Protocol(format!(
            "Invalid packet length: {}",
            length
        )));
    }

    if length > MAX_PACKET_SIZE {
        return Err(CoordError::Protocol(format!(
            "Packet too large: {} bytes (max: {} bytes)",
            length, MAX_PACKET_SIZE
        )));
    }

    // Read rest of packet
    let data_len = length - HEADER_SIZE;
    let mut full_packet = header.to_vec();

    if data_len > 0 {
        let mut data = vec![0u8; data_len];
        reader.read_exact(&mut data).await.map_err(CoordError::Io)?;
        full_packet.extend_from_slice(&data);
    }

    let is_reply = flags == REPLY_FLAG;

    Ok((is_reply, packet_id, full_packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::event_kinds;
    use bytes::BufMut;
    use tokio::io::duplex;

    fn event_packet(id: u32, thread: u64) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_u8(0);
        body.put_i32(1);
        body.put_u8(event_kinds::THREAD_START);
        body.put_i32(3);
        body.put_u64(thread);
        framed(id, &body)
    }

    fn framed(id: u32, body: &[u8]) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.put_u32((HEADER_SIZE + body.len()) as u32);
        packet.put_u32(id);
        packet.put_u8(0);
        packet.put_u8(command_sets::EVENT);
        packet.put_u8(100);
        packet.extend_from_slice(body);
        packet
    }

    #[tokio::test]
    async fn test_reply_routing_and_event_order() {
        let (client, mut vm) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let mut handle = spawn_event_loop(reader, writer);
        let mut events = handle.take_events().unwrap();
        assert!(handle.take_events().is_none());

        // Two events queue before anybody reads them
        vm.write_all(&event_packet(100, 1)).await.unwrap();
        vm.write_all(&event_packet(101, 2)).await.unwrap();

        let vm_side = tokio::spawn(async move {
            let mut header = [0u8; HEADER_SIZE];
            vm.read_exact(&mut header).await.unwrap();
            let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            let mut reply = Vec::new();
            reply.put_u32(HEADER_SIZE as u32);
            reply.put_u32(id);
            reply.put_u8(REPLY_FLAG);
            reply.put_u16(0);
            vm.write_all(&reply).await.unwrap();
            vm
        });

        let reply = handle
            .send_command(CommandPacket::new(42, 1, 9))
            .await
            .unwrap();
        assert_eq!(reply.id, 42);

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.events[0].thread(), Some(1));
        assert_eq!(second.events[0].thread(), Some(2));

        // Closing the VM side ends the stream and fails later commands
        drop(vm_side.await.unwrap());
        assert!(events.recv().await.is_none());
        assert!(matches!(
            handle.send_command(CommandPacket::new(43, 1, 9)).await,
            Err(CoordError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_undecodable_set_closes_stream_and_releases_stop() {
        let (client, mut vm) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let mut handle = spawn_event_loop(reader, writer);
        let mut events = handle.take_events().unwrap();

        // suspend-all set whose second event is a kind nobody requested
        let mut body = Vec::new();
        body.put_u8(SuspendPolicy::All as u8);
        body.put_i32(2);
        body.put_u8(event_kinds::THREAD_START);
        body.put_i32(3);
        body.put_u64(7);
        body.put_u8(1);
        body.put_i32(4);
        body.put_u64(7);
        vm.write_all(&framed(100, &body)).await.unwrap();
        vm.write_all(&event_packet(101, 8)).await.unwrap();

        // the later set is not delivered in place of the broken one
        assert!(events.recv().await.is_none());

        let mut header = [0u8; HEADER_SIZE];
        vm.read_exact(&mut header).await.unwrap();
        let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        assert_eq!(id, LOOP_COMMAND_ID);
        assert_eq!(header[9], command_sets::VIRTUAL_MACHINE);
        assert_eq!(header[10], vm_commands::RESUME);
    }
}
