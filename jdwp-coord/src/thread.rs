// ThreadReference command implementations
//
// Commands for working with threads (frames, suspend/resume, monitors)

use crate::commands::{command_sets, thread_commands};
use crate::connection::JdwpConnection;
use crate::events::read_location;
use crate::protocol::{CoordError, CoordResult};
use crate::reader::{read_count, read_string, read_u64, read_u8};
use crate::types::{FrameInfo, ObjectId, ThreadId};
use bytes::BufMut;

impl JdwpConnection {
    /// Get stack frames for a thread (ThreadReference.Frames command)
    pub async fn get_frames(
        &mut self,
        thread_id: ThreadId,
        start_frame: i32,
        length: i32,
    ) -> CoordResult<Vec<FrameInfo>> {
        let mut packet = self.packet(command_sets::THREAD_REFERENCE, thread_commands::FRAMES);

        packet.data.put_u64(thread_id);
        // Start frame (0 = current/top frame)
        packet.data.put_i32(start_frame);
        // Length (-1 = all frames)
        packet.data.put_i32(length);

        let reply = self.send_command(packet).await?;
        reply.check_thread_error(thread_id)?;

        let mut data = reply.data();

        let frames_count = read_count(&mut data)?;
        let mut frames = Vec::with_capacity(frames_count);

        for _ in 0..frames_count {
            let frame_id = read_u64(&mut data)?;
            let location = read_location(&mut data)?;
            frames.push(FrameInfo { frame_id, location });
        }

        Ok(frames)
    }

    /// Number of frames on a suspended thread's stack (ThreadReference.FrameCount)
    pub async fn get_frame_count(&mut self, thread_id: ThreadId) -> CoordResult<usize> {
        let mut packet = self.packet(command_sets::THREAD_REFERENCE, thread_commands::FRAME_COUNT);
        packet.data.put_u64(thread_id);

        let reply = self.send_command(packet).await?;
        reply.check_thread_error(thread_id)?;

        let mut data = reply.data();
        read_count(&mut data)
    }

    /// Suspend one thread (ThreadReference.Suspend)
    pub async fn suspend_thread(&mut self, thread_id: ThreadId) -> CoordResult<()> {
        let mut packet = self.packet(command_sets::THREAD_REFERENCE, thread_commands::SUSPEND);
        packet.data.put_u64(thread_id);

        let reply = self.send_command(packet).await?;
        reply.check_thread_error(thread_id)
    }

    /// Resume one thread (ThreadReference.Resume)
    pub async fn resume_thread(&mut self, thread_id: ThreadId) -> CoordResult<()> {
        let mut packet = self.packet(command_sets::THREAD_REFERENCE, thread_commands::RESUME);
        packet.data.put_u64(thread_id);

        let reply = self.send_command(packet).await?;
        reply.check_thread_error(thread_id)
    }

    /// Thread name (ThreadReference.Name)
    pub async fn get_thread_name(&mut self, thread_id: ThreadId) -> CoordResult<String> {
        let mut packet = self.packet(command_sets::THREAD_REFERENCE, thread_commands::NAME);
        packet.data.put_u64(thread_id);

        let reply = self.send_command(packet).await?;
        reply.check_thread_error(thread_id)?;

        let mut data = reply.data();
        read_string(&mut data)
    }

    /// Monitors currently owned by a suspended thread (ThreadReference.OwnedMonitors)
    pub async fn get_owned_monitors(&mut self, thread_id: ThreadId) -> CoordResult<Vec<ObjectId>> {
        let mut packet = self.packet(command_sets::THREAD_REFERENCE, thread_commands::OWNED_MONITORS);
        packet.data.put_u64(thread_id);

        let reply = self.send_command(packet).await?;
        reply.check_thread_error(thread_id)?;

        let mut data = reply.data();
        let count = read_count(&mut data)?;
        let mut monitors = Vec::with_capacity(count);
        for _ in 0..count {
            // tagged object id
            let _tag = read_u8(&mut data)?;
            monitors.push(read_u64(&mut data)?);
        }

        Ok(monitors)
    }
}

/// Frame-range arguments for ThreadReference.Frames
pub fn frame_range(start: usize, length: Option<usize>) -> CoordResult<(i32, i32)> {
    let start = i32::try_from(start).map_err(|_| CoordError::Protocol("Frame start too large".to_string()))?;
    let length = match length {
        Some(len) => i32::try_from(len).map_err(|_| CoordError::Protocol("Frame length too large".to_string()))?,
        None => -1,
    };
    Ok((start, length))
}
