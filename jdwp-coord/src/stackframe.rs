// StackFrame command implementations

use crate::commands::{command_sets, stack_frame_commands};
use crate::connection::JdwpConnection;
use crate::protocol::CoordResult;
use crate::types::{FrameId, ThreadId};
use bytes::BufMut;

impl JdwpConnection {
    /// Pop frames top..=frame_id off a suspended thread (StackFrame.PopFrames command)
    ///
    /// The VM releases monitors held by the popped frames and leaves the thread
    /// suspended just before the invoke that created the popped frame.
    pub async fn pop_frames(&mut self, thread_id: ThreadId, frame_id: FrameId) -> CoordResult<()> {
        let mut packet = self.packet(command_sets::STACK_FRAME, stack_frame_commands::POP_FRAMES);

        packet.data.put_u64(thread_id);
        packet.data.put_u64(frame_id);

        let reply = self.send_command(packet).await?;
        reply.check_thread_error(thread_id)
    }
}
