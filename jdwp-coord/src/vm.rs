// VirtualMachine command implementations
//
// Class lookup, thread enumeration and VM-wide suspend/resume

use crate::commands::{command_sets, vm_commands};
use crate::connection::JdwpConnection;
use crate::protocol::CoordResult;
use crate::reader::{read_count, read_i32, read_u64, read_u8};
use crate::types::{ReferenceTypeId, ThreadId};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Class information from ClassesBySignature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassInfo {
    pub ref_type_tag: u8, // 1=class, 2=interface, 3=array
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: i32,
}

impl JdwpConnection {
    /// Find classes by signature (VirtualMachine.ClassesBySignature command)
    /// Signature format: "Lcom/example/MyClass;" for classes
    pub async fn classes_by_signature(&mut self, signature: &str) -> CoordResult<Vec<ClassInfo>> {
        let mut packet = self.packet(command_sets::VIRTUAL_MACHINE, vm_commands::CLASSES_BY_SIGNATURE);

        // Write signature as JDWP string (4-byte length + UTF-8 bytes)
        let sig_bytes = signature.as_bytes();
        packet.data.put_u32(sig_bytes.len() as u32);
        packet.data.extend_from_slice(sig_bytes);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let classes_count = read_count(&mut data)?;
        let mut classes = Vec::with_capacity(classes_count);

        for _ in 0..classes_count {
            let ref_type_tag = read_u8(&mut data)?;
            let type_id = read_u64(&mut data)?;
            let status = read_i32(&mut data)?;

            classes.push(ClassInfo {
                ref_type_tag,
                type_id,
                signature: signature.to_string(),
                status,
            });
        }

        Ok(classes)
    }

    /// Get all live threads (VirtualMachine.AllThreads)
    pub async fn get_all_threads(&mut self) -> CoordResult<Vec<ThreadId>> {
        let packet = self.packet(command_sets::VIRTUAL_MACHINE, vm_commands::ALL_THREADS);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let threads_count = read_count(&mut data)?;
        let mut threads = Vec::with_capacity(threads_count);

        for _ in 0..threads_count {
            threads.push(read_u64(&mut data)?);
        }

        Ok(threads)
    }

    /// Suspend all threads (VirtualMachine.Suspend)
    pub async fn suspend_all(&mut self) -> CoordResult<()> {
        let packet = self.packet(command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND);

        let reply = self.send_command(packet).await?;
        reply.check_error()
    }

    /// Resume all threads (VirtualMachine.Resume)
    pub async fn resume_all(&mut self) -> CoordResult<()> {
        let packet = self.packet(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME);

        let reply = self.send_command(packet).await?;
        reply.check_error()
    }

    /// Detach from the VM (VirtualMachine.Dispose); armed requests are cleared by the VM
    pub async fn dispose(&mut self) -> CoordResult<()> {
        let packet = self.packet(command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE);

        let reply = self.send_command(packet).await?;
        reply.check_error()
    }
}
