// Method command implementations
//
// Line tables map source lines to code indices for breakpoint placement

use crate::commands::{command_sets, method_commands};
use crate::connection::JdwpConnection;
use crate::protocol::CoordResult;
use crate::reader::{read_count, read_i32, read_u64};
use crate::types::{MethodId, ReferenceTypeId};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Line table entry - maps source line to bytecode index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineTableEntry {
    pub line_code_index: u64, // bytecode index
    pub line_number: i32,     // source line number
}

/// Complete line table for a method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineTable {
    pub start: u64, // starting bytecode index
    pub end: u64,   // ending bytecode index
    pub lines: Vec<LineTableEntry>,
}

impl LineTable {
    /// Lowest code index recorded for a source line
    pub fn code_index(&self, line: u32) -> Option<u64> {
        self.lines
            .iter()
            .filter(|e| e.line_number >= 0 && e.line_number as u32 == line)
            .map(|e| e.line_code_index)
            .min()
    }
}

impl JdwpConnection {
    /// Get line table for a method (Method.LineTable command)
    pub async fn get_line_table(
        &mut self,
        ref_type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> CoordResult<LineTable> {
        let mut packet = self.packet(command_sets::METHOD, method_commands::LINE_TABLE);

        packet.data.put_u64(ref_type_id);
        packet.data.put_u64(method_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let start = read_u64(&mut data)?;
        let end = read_u64(&mut data)?;

        let lines_count = read_count(&mut data)?;
        let mut lines = Vec::with_capacity(lines_count);

        for _ in 0..lines_count {
            let line_code_index = read_u64(&mut data)?;
            let line_number = read_i32(&mut data)?;

            lines.push(LineTableEntry {
                line_code_index,
                line_number,
            });
        }

        Ok(LineTable { start, end, lines })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_index_picks_lowest_entry() {
        let table = LineTable {
            start: 0,
            end: 30,
            lines: vec![
                LineTableEntry { line_code_index: 0, line_number: 10 },
                LineTableEntry { line_code_index: 12, line_number: 11 },
                LineTableEntry { line_code_index: 4, line_number: 11 },
            ],
        };

        assert_eq!(table.code_index(11), Some(4));
        assert_eq!(table.code_index(10), Some(0));
        assert_eq!(table.code_index(99), None);
    }
}
