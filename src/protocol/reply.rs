/// Backend-to-frontend replies and their wire encoding. Each variant
/// mirrors one reply opcode; `encode_reply` turns it into a framed byte
/// string ready to write to the pipe.
use crate::core::symbols::SymbolLoadStatus;
use crate::protocol::framing::encode_frame;

pub const OP_MESSAGE: u8 = 0;
pub const OP_STACK_SAMPLES: u8 = 1;
pub const OP_NEW_STRING: u8 = 2;
pub const OP_NEW_SYMBOL: u8 = 3;
pub const OP_PROCESS_START: u8 = 4;
pub const OP_PROCESS_END: u8 = 5;
pub const OP_THREAD_ADD: u8 = 6;
pub const OP_THREAD_REMOVE: u8 = 7;
pub const OP_MODULE_LOAD: u8 = 8;
pub const OP_MODULE_UNLOAD: u8 = 9;
pub const OP_SYMBOLS: u8 = 10;

/// One sampled frame as reported on the wire: the resolved symbol, the
/// source line at the sampled address (`UNRESOLVED_LINE` if lookup
/// failed), and the byte offset into the symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFrame {
    pub symbol: u32,
    pub line: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `operation` names what was being attempted; `system_error` is the
    /// OS's localized error text, or empty when there isn't one.
    Message {
        operation: String,
        system_error: String,
    },
    StackSamples {
        thread_id: u32,
        frames: Vec<SampleFrame>,
    },
    NewString { id: u32, value: String },
    NewSymbol {
        id: u32,
        name: u32,
        file: u32,
        size: u32,
        address: u64,
        module: u32,
        line: u32,
        line_last: u32,
    },
    ProcessStart { pid: u32, pointer_size: u32 },
    ProcessEnd { exit_code: u32 },
    ThreadAdd { thread_id: u32, entry_point: u64 },
    ThreadRemove { thread_id: u32 },
    ModuleLoad { base: u64, name: String },
    ModuleUnload { base: u64 },
    Symbols { status: SymbolLoadStatus },
}

/// Encode `reply` into a complete framed byte string (header + payload).
pub fn encode_reply(reply: &Reply) -> Vec<u8> {
    let mut payload = Vec::new();
    let opcode = match reply {
        Reply::Message {
            operation,
            system_error,
        } => {
            let op_bytes = operation.as_bytes();
            let err_bytes = system_error.as_bytes();
            payload.extend_from_slice(&(op_bytes.len() as u32).to_le_bytes());
            payload.extend_from_slice(&(err_bytes.len() as u32).to_le_bytes());
            payload.extend_from_slice(op_bytes);
            payload.extend_from_slice(err_bytes);
            OP_MESSAGE
        }
        Reply::StackSamples { thread_id, frames } => {
            payload.extend_from_slice(&thread_id.to_le_bytes());
            payload.extend_from_slice(&(frames.len() as u32).to_le_bytes());
            for frame in frames {
                payload.extend_from_slice(&frame.symbol.to_le_bytes());
                payload.extend_from_slice(&frame.line.to_le_bytes());
                payload.extend_from_slice(&frame.offset.to_le_bytes());
            }
            OP_STACK_SAMPLES
        }
        Reply::NewString { id, value } => {
            let bytes = value.as_bytes();
            payload.extend_from_slice(&id.to_le_bytes());
            payload.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            payload.extend_from_slice(bytes);
            OP_NEW_STRING
        }
        Reply::NewSymbol {
            id,
            name,
            file,
            size,
            address,
            module,
            line,
            line_last,
        } => {
            payload.extend_from_slice(&id.to_le_bytes());
            payload.extend_from_slice(&name.to_le_bytes());
            payload.extend_from_slice(&file.to_le_bytes());
            payload.extend_from_slice(&size.to_le_bytes());
            payload.extend_from_slice(&address.to_le_bytes());
            payload.extend_from_slice(&module.to_le_bytes());
            payload.extend_from_slice(&line.to_le_bytes());
            payload.extend_from_slice(&line_last.to_le_bytes());
            OP_NEW_SYMBOL
        }
        Reply::ProcessStart { pid, pointer_size } => {
            payload.extend_from_slice(&pid.to_le_bytes());
            payload.extend_from_slice(&pointer_size.to_le_bytes());
            OP_PROCESS_START
        }
        Reply::ProcessEnd { exit_code } => {
            payload.extend_from_slice(&exit_code.to_le_bytes());
            OP_PROCESS_END
        }
        Reply::ThreadAdd { thread_id, entry_point } => {
            payload.extend_from_slice(&thread_id.to_le_bytes());
            payload.extend_from_slice(&entry_point.to_le_bytes());
            OP_THREAD_ADD
        }
        Reply::ThreadRemove { thread_id } => {
            payload.extend_from_slice(&thread_id.to_le_bytes());
            OP_THREAD_REMOVE
        }
        Reply::ModuleLoad { base, name } => {
            let bytes = name.as_bytes();
            payload.extend_from_slice(&base.to_le_bytes());
            payload.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            payload.extend_from_slice(bytes);
            OP_MODULE_LOAD
        }
        Reply::ModuleUnload { base } => {
            payload.extend_from_slice(&base.to_le_bytes());
            OP_MODULE_UNLOAD
        }
        Reply::Symbols { status } => {
            payload.extend_from_slice(&(*status as u32).to_le_bytes());
            OP_SYMBOLS
        }
    };
    encode_frame(opcode, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::peek_header;

    #[test]
    fn encodes_process_start_with_correct_opcode_and_length() {
        let frame = encode_reply(&Reply::ProcessStart {
            pid: 4242,
            pointer_size: 8,
        });
        let header = peek_header(&frame).unwrap();
        assert_eq!(header.opcode, OP_PROCESS_START);
        assert_eq!(header.payload_size, 8);
        assert_eq!(&frame[5..9], &4242u32.to_le_bytes());
        assert_eq!(&frame[9..13], &8u32.to_le_bytes());
    }

    #[test]
    fn encodes_stack_samples_with_frame_count_and_entries() {
        let frame = encode_reply(&Reply::StackSamples {
            thread_id: 7,
            frames: vec![
                SampleFrame { symbol: 1, line: 10, offset: 4 },
                SampleFrame { symbol: 2, line: u32::MAX, offset: 0 },
            ],
        });
        let header = peek_header(&frame).unwrap();
        assert_eq!(header.opcode, OP_STACK_SAMPLES);
        assert_eq!(header.payload_size as usize, 4 + 4 + 2 * 12);
    }

    #[test]
    fn encodes_new_string_with_utf8_payload() {
        let frame = encode_reply(&Reply::NewString {
            id: 3,
            value: "main.c".to_string(),
        });
        let header = peek_header(&frame).unwrap();
        assert_eq!(header.opcode, OP_NEW_STRING);
        assert_eq!(&frame[9..], b"main.c");
    }

    #[test]
    fn encodes_symbols_status_as_u32_code() {
        let frame = encode_reply(&Reply::Symbols {
            status: SymbolLoadStatus::LoadedPublic,
        });
        let header = peek_header(&frame).unwrap();
        assert_eq!(header.opcode, OP_SYMBOLS);
        assert_eq!(&frame[5..9], &2u32.to_le_bytes());
    }

    #[test]
    fn encodes_module_load_with_base_and_name() {
        let frame = encode_reply(&Reply::ModuleLoad {
            base: 0x7fff_0000,
            name: "ntdll.dll".to_string(),
        });
        let header = peek_header(&frame).unwrap();
        assert_eq!(header.opcode, OP_MODULE_LOAD);
        assert_eq!(&frame[5..13], &0x7fff_0000u64.to_le_bytes());
        assert_eq!(&frame[17..], b"ntdll.dll");
    }
}
