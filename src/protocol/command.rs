/// Frontend-to-backend commands and their table-driven parser. Each parse
/// attempt either fully consumes the command (returning the number of
/// bytes used) or reports that the buffer doesn't hold the full payload
/// yet, per the framing rules in `framing`.
use crate::protocol::framing::HEADER_LEN;

pub const OP_SET_OPTIONS: u8 = 0;
pub const OP_STOP: u8 = 1;
pub const OP_CREATE_PROCESS: u8 = 2;
pub const OP_ATTACH_PROCESS: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetOptions {
        sampling_usec: u32,
        download_symbols: bool,
    },
    Stop,
    CreateProcess {
        command: Vec<u8>,
        arguments: Vec<u8>,
        folder: Vec<u8>,
    },
    AttachProcess {
        pid: u32,
    },
}

/// Result of attempting to parse one command from the front of `buf`.
pub enum ParseOutcome {
    /// Not enough bytes buffered yet for this command's full payload.
    Incomplete,
    /// Opcode not in the command table; the caller must treat this as a
    /// protocol error and terminate (zero bytes are ever consumed for an
    /// unknown opcode).
    UnknownOpcode,
    /// Parsed command, plus how many bytes of `buf` it consumed.
    Parsed { command: Command, consumed: usize },
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Parse the single frame at the front of `buf`, whose header has already
/// been peeked as `(opcode, payload_size)`. `buf` is the whole buffered
/// region starting at the frame header.
pub fn parse(opcode: u8, buf: &[u8]) -> ParseOutcome {
    match opcode {
        OP_SET_OPTIONS => {
            let needed = HEADER_LEN + 2 * 4;
            if buf.len() < needed {
                return ParseOutcome::Incomplete;
            }
            let sampling_usec = get_u32(buf, HEADER_LEN);
            let download_symbols = get_u32(buf, HEADER_LEN + 4) != 0;
            ParseOutcome::Parsed {
                command: Command::SetOptions {
                    sampling_usec,
                    download_symbols,
                },
                consumed: needed,
            }
        }
        OP_STOP => {
            if buf.len() < HEADER_LEN {
                return ParseOutcome::Incomplete;
            }
            ParseOutcome::Parsed {
                command: Command::Stop,
                consumed: HEADER_LEN,
            }
        }
        OP_CREATE_PROCESS => {
            let prefix = HEADER_LEN + 3 * 4;
            if buf.len() < prefix {
                return ParseOutcome::Incomplete;
            }
            let command_size = get_u32(buf, HEADER_LEN) as usize;
            let arguments_size = get_u32(buf, HEADER_LEN + 4) as usize;
            let folder_size = get_u32(buf, HEADER_LEN + 8) as usize;
            let total = prefix + command_size + arguments_size + folder_size;
            if buf.len() < total {
                return ParseOutcome::Incomplete;
            }

            let mut offset = prefix;
            let command = buf[offset..offset + command_size].to_vec();
            offset += command_size;
            let arguments = buf[offset..offset + arguments_size].to_vec();
            offset += arguments_size;
            let folder = buf[offset..offset + folder_size].to_vec();

            ParseOutcome::Parsed {
                command: Command::CreateProcess {
                    command,
                    arguments,
                    folder,
                },
                consumed: total,
            }
        }
        OP_ATTACH_PROCESS => {
            let needed = HEADER_LEN + 4;
            if buf.len() < needed {
                return ParseOutcome::Incomplete;
            }
            let pid = get_u32(buf, HEADER_LEN);
            ParseOutcome::Parsed {
                command: Command::AttachProcess { pid },
                consumed: needed,
            }
        }
        _ => ParseOutcome::UnknownOpcode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::encode_frame;

    fn outcome_parsed(buf: &[u8]) -> (Command, usize) {
        match parse(buf[0], buf) {
            ParseOutcome::Parsed { command, consumed } => (command, consumed),
            _ => panic!("expected parsed command"),
        }
    }

    #[test]
    fn parses_set_options() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&5000u32.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        let frame = encode_frame(OP_SET_OPTIONS, &payload);
        let (command, consumed) = outcome_parsed(&frame);
        assert_eq!(consumed, frame.len());
        assert_eq!(
            command,
            Command::SetOptions {
                sampling_usec: 5000,
                download_symbols: true
            }
        );
    }

    #[test]
    fn parses_stop_with_empty_payload() {
        let frame = encode_frame(OP_STOP, &[]);
        let (command, consumed) = outcome_parsed(&frame);
        assert_eq!(consumed, frame.len());
        assert_eq!(command, Command::Stop);
    }

    #[test]
    fn parses_attach_process() {
        let frame = encode_frame(OP_ATTACH_PROCESS, &1234u32.to_le_bytes());
        let (command, _) = outcome_parsed(&frame);
        assert_eq!(command, Command::AttachProcess { pid: 1234 });
    }

    #[test]
    fn parses_create_process_with_three_strings() {
        let cmd = b"prog.exe".to_vec();
        let args = b"--flag".to_vec();
        let folder = b"C:\\".to_vec();
        let mut payload = Vec::new();
        payload.extend_from_slice(&(cmd.len() as u32).to_le_bytes());
        payload.extend_from_slice(&(args.len() as u32).to_le_bytes());
        payload.extend_from_slice(&(folder.len() as u32).to_le_bytes());
        payload.extend_from_slice(&cmd);
        payload.extend_from_slice(&args);
        payload.extend_from_slice(&folder);
        let frame = encode_frame(OP_CREATE_PROCESS, &payload);

        let (command, consumed) = outcome_parsed(&frame);
        assert_eq!(consumed, frame.len());
        match command {
            Command::CreateProcess {
                command: parsed_command,
                arguments: parsed_arguments,
                folder: parsed_folder,
            } => {
                assert_eq!(parsed_command, cmd);
                assert_eq!(parsed_arguments, args);
                assert_eq!(parsed_folder, folder);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn partial_payload_is_incomplete_not_an_error() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&5000u32.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        let frame = encode_frame(OP_SET_OPTIONS, &payload);

        for n in 0..frame.len() {
            let prefix = &frame[..n];
            if prefix.len() >= HEADER_LEN {
                assert!(matches!(
                    parse(OP_SET_OPTIONS, prefix),
                    ParseOutcome::Incomplete
                ));
            }
        }
        assert!(matches!(
            parse(OP_SET_OPTIONS, &frame),
            ParseOutcome::Parsed { .. }
        ));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(matches!(parse(255, &[255, 0, 0, 0, 0]), ParseOutcome::UnknownOpcode));
    }
}
