//! ADB command words.

use core::fmt;

/// Command word of an ADB packet.
///
/// Each command is a four-character ASCII tag stored little-endian in the
/// first header field, so the wire value reads as the tag reversed
/// (`OKAY` = `0x59414b4f`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Legacy synchronisation marker, unused by modern implementations.
    Sync = 0x434e_5953,

    /// Connection banner exchange.
    Connect = 0x4e58_4e43,

    /// Authentication handshake step.
    Auth = 0x4854_5541,

    /// Open a logical stream to the service named in the payload.
    Open = 0x4e45_504f,

    /// Acknowledge a stream open or a data write.
    Okay = 0x5941_4b4f,

    /// Close a logical stream (or refuse an open when `arg0` is zero).
    Close = 0x4553_4c43,

    /// Carry one payload chunk on an established stream.
    Write = 0x4554_5257,
}

impl Command {
    /// Convert to the wire-format command word.
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// Convert from a wire-format command word.
    ///
    /// Returns `None` for words outside the protocol vocabulary.
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0x434e_5953 => Some(Command::Sync),
            0x4e58_4e43 => Some(Command::Connect),
            0x4854_5541 => Some(Command::Auth),
            0x4e45_504f => Some(Command::Open),
            0x5941_4b4f => Some(Command::Okay),
            0x4553_4c43 => Some(Command::Close),
            0x4554_5257 => Some(Command::Write),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Command::Sync => "SYNC",
            Command::Connect => "CNXN",
            Command::Auth => "AUTH",
            Command::Open => "OPEN",
            Command::Okay => "OKAY",
            Command::Close => "CLSE",
            Command::Write => "WRTE",
        };
        f.write_str(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        let commands = [
            Command::Sync,
            Command::Connect,
            Command::Auth,
            Command::Open,
            Command::Okay,
            Command::Close,
            Command::Write,
        ];
        for command in commands {
            assert_eq!(Command::from_wire(command.to_wire()), Some(command));
        }
    }

    #[test]
    fn test_command_words_are_ascii_tags() {
        // The wire word is the ASCII tag in little-endian byte order.
        assert_eq!(&Command::Okay.to_wire().to_le_bytes(), b"OKAY");
        assert_eq!(&Command::Open.to_wire().to_le_bytes(), b"OPEN");
        assert_eq!(&Command::Close.to_wire().to_le_bytes(), b"CLSE");
        assert_eq!(&Command::Write.to_wire().to_le_bytes(), b"WRTE");
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert_eq!(Command::from_wire(0), None);
        assert_eq!(Command::from_wire(0xdead_beef), None);
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::Okay.to_string(), "OKAY");
        assert_eq!(Command::Connect.to_string(), "CNXN");
    }
}
