//! Wire protocol: constants, the command table, and field encoding.
//!
//! A request is a single frame of the form `<ordinal>[DELIM arg]*`.
//! Frames are NUL-terminated at the transport layer; fields within a
//! frame are separated by [`DELIMITER`]. Replies are a bare scalar or a
//! [`DELIMITER`]-separated id list in the same framing.

use std::time::Duration;

use tremolo_core::{RepeatMode, ShuffleMode, SongId};

use crate::error::{IpcError, IpcResult};

/// Loopback TCP port the daemon listens on.
pub const PORT: u16 = 3333;

/// How long the client waits for a reply before giving up on the channel.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Protocol version. The first exchange on every new connection is
/// `Version`; any mismatch is terminal for that client.
pub const VERSION: i64 = 4;

/// Field delimiter within one frame.
pub const DELIMITER: u8 = 0x1E;

/// Frame terminator at the transport layer.
pub const TERMINATOR: u8 = 0x00;

/// `count` argument that requests an entire queue.
pub const FULL_RANGE: usize = 65535;

/// A request with fixed arity and a defined reply shape.
///
/// Ordinals are assigned in declaration order and are part of the wire
/// contract; never reorder the variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Version,
    Resume,
    Pause,
    Previous,
    Next,
    GetVolume,
    SetVolume(f64),
    Mute,
    Unmute,
    GetSubQueue { start: usize, count: usize },
    SkipSubQueueSongs(usize),
    SubQueueSize,
    AddToSubQueue(SongId),
    RemoveFromSubQueue(usize),
    QueueIdx,
    SetQueueIdx(usize),
    QueueSize,
    RemoveFromQueue(usize),
    GetQueue { start: usize, count: usize },
    SetQueue(Vec<SongId>),
    GetRepeat,
    SetRepeat(RepeatMode),
    GetShuffle,
    SetShuffle(ShuffleMode),
    GetSong,
    GetStatus,
    GetPosition,
    SetPosition(f64),
    Reset,
}

impl Command {
    /// Wire ordinal of this command.
    #[must_use]
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Version => 0,
            Self::Resume => 1,
            Self::Pause => 2,
            Self::Previous => 3,
            Self::Next => 4,
            Self::GetVolume => 5,
            Self::SetVolume(_) => 6,
            Self::Mute => 7,
            Self::Unmute => 8,
            Self::GetSubQueue { .. } => 9,
            Self::SkipSubQueueSongs(_) => 10,
            Self::SubQueueSize => 11,
            Self::AddToSubQueue(_) => 12,
            Self::RemoveFromSubQueue(_) => 13,
            Self::QueueIdx => 14,
            Self::SetQueueIdx(_) => 15,
            Self::QueueSize => 16,
            Self::RemoveFromQueue(_) => 17,
            Self::GetQueue { .. } => 18,
            Self::SetQueue(_) => 19,
            Self::GetRepeat => 20,
            Self::SetRepeat(_) => 21,
            Self::GetShuffle => 22,
            Self::SetShuffle(_) => 23,
            Self::GetSong => 24,
            Self::GetStatus => 25,
            Self::GetPosition => 26,
            Self::SetPosition(_) => 27,
            Self::Reset => 28,
        }
    }

    /// Encode this command as one frame body.
    #[must_use]
    pub fn encode(&self) -> String {
        let delim = DELIMITER as char;
        let mut out = self.ordinal().to_string();
        match self {
            Self::Version
            | Self::Resume
            | Self::Pause
            | Self::Previous
            | Self::Next
            | Self::GetVolume
            | Self::Mute
            | Self::Unmute
            | Self::SubQueueSize
            | Self::QueueIdx
            | Self::QueueSize
            | Self::GetRepeat
            | Self::GetShuffle
            | Self::GetSong
            | Self::GetStatus
            | Self::GetPosition
            | Self::Reset => {}
            Self::SetVolume(v) | Self::SetPosition(v) => {
                out.push(delim);
                out.push_str(&v.to_string());
            }
            Self::GetSubQueue { start, count } | Self::GetQueue { start, count } => {
                out.push(delim);
                out.push_str(&start.to_string());
                out.push(delim);
                out.push_str(&count.to_string());
            }
            Self::SkipSubQueueSongs(n)
            | Self::RemoveFromSubQueue(n)
            | Self::SetQueueIdx(n)
            | Self::RemoveFromQueue(n) => {
                out.push(delim);
                out.push_str(&n.to_string());
            }
            Self::AddToSubQueue(id) => {
                out.push(delim);
                out.push_str(&id.to_string());
            }
            Self::SetQueue(ids) => {
                if !ids.is_empty() {
                    out.push(delim);
                    out.push_str(&encode_ids(ids));
                }
            }
            Self::SetRepeat(mode) => {
                out.push(delim);
                out.push_str(&mode.ordinal().to_string());
            }
            Self::SetShuffle(mode) => {
                out.push(delim);
                out.push_str(&mode.ordinal().to_string());
            }
        }
        out
    }

    /// Decode one frame body into a command.
    ///
    /// # Errors
    /// Returns [`IpcError::Malformed`] on an unknown ordinal, a missing
    /// argument, or an argument that fails to parse.
    pub fn decode(frame: &str) -> IpcResult<Self> {
        let fields: Vec<&str> = frame.split(DELIMITER as char).collect();
        let ordinal: u8 = fields
            .first()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| IpcError::Malformed(format!("bad ordinal in {frame:?}")))?;

        let int_arg = |idx: usize| -> IpcResult<i64> {
            fields
                .get(idx)
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| IpcError::Malformed(format!("missing int argument in {frame:?}")))
        };
        let index_arg = |idx: usize| -> IpcResult<usize> {
            usize::try_from(int_arg(idx)?)
                .map_err(|_| IpcError::Malformed(format!("negative index in {frame:?}")))
        };
        let double_arg = |idx: usize| -> IpcResult<f64> {
            fields
                .get(idx)
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| IpcError::Malformed(format!("missing double argument in {frame:?}")))
        };

        let command = match ordinal {
            0 => Self::Version,
            1 => Self::Resume,
            2 => Self::Pause,
            3 => Self::Previous,
            4 => Self::Next,
            5 => Self::GetVolume,
            6 => Self::SetVolume(double_arg(1)?),
            7 => Self::Mute,
            8 => Self::Unmute,
            9 => Self::GetSubQueue { start: index_arg(1)?, count: index_arg(2)? },
            10 => Self::SkipSubQueueSongs(index_arg(1)?),
            11 => Self::SubQueueSize,
            12 => Self::AddToSubQueue(int_arg(1)?),
            13 => Self::RemoveFromSubQueue(index_arg(1)?),
            14 => Self::QueueIdx,
            15 => Self::SetQueueIdx(index_arg(1)?),
            16 => Self::QueueSize,
            17 => Self::RemoveFromQueue(index_arg(1)?),
            18 => Self::GetQueue { start: index_arg(1)?, count: index_arg(2)? },
            19 => Self::SetQueue(parse_id_fields(&fields[1..], frame)?),
            20 => Self::GetRepeat,
            21 => Self::SetRepeat(
                RepeatMode::from_ordinal(int_arg(1)?)
                    .map_err(|e| IpcError::Malformed(e.to_string()))?,
            ),
            22 => Self::GetShuffle,
            23 => Self::SetShuffle(
                ShuffleMode::from_ordinal(int_arg(1)?)
                    .map_err(|e| IpcError::Malformed(e.to_string()))?,
            ),
            24 => Self::GetSong,
            25 => Self::GetStatus,
            26 => Self::GetPosition,
            27 => Self::SetPosition(double_arg(1)?),
            28 => Self::Reset,
            _ => return Err(IpcError::Malformed(format!("unknown ordinal {ordinal}"))),
        };
        Ok(command)
    }
}

/// Encode a song-id list as one delimited reply field run.
#[must_use]
pub fn encode_ids(ids: &[SongId]) -> String {
    let delim = (DELIMITER as char).to_string();
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(&delim)
}

/// Decode a delimited song-id list reply. An empty frame is an empty list.
#[must_use]
pub fn decode_ids(reply: &str) -> Vec<SongId> {
    if reply.is_empty() {
        return Vec::new();
    }
    reply.split(DELIMITER as char).filter_map(|f| f.parse().ok()).collect()
}

fn parse_id_fields(fields: &[&str], frame: &str) -> IpcResult<Vec<SongId>> {
    fields
        .iter()
        .map(|f| {
            f.parse()
                .map_err(|_| IpcError::Malformed(format!("bad id {f:?} in {frame:?}")))
        })
        .collect()
}

/// Parse a scalar integer reply.
#[must_use]
pub fn parse_int(reply: &str) -> Option<i64> {
    reply.trim_end_matches(char::from(0)).parse().ok()
}

/// Parse a scalar double reply.
#[must_use]
pub fn parse_double(reply: &str) -> Option<f64> {
    reply.trim_end_matches(char::from(0)).parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_bare_command_round_trip() {
        for command in [Command::Version, Command::Resume, Command::Reset, Command::GetStatus] {
            let encoded = command.encode();
            assert_eq!(Command::decode(&encoded).unwrap(), command);
        }
    }

    #[test]
    fn test_argument_round_trip() {
        let cases = [
            Command::SetVolume(37.5),
            Command::SetPosition(99.25),
            Command::AddToSubQueue(7),
            Command::RemoveFromSubQueue(3),
            Command::GetQueue { start: 0, count: 65535 },
            Command::GetSubQueue { start: 2, count: 8 },
            Command::SetQueueIdx(12),
            Command::SetRepeat(RepeatMode::All),
            Command::SetShuffle(ShuffleMode::On),
            Command::SetQueue(vec![1, 2, 3, 99]),
        ];
        for command in cases {
            let encoded = command.encode();
            assert_eq!(Command::decode(&encoded).unwrap(), command);
        }
    }

    #[test]
    fn test_encoding_shape() {
        assert_eq!(Command::Version.encode(), "0");
        assert_eq!(Command::SetVolume(37.5).encode(), "6\u{1e}37.5");
        assert_eq!(Command::GetQueue { start: 0, count: 65535 }.encode(), "18\u{1e}0\u{1e}65535");
        assert_eq!(Command::SetQueue(vec![4, 5]).encode(), "19\u{1e}4\u{1e}5");
    }

    #[test]
    fn test_malformed_rejected() {
        assert_matches!(Command::decode(""), Err(IpcError::Malformed(_)));
        assert_matches!(Command::decode("99"), Err(IpcError::Malformed(_)));
        assert_matches!(Command::decode("6"), Err(IpcError::Malformed(_)));
        assert_matches!(Command::decode("6\u{1e}loud"), Err(IpcError::Malformed(_)));
        assert_matches!(Command::decode("21\u{1e}7"), Err(IpcError::Malformed(_)));
    }

    #[test]
    fn test_id_list_round_trip() {
        let ids = vec![10, 20, 30];
        assert_eq!(decode_ids(&encode_ids(&ids)), ids);
        assert!(decode_ids("").is_empty());
    }
}
