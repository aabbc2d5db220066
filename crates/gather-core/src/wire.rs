//! Wire format of the Transfer Channel.
//!
//! ```text
//! D <relative-path>\n
//! F <size> <relative-path>\n<size raw bytes>
//! R <relative-path>\n
//! X <exit-code>\n
//! ```
//!
//! `R` withdraws a path sent earlier that no longer exists remotely.
//! `X` is the last record of a complete stream. File payloads are surfaced as a
//! `FileStart`, any number of `Chunk`s and a `FileEnd`, so a file is never held
//! in memory as a whole.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::ChannelError;

/// Longest accepted header line, including the newline.
pub const MAX_HEADER_LEN: usize = 4096;

/// Default upper bound for a single `Chunk` frame.
pub const DEFAULT_MAX_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Directory(String),
    FileStart { path: String, size: u64 },
    Chunk(Bytes),
    FileEnd,
    Remove(String),
    Exit(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Payload { remaining: u64 },
}

#[derive(Debug)]
pub struct WireDecoder {
    state: State,
    max_chunk: usize,
}

impl WireDecoder {
    pub fn new() -> Self {
        Self::with_max_chunk(DEFAULT_MAX_CHUNK)
    }

    pub fn with_max_chunk(max_chunk: usize) -> Self {
        Self {
            state: State::Header,
            max_chunk: max_chunk.max(1),
        }
    }

    /// True while a file payload is only partially decoded.
    pub fn in_file(&self) -> bool {
        matches!(self.state, State::Payload { .. })
    }

    fn parse_header(&mut self, line: &[u8]) -> Result<Frame, ChannelError> {
        let line = std::str::from_utf8(line)
            .map_err(|_| ChannelError::Protocol("header is not valid UTF-8".into()))?;
        let (tag, rest) = line
            .split_once(' ')
            .ok_or_else(|| ChannelError::Protocol(format!("malformed header: {line:?}")))?;

        match tag {
            "D" => Ok(Frame::Directory(non_empty_path(rest)?)),
            "F" => {
                let (size, path) = rest
                    .split_once(' ')
                    .ok_or_else(|| ChannelError::Protocol(format!("malformed file header: {line:?}")))?;
                let size = size
                    .parse::<u64>()
                    .map_err(|_| ChannelError::Protocol(format!("bad file size: {size:?}")))?;
                let path = non_empty_path(path)?;
                self.state = State::Payload { remaining: size };
                Ok(Frame::FileStart { path, size })
            }
            "R" => Ok(Frame::Remove(non_empty_path(rest)?)),
            "X" => rest
                .trim()
                .parse::<i32>()
                .map(Frame::Exit)
                .map_err(|_| ChannelError::Protocol(format!("bad exit code: {rest:?}"))),
            other => Err(ChannelError::Protocol(format!("unknown record tag {other:?}"))),
        }
    }
}

impl Default for WireDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty_path(path: &str) -> Result<String, ChannelError> {
    if path.is_empty() {
        return Err(ChannelError::Protocol("record without a path".into()));
    }
    Ok(path.to_string())
}

impl Decoder for WireDecoder {
    type Item = Frame;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ChannelError> {
        match self.state {
            State::Header => {
                let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                    if src.len() >= MAX_HEADER_LEN {
                        return Err(ChannelError::Protocol(format!(
                            "header longer than {MAX_HEADER_LEN} bytes"
                        )));
                    }
                    return Ok(None);
                };
                if pos + 1 > MAX_HEADER_LEN {
                    return Err(ChannelError::Protocol(format!(
                        "header longer than {MAX_HEADER_LEN} bytes"
                    )));
                }
                let line = src.split_to(pos + 1);
                self.parse_header(&line[..pos]).map(Some)
            }
            State::Payload { remaining: 0 } => {
                self.state = State::Header;
                Ok(Some(Frame::FileEnd))
            }
            State::Payload { remaining } => {
                if src.is_empty() {
                    return Ok(None);
                }
                let n = (remaining.min(src.len() as u64) as usize).min(self.max_chunk);
                let chunk = src.split_to(n).freeze();
                self.state = State::Payload {
                    remaining: remaining - n as u64,
                };
                Ok(Some(Frame::Chunk(chunk)))
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ChannelError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() && self.state == State::Header => Ok(None),
            None => Err(ChannelError::Closed),
        }
    }
}

/// Encode a directory record.
pub fn directory_record(path: &str) -> Vec<u8> {
    format!("D {path}\n").into_bytes()
}

/// Encode a file record: header followed by the raw contents.
pub fn file_record(path: &str, contents: &[u8]) -> Vec<u8> {
    let mut out = format!("F {} {path}\n", contents.len()).into_bytes();
    out.extend_from_slice(contents);
    out
}

/// Encode a removal record.
pub fn removal_record(path: &str) -> Vec<u8> {
    format!("R {path}\n").into_bytes()
}

/// Encode the terminal exit record.
pub fn exit_record(code: i32) -> Vec<u8> {
    format!("X {code}\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8], step: usize) -> Result<Vec<Frame>, ChannelError> {
        let mut dec = WireDecoder::with_max_chunk(8);
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for piece in bytes.chunks(step.max(1)) {
            buf.extend_from_slice(piece);
            while let Some(f) = dec.decode(&mut buf)? {
                frames.push(f);
            }
        }
        while let Some(f) = dec.decode_eof(&mut buf)? {
            frames.push(f);
        }
        Ok(frames)
    }

    fn collect_file(frames: &[Frame]) -> Vec<u8> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Chunk(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn decodes_regardless_of_split_points() {
        let mut stream = directory_record("audit_logs");
        stream.extend(file_record("audit_logs/kube apiserver.listing", b"0123456789abcdefXYZ"));
        stream.extend(exit_record(3));

        for step in [1, 2, 5, 13, stream.len()] {
            let frames = decode_all(&stream, step).unwrap();
            assert_eq!(frames.first(), Some(&Frame::Directory("audit_logs".into())));
            assert_eq!(
                frames[1],
                Frame::FileStart {
                    path: "audit_logs/kube apiserver.listing".into(),
                    size: 19
                }
            );
            assert_eq!(collect_file(&frames), b"0123456789abcdefXYZ");
            assert!(frames.iter().all(|f| match f {
                Frame::Chunk(b) => b.len() <= 8,
                _ => true,
            }));
            assert_eq!(frames[frames.len() - 2], Frame::FileEnd);
            assert_eq!(frames.last(), Some(&Frame::Exit(3)));
        }
    }

    #[test]
    fn empty_file_yields_start_and_end() {
        let mut stream = file_record("empty", b"");
        stream.extend(exit_record(0));
        let frames = decode_all(&stream, 64).unwrap();
        assert_eq!(
            frames,
            vec![
                Frame::FileStart {
                    path: "empty".into(),
                    size: 0
                },
                Frame::FileEnd,
                Frame::Exit(0),
            ]
        );
    }

    #[test]
    fn removal_follows_a_file_payload() {
        let mut stream = file_record("final.txt", b"x");
        stream.extend(removal_record("tmp.part"));
        stream.extend(exit_record(0));
        let frames = decode_all(&stream, 3).unwrap();
        assert_eq!(frames[frames.len() - 2], Frame::Remove("tmp.part".into()));
        assert!(matches!(decode_all(b"R \n", 64).unwrap_err(), ChannelError::Protocol(_)));
    }

    #[test]
    fn truncated_payload_is_closed_error() {
        let stream = file_record("ls.log", b"total 0\n");
        let err = decode_all(&stream[..stream.len() - 3], 4).unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            decode_all(b"Q what\n", 64).unwrap_err(),
            ChannelError::Protocol(_)
        ));
        assert!(matches!(
            decode_all(b"F ten x\n", 64).unwrap_err(),
            ChannelError::Protocol(_)
        ));
        let long = vec![b'a'; MAX_HEADER_LEN + 1];
        assert!(matches!(
            decode_all(&long, 512).unwrap_err(),
            ChannelError::Protocol(_)
        ));
    }
}
