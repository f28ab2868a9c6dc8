// Binary progress frame codec for the realtime channel.

use anyhow::{anyhow, bail, Result};

const TAG_DOWNLOAD_PROGRESS: u8 = 0x00;
const TAG_DOWNLOAD_ERROR: u8 = 0x01;
const TAG_PACK_PROGRESS: u8 = 0x10;
const TAG_PACK_ERROR: u8 = 0x11;
const TAG_RESULT: u8 = 0x20;

/// Broadcast phase a frame belongs to. The broadcaster caches the most
/// recent frame per phase for late-joiner replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Download = 0,
    Pack = 1,
    Result = 2,
}

pub const PHASE_COUNT: usize = 3;

/// One message on the realtime channel. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    DownloadProgress { completed: u16, total: u16 },
    DownloadError,
    PackProgress { completed: u16, total: u16 },
    PackError,
    Result { path: String },
}

impl Frame {
    pub fn phase(&self) -> Phase {
        match self {
            Frame::DownloadProgress { .. } | Frame::DownloadError => Phase::Download,
            Frame::PackProgress { .. } | Frame::PackError => Phase::Pack,
            Frame::Result { .. } => Phase::Result,
        }
    }

    /// Encode to the wire format: 1 tag byte, then for progress frames two
    /// big-endian u16 counts, for result frames the UTF-8 retrieval path.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::DownloadProgress { completed, total } => {
                encode_progress(TAG_DOWNLOAD_PROGRESS, *completed, *total)
            }
            Frame::DownloadError => vec![TAG_DOWNLOAD_ERROR],
            Frame::PackProgress { completed, total } => {
                encode_progress(TAG_PACK_PROGRESS, *completed, *total)
            }
            Frame::PackError => vec![TAG_PACK_ERROR],
            Frame::Result { path } => {
                let mut buf = Vec::with_capacity(1 + path.len());
                buf.push(TAG_RESULT);
                buf.extend_from_slice(path.as_bytes());
                buf
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let (&tag, payload) = bytes
            .split_first()
            .ok_or_else(|| anyhow!("empty frame"))?;
        match tag {
            TAG_DOWNLOAD_PROGRESS => {
                let (completed, total) = decode_progress(payload)?;
                Ok(Frame::DownloadProgress { completed, total })
            }
            TAG_DOWNLOAD_ERROR => Ok(Frame::DownloadError),
            TAG_PACK_PROGRESS => {
                let (completed, total) = decode_progress(payload)?;
                Ok(Frame::PackProgress { completed, total })
            }
            TAG_PACK_ERROR => Ok(Frame::PackError),
            TAG_RESULT => Ok(Frame::Result {
                path: std::str::from_utf8(payload)
                    .map_err(|e| anyhow!("result path is not UTF-8: {}", e))?
                    .to_string(),
            }),
            other => bail!("unknown frame tag 0x{:02x}", other),
        }
    }
}

fn encode_progress(tag: u8, completed: u16, total: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.push(tag);
    buf.extend_from_slice(&completed.to_be_bytes());
    buf.extend_from_slice(&total.to_be_bytes());
    buf
}

fn decode_progress(payload: &[u8]) -> Result<(u16, u16)> {
    if payload.len() != 4 {
        bail!("progress payload must be 4 bytes, got {}", payload.len());
    }
    let completed = u16::from_be_bytes([payload[0], payload[1]]);
    let total = u16::from_be_bytes([payload[2], payload[3]]);
    Ok((completed, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_progress_wire_format() {
        let frame = Frame::DownloadProgress {
            completed: 7,
            total: 300,
        };
        assert_eq!(frame.encode(), vec![0x00, 0x00, 0x07, 0x01, 0x2c]);
    }

    #[test]
    fn test_pack_progress_wire_format() {
        let frame = Frame::PackProgress {
            completed: 0,
            total: 25,
        };
        assert_eq!(frame.encode(), vec![0x10, 0x00, 0x00, 0x00, 0x19]);
    }

    #[test]
    fn test_error_frames_have_no_payload() {
        assert_eq!(Frame::DownloadError.encode(), vec![0x01]);
        assert_eq!(Frame::PackError.encode(), vec![0x11]);
    }

    #[test]
    fn test_result_frame_carries_path() {
        let frame = Frame::Result {
            path: "/download/abc/1.zip".to_string(),
        };
        let encoded = frame.encode();
        assert_eq!(encoded[0], 0x20);
        assert_eq!(&encoded[1..], b"/download/abc/1.zip");
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Frame::decode(&[]).is_err());
        assert!(Frame::decode(&[0xff]).is_err());
        // Truncated progress payload.
        assert!(Frame::decode(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn test_progress_round_trip() {
        let frame = Frame::DownloadProgress {
            completed: u16::MAX,
            total: u16::MAX,
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_phase_assignment() {
        assert_eq!(Frame::DownloadError.phase(), Phase::Download);
        assert_eq!(Frame::PackError.phase(), Phase::Pack);
        assert_eq!(
            Frame::Result {
                path: String::new()
            }
            .phase(),
            Phase::Result
        );
    }
}
