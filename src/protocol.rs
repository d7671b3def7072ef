use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

/// PCM bytes per outbound audio frame: 20 ms at 8 kHz, 16-bit mono.
///
/// The wire carries no timing, so the receiver assumes exactly one frame per
/// 20 ms of audio. 160 bytes (10 ms) plays back in slow motion; never change
/// this without changing the pacing tick to match.
pub const DEFAULT_FRAME_PCM_BYTES: usize = 320;

/// Largest payload a frame header can describe (u16 length field).
pub const MAX_PAYLOAD_BYTES: usize = u16::MAX as usize;

/// Errors raised by the frame codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame kind byte 0x{0:02x}")]
    UnknownKind(u8),

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("expected id frame, got {0:?}")]
    ExpectedId(FrameKind),

    #[error("id payload must be 16 bytes, got {0}")]
    BadIdLength(usize),

    #[error("connection closed before id frame")]
    MissingId,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frame kinds on the AudioSocket wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Call teardown; empty payload. Sent by either side.
    Hangup,
    /// First frame on every connection; payload is the 16-byte call UUID.
    Id,
    /// Silence marker from the peer; informational.
    Silence,
    /// One ASCII digit of DTMF.
    Dtmf,
    /// SLIN16 audio: 16-bit signed little-endian PCM, 8 kHz, mono.
    Audio,
    /// Peer-reported failure; payload is a single error code byte.
    Error,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(FrameKind::Hangup),
            0x01 => Ok(FrameKind::Id),
            0x02 => Ok(FrameKind::Silence),
            0x03 => Ok(FrameKind::Dtmf),
            0x10 => Ok(FrameKind::Audio),
            0xff => Ok(FrameKind::Error),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            FrameKind::Hangup => 0x00,
            FrameKind::Id => 0x01,
            FrameKind::Silence => 0x02,
            FrameKind::Dtmf => 0x03,
            FrameKind::Audio => 0x10,
            FrameKind::Error => 0xff,
        }
    }
}

/// A single protocol message: `[1-byte kind][2-byte BE length][payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_BYTES);
        Self { kind, payload }
    }

    pub fn hangup() -> Self {
        Self::new(FrameKind::Hangup, Vec::new())
    }

    pub fn audio(pcm: &[u8]) -> Self {
        Self::new(FrameKind::Audio, pcm.to_vec())
    }

    /// Serializes the frame into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len().min(MAX_PAYLOAD_BYTES) as u16;
        let mut buf = Vec::with_capacity(3 + len as usize);
        buf.push(self.kind.as_byte());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload[..len as usize]);
        buf
    }

    /// The error code carried by an `Error` frame, if any.
    pub fn error_code(&self) -> Option<u8> {
        if self.kind == FrameKind::Error {
            self.payload.first().copied()
        } else {
            None
        }
    }
}

/// Encoded hangup frame: `0x00 0x00 0x00`.
pub fn hangup_frame() -> Vec<u8> {
    Frame::hangup().encode()
}

/// Encoded audio frame wrapping the given PCM.
pub fn audio_frame(pcm: &[u8]) -> Vec<u8> {
    Frame::audio(pcm).encode()
}

/// Reads the next frame from the stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary; EOF inside a frame
/// is a `Truncated` protocol error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut kind_byte = [0u8; 1];
    if reader.read(&mut kind_byte).await? == 0 {
        return Ok(None);
    }
    let kind = FrameKind::from_byte(kind_byte[0])?;

    let mut len_bytes = [0u8; 2];
    read_exact_or_truncated(reader, &mut len_bytes).await?;
    let len = u16::from_be_bytes(len_bytes) as usize;

    let mut payload = vec![0u8; len];
    read_exact_or_truncated(reader, &mut payload).await?;

    Ok(Some(Frame { kind, payload }))
}

async fn read_exact_or_truncated<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::Truncated)
        }
        Err(err) => Err(err.into()),
    }
}

/// Reads the initial frame and requires it to be a 16-byte `Id`.
pub async fn read_id<R>(reader: &mut R) -> Result<Uuid, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader).await?.ok_or(ProtocolError::MissingId)?;
    if frame.kind != FrameKind::Id {
        return Err(ProtocolError::ExpectedId(frame.kind));
    }
    let bytes: [u8; 16] = frame
        .payload
        .as_slice()
        .try_into()
        .map_err(|_| ProtocolError::BadIdLength(frame.payload.len()))?;
    Ok(Uuid::from_bytes(bytes))
}
