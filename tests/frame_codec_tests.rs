// Integration tests for the AudioSocket frame codec.

use voicegate::protocol::{
    audio_frame, hangup_frame, read_frame, read_id, Frame, FrameKind, ProtocolError,
};

#[tokio::test]
async fn encode_decode_round_trip_for_all_kinds() {
    let frames = vec![
        Frame::new(FrameKind::Hangup, vec![]),
        Frame::new(FrameKind::Id, vec![7u8; 16]),
        Frame::new(FrameKind::Silence, vec![]),
        Frame::new(FrameKind::Dtmf, vec![b'5']),
        Frame::new(FrameKind::Audio, vec![0x12, 0x34, 0x56, 0x78]),
        Frame::new(FrameKind::Error, vec![3]),
    ];

    for frame in frames {
        let encoded = frame.encode();
        let mut wire: &[u8] = &encoded;
        let decoded = read_frame(&mut wire)
            .await
            .expect("decode should succeed")
            .expect("frame expected");
        assert_eq!(decoded, frame);
        assert!(wire.is_empty(), "decoder should consume the whole frame");
    }
}

#[tokio::test]
async fn multiple_frames_decode_in_wire_order() {
    let mut wire = Vec::new();
    wire.extend_from_slice(&audio_frame(&[1, 2]));
    wire.extend_from_slice(&Frame::new(FrameKind::Dtmf, vec![b'9']).encode());
    wire.extend_from_slice(&hangup_frame());

    let mut reader: &[u8] = &wire;
    let first = read_frame(&mut reader).await.unwrap().unwrap();
    let second = read_frame(&mut reader).await.unwrap().unwrap();
    let third = read_frame(&mut reader).await.unwrap().unwrap();

    assert_eq!(first.kind, FrameKind::Audio);
    assert_eq!(first.payload, vec![1, 2]);
    assert_eq!(second.kind, FrameKind::Dtmf);
    assert_eq!(third.kind, FrameKind::Hangup);
    assert!(read_frame(&mut reader).await.unwrap().is_none());
}

#[tokio::test]
async fn clean_eof_is_distinct_from_truncation() {
    // EOF at a frame boundary: no frame, no error.
    let mut empty: &[u8] = &[];
    assert!(read_frame(&mut empty).await.unwrap().is_none());

    // EOF inside the header.
    let mut header_cut: &[u8] = &[0x10, 0x00];
    assert!(matches!(
        read_frame(&mut header_cut).await,
        Err(ProtocolError::Truncated)
    ));

    // EOF inside the payload.
    let mut payload_cut: &[u8] = &[0x10, 0x00, 0x04, 0xaa];
    assert!(matches!(
        read_frame(&mut payload_cut).await,
        Err(ProtocolError::Truncated)
    ));
}

#[tokio::test]
async fn read_id_returns_the_uuid() {
    let id = uuid::Uuid::new_v4();
    let wire = Frame::new(FrameKind::Id, id.as_bytes().to_vec()).encode();
    let mut reader: &[u8] = &wire;

    let parsed = read_id(&mut reader).await.expect("valid id frame");
    assert_eq!(parsed, id);
}

#[tokio::test]
async fn read_id_rejects_wrong_kind_and_wrong_length() {
    let mut audio_first: &[u8] = &audio_frame(&[0, 0]);
    assert!(matches!(
        read_id(&mut audio_first).await,
        Err(ProtocolError::ExpectedId(FrameKind::Audio))
    ));

    let mut short_id: &[u8] = &Frame::new(FrameKind::Id, vec![1; 8]).encode();
    assert!(matches!(
        read_id(&mut short_id).await,
        Err(ProtocolError::BadIdLength(8))
    ));

    let mut nothing: &[u8] = &[];
    assert!(matches!(
        read_id(&mut nothing).await,
        Err(ProtocolError::MissingId)
    ));
}

#[test]
fn helper_frames_match_the_wire_format() {
    assert_eq!(hangup_frame(), vec![0x00, 0x00, 0x00]);

    let pcm = vec![0u8; 320];
    let encoded = audio_frame(&pcm);
    assert_eq!(encoded[0], 0x10);
    assert_eq!(u16::from_be_bytes([encoded[1], encoded[2]]), 320);
    assert_eq!(encoded.len(), 3 + 320);
}
