use std::io::Cursor;

use anyhow::Result;
use shoal::protocol::{
    Kind, MAX_FRAME_LEN, Message, Outcome, ProtocolError, decode, encode, read_message,
    write_message,
};

fn frame(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut f = ((body.len() + 1) as u32).to_be_bytes().to_vec();
    f.push(kind);
    f.extend_from_slice(body);
    f
}

#[test]
fn task_frame_layout() -> Result<()> {
    let msg = Message::Task {
        task_id: 7,
        genome_id: 0x0102,
        payload: b"abc".to_vec(),
    };
    let f = encode(&msg)?;

    assert_eq!(&f[..4], &20u32.to_be_bytes());
    assert_eq!(f[4], u8::from(Kind::Task));
    assert_eq!(&f[5..13], &7u64.to_be_bytes());
    assert_eq!(&f[13..21], &0x0102u64.to_be_bytes());
    assert_eq!(&f[21..], b"abc");
    assert_eq!(decode(&f)?, msg);

    Ok(())
}

#[test]
fn control_frames_are_one_byte() -> Result<()> {
    assert_eq!(encode(&Message::Heartbeat)?, vec![0u8, 0, 0, 1, u8::from(Kind::Heartbeat)]);
    assert_eq!(encode(&Message::Shutdown)?, vec![0u8, 0, 0, 1, u8::from(Kind::Shutdown)]);
    Ok(())
}

#[test]
fn stream_of_messages() -> Result<()> {
    let msgs = vec![
        Message::Hello {
            worker_id: "w-1".to_string(),
            capacity: 4,
        },
        Message::HelloAck {
            assigned_id: 3,
            heartbeat_interval_ms: 250,
        },
        Message::Task {
            task_id: 1,
            genome_id: 9,
            payload: vec![],
        },
        Message::Result {
            task_id: 1,
            outcome: Outcome::Fitness(-1.5),
        },
        Message::Result {
            task_id: 2,
            outcome: Outcome::Error("boom".to_string()),
        },
        Message::Heartbeat,
        Message::Reject {
            reason: "capacity must be greater than 0".to_string(),
        },
        Message::Shutdown,
    ];

    let mut buf = Vec::new();
    for m in &msgs {
        write_message(&mut buf, m)?;
    }

    let mut r = Cursor::new(buf);
    for m in &msgs {
        assert_eq!(&read_message(&mut r)?, m);
    }
    assert!(matches!(
        read_message(&mut r),
        Err(ProtocolError::ConnectionClosed)
    ));

    Ok(())
}

#[test]
fn eof_inside_frame_is_truncated() -> Result<()> {
    let f = encode(&Message::Task {
        task_id: 1,
        genome_id: 2,
        payload: vec![1; 32],
    })?;

    // Inside the body
    let mut r = Cursor::new(f[..f.len() - 5].to_vec());
    assert!(matches!(
        read_message(&mut r),
        Err(ProtocolError::Truncated { .. })
    ));

    // Inside the length prefix
    let mut r = Cursor::new(f[..2].to_vec());
    assert!(matches!(
        read_message(&mut r),
        Err(ProtocolError::Truncated {
            expected: 4,
            got: 2
        })
    ));

    assert!(matches!(
        decode(&f[..f.len() - 1]),
        Err(ProtocolError::Truncated { .. })
    ));

    Ok(())
}

#[test]
fn unknown_kind() {
    let f = frame(0x7f, b"");
    assert!(matches!(decode(&f), Err(ProtocolError::UnknownKind(0x7f))));
    assert!(matches!(
        read_message(&mut Cursor::new(f)),
        Err(ProtocolError::UnknownKind(0x7f))
    ));
}

#[test]
fn oversized_length_rejected_before_reading_body() {
    let mut f = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
    f.push(Kind::Task.into());
    assert!(matches!(
        read_message(&mut Cursor::new(f)),
        Err(ProtocolError::TooLarge(n)) if n == MAX_FRAME_LEN + 1
    ));
}

#[test]
fn zero_length_frame() {
    let f = vec![0, 0, 0, 0];
    assert!(matches!(decode(&f), Err(ProtocolError::Empty)));
}

#[test]
fn malformed_bodies() {
    // Heartbeat carries no body
    let f = frame(Kind::Heartbeat.into(), b"x");
    assert!(matches!(
        decode(&f),
        Err(ProtocolError::Malformed {
            kind: Kind::Heartbeat,
            ..
        })
    ));

    // Task needs both ids
    let f = frame(Kind::Task.into(), &[0; 12]);
    assert!(matches!(
        decode(&f),
        Err(ProtocolError::Malformed { kind: Kind::Task, .. })
    ));

    // HelloAck is exactly two ids
    let f = frame(Kind::HelloAck.into(), &[0; 17]);
    assert!(matches!(
        decode(&f),
        Err(ProtocolError::Malformed {
            kind: Kind::HelloAck,
            ..
        })
    ));

    // Hello body is not msgpack
    let f = frame(Kind::Hello.into(), &[0xc1]);
    assert!(matches!(
        decode(&f),
        Err(ProtocolError::Malformed { kind: Kind::Hello, .. })
    ));
}

#[test]
fn trailing_bytes_after_frame() -> Result<()> {
    let mut f = encode(&Message::Heartbeat)?;
    f.push(0);
    assert!(matches!(decode(&f), Err(ProtocolError::Malformed { .. })));
    Ok(())
}

#[test]
fn disconnect_classification() {
    assert!(ProtocolError::ConnectionClosed.is_disconnect());
    assert!(!ProtocolError::Empty.is_disconnect());
    assert!(!ProtocolError::UnknownKind(9).is_disconnect());
}
