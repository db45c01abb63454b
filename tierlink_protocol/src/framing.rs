// Length-delimited frame codec for stream transports.
//
// Wire format: a 4-byte big-endian payload length, then the payload. The raw
// functions (`write_frame` / `read_frame`) move bytes only; `send_json` /
// `recv_json` add the JSON step for any serde type so the TCP transport and
// the test backends share one code path.
//
// `MAX_FRAME_SIZE` bounds allocation from a corrupt or hostile length
// prefix. Realtime frames are small; the largest expected payload is a
// cached-event replay on room join.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Maximum accepted payload size (1 MiB).
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Write one frame: 4-byte big-endian length, then payload. Flushes.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                    payload.len()
                ),
            )
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one frame. `UnexpectedEof` if the stream ends early, `InvalidData`
/// if the prefix exceeds `MAX_FRAME_SIZE`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Serialize `msg` as JSON and write it as one frame.
pub fn send_json<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> io::Result<()> {
    let json = serde_json::to_vec(msg).map_err(io::Error::from)?;
    write_frame(writer, &json)
}

/// Read one frame and deserialize it from JSON. A payload that is not valid
/// JSON for `T` is reported as `InvalidData`.
pub fn recv_json<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<T> {
    let payload = read_frame(reader)?;
    serde_json::from_slice(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codes::OperationCode;
    use crate::message::{ClientMessage, OperationRequest};

    #[test]
    fn frames_are_read_back_in_order() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"alpha").unwrap();
        write_frame(&mut wire, b"").unwrap();
        write_frame(&mut wire, b"gamma").unwrap();

        let mut cursor = Cursor::new(wire);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"alpha");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"gamma");
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frames_are_refused_both_ways() {
        let big = vec![0u8; MAX_FRAME_SIZE as usize + 1];
        let err = write_frame(&mut Vec::new(), &big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let prefix = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let err = read_frame(&mut Cursor::new(prefix.to_vec())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_prefix_is_eof() {
        let err = read_frame(&mut Cursor::new(vec![0u8, 0, 1])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn json_helpers_carry_operations() {
        let msg = ClientMessage::Operation(
            OperationRequest::new(OperationCode::JoinLobby).with(crate::keys::LOBBY_NAME, "main"),
        );
        let mut wire = Vec::new();
        send_json(&mut wire, &msg).unwrap();
        let back: ClientMessage = recv_json(&mut Cursor::new(wire)).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn garbage_payload_is_invalid_data() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"not json").unwrap();
        let err = recv_json::<_, ClientMessage>(&mut Cursor::new(wire)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
