//! Length-prefixed framing over the controller pipe.
//!
//! Every message is an 8-byte little-endian length followed by that many
//! payload bytes. Control messages (command tokens, replies) are short
//! UTF-8 strings; block payloads and serialized records travel as raw
//! buffer frames.

use std::io::{Read, Write};

use vdump_types::error::{Result, VdumpError};

/// Upper bound for control messages. Anything larger is a desynchronized
/// stream, not a real token.
pub const MAX_CONTROL_MESSAGE: usize = 256;

/// Upper bound for buffer frames; a frame cannot be larger than one block
/// plus serialization overhead, and blocks top out well under this.
const MAX_BUFFER_FRAME: usize = 1 << 30;

pub struct FrameSocket<R: Read, W: Write> {
    reader: R,
    writer: W,
}

impl<R: Read, W: Write> FrameSocket<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        FrameSocket { reader, writer }
    }

    fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        let len = payload.len() as u64;
        self.writer
            .write_all(&len.to_le_bytes())
            .and_then(|_| self.writer.write_all(payload))
            .and_then(|_| self.writer.flush())
            .map_err(|e| VdumpError::Provider(format!("pipe send failed: {e}")))
    }

    fn recv_frame(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let mut len_bytes = [0u8; 8];
        self.reader
            .read_exact(&mut len_bytes)
            .map_err(|e| VdumpError::Provider(format!("pipe receive failed: {e}")))?;
        let len = u64::from_le_bytes(len_bytes) as usize;
        if len > max_len {
            return Err(VdumpError::Provider(format!(
                "frame of {len} bytes exceeds the {max_len}-byte limit"
            )));
        }
        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| VdumpError::Provider(format!("pipe receive failed: {e}")))?;
        Ok(payload)
    }

    /// Send a short control message (command token or reply).
    pub fn send_msg(&mut self, msg: &str) -> Result<()> {
        debug_assert!(msg.len() <= MAX_CONTROL_MESSAGE);
        self.send_frame(msg.as_bytes())
    }

    pub fn recv_msg(&mut self) -> Result<String> {
        let payload = self.recv_frame(MAX_CONTROL_MESSAGE)?;
        String::from_utf8(payload)
            .map_err(|_| VdumpError::Provider("non-UTF-8 control message".into()))
    }

    /// Send a raw buffer (block payload or serialized record).
    pub fn send_buf(&mut self, buf: &[u8]) -> Result<()> {
        self.send_frame(buf)
    }

    pub fn recv_buf(&mut self) -> Result<Vec<u8>> {
        self.recv_frame(MAX_BUFFER_FRAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Loopback socket: what is sent can be read back.
    fn loopback(frames: impl FnOnce(&mut FrameSocket<Cursor<Vec<u8>>, Vec<u8>>)) -> Vec<u8> {
        let mut sock = FrameSocket::new(Cursor::new(Vec::new()), Vec::new());
        frames(&mut sock);
        sock.writer
    }

    #[test]
    fn msg_roundtrip() {
        let wire = loopback(|sock| {
            sock.send_msg("readBlock").unwrap();
            sock.send_msg("OK").unwrap();
        });
        let mut sock = FrameSocket::new(Cursor::new(wire), Vec::new());
        assert_eq!(sock.recv_msg().unwrap(), "readBlock");
        assert_eq!(sock.recv_msg().unwrap(), "OK");
    }

    #[test]
    fn buf_roundtrip() {
        let payload = vec![0xABu8; 4096];
        let wire = loopback(|sock| sock.send_buf(&payload).unwrap());
        let mut sock = FrameSocket::new(Cursor::new(wire), Vec::new());
        assert_eq!(sock.recv_buf().unwrap(), payload);
    }

    #[test]
    fn empty_buf_roundtrip() {
        let wire = loopback(|sock| sock.send_buf(&[]).unwrap());
        let mut sock = FrameSocket::new(Cursor::new(wire), Vec::new());
        assert_eq!(sock.recv_buf().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn oversized_control_message_rejected() {
        let huge = vec![b'x'; MAX_CONTROL_MESSAGE + 1];
        let wire = loopback(|sock| sock.send_buf(&huge).unwrap());
        let mut sock = FrameSocket::new(Cursor::new(wire), Vec::new());
        assert!(matches!(
            sock.recv_msg(),
            Err(VdumpError::Provider(_))
        ));
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let wire = loopback(|sock| sock.send_buf(&[1, 2, 3, 4]).unwrap());
        let cut = wire[..wire.len() - 2].to_vec();
        let mut sock = FrameSocket::new(Cursor::new(cut), Vec::new());
        assert!(matches!(
            sock.recv_buf(),
            Err(VdumpError::Provider(_))
        ));
    }
}
