//! Minimal OSC 1.0 message codec
//!
//! Sonic Pi speaks plain OSC messages over UDP: a padded address string, a
//! padded type-tag string and big-endian arguments. Only the argument types
//! the listen loop and recording helpers use are supported. Bundles are
//! rejected.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use cadenza_core::{CadenzaError, Result};
use std::io::{Cursor, Read};

const BUNDLE_TAG: &[u8] = b"#bundle\0";

/// A single OSC argument
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Float(f32),
    Str(String),
    Blob(Vec<u8>),
    Bool(bool),
}

impl OscArg {
    fn type_tag(&self) -> char {
        match self {
            OscArg::Int(_) => 'i',
            OscArg::Float(_) => 'f',
            OscArg::Str(_) => 's',
            OscArg::Blob(_) => 'b',
            OscArg::Bool(true) => 'T',
            OscArg::Bool(false) => 'F',
        }
    }
}

/// An OSC message: address pattern plus arguments
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub path: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: OscArg) -> Self {
        self.args.push(arg);
        self
    }

    /// Message carrying a single string argument
    pub fn text(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(path).with_arg(OscArg::Str(text.into()))
    }

    /// Code fragment for the engine's listen loop
    pub fn run_code(path: impl Into<String>, code: impl Into<String>) -> Self {
        Self::text(path, code)
    }

    pub fn start_recording() -> Self {
        Self::new("/start-recording")
    }

    pub fn stop_recording() -> Self {
        Self::new("/stop-recording")
    }

    pub fn save_recording(file_name: impl Into<String>) -> Self {
        Self::text("/save-recording", file_name)
    }

    /// First string argument, which is where feedback text travels
    pub fn first_str(&self) -> Option<&str> {
        self.args.iter().find_map(|arg| match arg {
            OscArg::Str(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Encode into a UDP datagram payload
    pub fn encode(&self) -> Result<Vec<u8>> {
        if !self.path.starts_with('/') {
            return Err(CadenzaError::Codec(format!(
                "Address must start with '/': {}",
                self.path
            )));
        }

        let mut buf = Vec::with_capacity(64);
        write_padded_str(&mut buf, &self.path);

        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        tags.extend(self.args.iter().map(OscArg::type_tag));
        write_padded_str(&mut buf, &tags);

        for arg in &self.args {
            match arg {
                OscArg::Int(v) => buf.write_i32::<BigEndian>(*v)?,
                OscArg::Float(v) => buf.write_f32::<BigEndian>(*v)?,
                OscArg::Str(s) => write_padded_str(&mut buf, s),
                OscArg::Blob(bytes) => {
                    let len = i32::try_from(bytes.len())
                        .map_err(|_| CadenzaError::Codec("Blob too large".to_string()))?;
                    buf.write_i32::<BigEndian>(len)?;
                    buf.extend_from_slice(bytes);
                    pad_to_four(&mut buf);
                }
                OscArg::Bool(_) => {}
            }
        }

        Ok(buf)
    }

    /// Decode a UDP datagram payload
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.starts_with(BUNDLE_TAG) {
            return Err(CadenzaError::Codec("OSC bundles are not supported".to_string()));
        }

        let mut cursor = Cursor::new(data);
        let path = read_padded_str(&mut cursor)?;
        if !path.starts_with('/') {
            return Err(CadenzaError::Codec(format!("Invalid OSC address: {:?}", path)));
        }

        // Some senders omit the type-tag string for argument-less messages
        if cursor.position() as usize == data.len() {
            return Ok(Self::new(path));
        }

        let tags = read_padded_str(&mut cursor)?;
        let tags = tags
            .strip_prefix(',')
            .ok_or_else(|| CadenzaError::Codec(format!("Invalid type tags: {:?}", tags)))?;

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.chars() {
            let arg = match tag {
                'i' => OscArg::Int(cursor.read_i32::<BigEndian>().map_err(truncated)?),
                'f' => OscArg::Float(cursor.read_f32::<BigEndian>().map_err(truncated)?),
                's' => OscArg::Str(read_padded_str(&mut cursor)?),
                'b' => {
                    let len = cursor.read_i32::<BigEndian>().map_err(truncated)?;
                    let len = usize::try_from(len)
                        .map_err(|_| CadenzaError::Codec("Negative blob length".to_string()))?;
                    let available = data.len().saturating_sub(cursor.position() as usize);
                    if len > available {
                        return Err(CadenzaError::Codec(format!(
                            "Truncated OSC message: blob declares {} bytes, {} remain",
                            len, available
                        )));
                    }
                    let mut bytes = vec![0u8; len];
                    cursor.read_exact(&mut bytes).map_err(truncated)?;
                    skip_padding(&mut cursor, len);
                    OscArg::Blob(bytes)
                }
                'T' => OscArg::Bool(true),
                'F' => OscArg::Bool(false),
                other => {
                    return Err(CadenzaError::Codec(format!(
                        "Unsupported OSC type tag '{}'",
                        other
                    )))
                }
            };
            args.push(arg);
        }

        Ok(Self { path, args })
    }
}

fn truncated(e: std::io::Error) -> CadenzaError {
    CadenzaError::Codec(format!("Truncated OSC message: {}", e))
}

fn pad_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// OSC strings are NUL-terminated and padded to a multiple of four bytes
fn write_padded_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    pad_to_four(buf);
}

fn read_padded_str(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let start = cursor.position() as usize;
    let data = *cursor.get_ref();
    let remaining = data.get(start..).unwrap_or_default();

    let nul = remaining
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| CadenzaError::Codec("Unterminated OSC string".to_string()))?;

    let text = std::str::from_utf8(&remaining[..nul])
        .map_err(|e| CadenzaError::Codec(format!("OSC string is not UTF-8: {}", e)))?
        .to_string();

    // Advance past the terminator and padding, clamped to the datagram end
    let consumed = (nul + 1).div_ceil(4) * 4;
    let next = (start + consumed).min(data.len());
    cursor.set_position(next as u64);
    Ok(text)
}

fn skip_padding(cursor: &mut Cursor<&[u8]>, len: usize) {
    let pad = (4 - len % 4) % 4;
    let next = (cursor.position() as usize + pad).min(cursor.get_ref().len());
    cursor.set_position(next as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_run_code_layout() {
        let bytes = OscMessage::run_code("/run-code", "play 60").encode().unwrap();

        // "/run-code" is 9 bytes + NUL, padded to 12
        assert_eq!(&bytes[..12], b"/run-code\0\0\0");
        // ",s" + NUL, padded to 4
        assert_eq!(&bytes[12..16], b",s\0\0");
        // "play 60" is 7 bytes + NUL = 8
        assert_eq!(&bytes[16..24], b"play 60\0");
        assert_eq!(bytes.len(), 24);
    }

    #[test]
    fn test_decode_feedback_from_engine() {
        // What Sonic Pi's osc_send '/feedback', 'OK' puts on the wire
        let mut datagram = Vec::new();
        datagram.extend_from_slice(b"/feedback\0\0\0");
        datagram.extend_from_slice(b",s\0\0");
        datagram.extend_from_slice(b"OK\0\0");

        let msg = OscMessage::decode(&datagram).unwrap();
        assert_eq!(msg.path, "/feedback");
        assert_eq!(msg.first_str(), Some("OK"));
    }

    #[test]
    fn test_mixed_arguments_survive_decoding() {
        let msg = OscMessage::new("/mixed")
            .with_arg(OscArg::Int(-7))
            .with_arg(OscArg::Float(0.5))
            .with_arg(OscArg::Blob(vec![1, 2, 3, 4, 5]))
            .with_arg(OscArg::Bool(true))
            .with_arg(OscArg::Str("tail".to_string()));

        let decoded = OscMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.first_str(), Some("tail"));
    }

    #[test]
    fn test_argument_less_message() {
        let bytes = OscMessage::stop_recording().encode().unwrap();
        let decoded = OscMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.path, "/stop-recording");
        assert!(decoded.args.is_empty());

        // Address only, no type tag string
        let decoded = OscMessage::decode(b"/ping\0\0\0").unwrap();
        assert_eq!(decoded.path, "/ping");
    }

    #[test]
    fn test_multiline_code_is_preserved() {
        let code = "live_loop :beat do\n  sample :bd_haus\n  sleep 0.5\nend";
        let bytes = OscMessage::run_code("/run-code", code).encode().unwrap();
        let decoded = OscMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.first_str(), Some(code));
    }

    #[test]
    fn test_rejects_bundles() {
        let mut datagram = BUNDLE_TAG.to_vec();
        datagram.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            OscMessage::decode(&datagram),
            Err(CadenzaError::Codec(_))
        ));
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(OscMessage::decode(b"").is_err());
        assert!(OscMessage::decode(b"no-slash\0\0\0\0").is_err());
        assert!(OscMessage::decode(b"/unterminated").is_err());
        // Declares an int but carries no data
        assert!(OscMessage::decode(b"/x\0\0,i\0\0").is_err());
        assert!(OscMessage::decode(b"/x\0\0,q\0\0").is_err());
    }

    #[test]
    fn test_oversized_blob_length_is_rejected() {
        let mut datagram = b"/x\0\0,b\0\0".to_vec();
        datagram.extend_from_slice(&i32::MAX.to_be_bytes());
        datagram.extend_from_slice(&[1, 2, 3, 4]);

        match OscMessage::decode(&datagram) {
            Err(CadenzaError::Codec(message)) => assert!(message.contains("blob declares")),
            other => panic!("expected codec error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_rejects_bad_address() {
        assert!(OscMessage::text("feedback", "x").encode().is_err());
    }
}
