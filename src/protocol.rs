use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, block_padding::NoPadding};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest, Md5};
use serde_json::Value;
use std::fmt;

type Aes128EcbEnc = ecb::Encryptor<aes::Aes128>;
type Aes128EcbDec = ecb::Decryptor<aes::Aes128>;

const AES_BLOCK_SIZE: usize = 16;
const MD5_TAG_SIZE: usize = 16;

// Frame markers
pub const PREFIX: [u8; 4] = [0x00, 0x00, 0x55, 0xaa];
pub const SUFFIX: [u8; 4] = [0x00, 0x00, 0xaa, 0x55];

// Sizes
pub const HEADER_SIZE: usize = 16; // prefix(4) + reserved(7) + cmd(1) + length(4)
pub const RETCODE_SIZE: usize = 4;
pub const CRC_SIZE: usize = 4;
pub const SUFFIX_SIZE: usize = 4;
pub const FOOTER_SIZE: usize = CRC_SIZE + SUFFIX_SIZE; // 8

/// Return code reported for frames that fail envelope validation.
pub const CORRUPT_CODE: u32 = 999;

// -- Data types --

/// Frame command byte. v3.1 gear only ever speaks these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// 0x0A — status query; payload travels in the clear.
    Get,
    /// 0x07 — datapoint write; payload carries the cipher envelope.
    Set,
}

impl Command {
    pub fn byte(self) -> u8 {
        match self {
            Command::Get => 0x0a,
            Command::Set => 0x07,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = CodecError;

    fn try_from(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0x0a => Ok(Command::Get),
            0x07 => Ok(Command::Set),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

/// Decoded payload of a single frame.
#[derive(Debug)]
pub enum FrameBody {
    Json(Value),
    Empty,
    Undecodable(CodecError),
}

#[derive(Debug, Clone)]
pub enum CodecError {
    CorruptFrame(String),
    UnknownCommand(u8),
    UnencodableValue(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::CorruptFrame(msg) => write!(f, "Corrupt frame: {msg}"),
            CodecError::UnknownCommand(byte) => write!(f, "Unknown command byte: {byte:#04x}"),
            CodecError::UnencodableValue(msg) => write!(f, "Unencodable value: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

// -- Cipher: AES-128-ECB payload envelope --

/// Per-device payload cipher: AES-128-ECB with the 16-byte local key,
/// Base64 transport encoding, and the v3.1 MD5 integrity tag.
#[derive(Clone)]
pub struct TuyaCipher {
    key: [u8; 16],
    version: String,
}

impl TuyaCipher {
    pub fn new(key: &str, version: &str) -> Result<Self, CodecError> {
        let bytes = key.as_bytes();
        if bytes.len() != 16 {
            return Err(CodecError::UnencodableValue(format!(
                "local key must be 16 bytes, got {}",
                bytes.len()
            )));
        }
        let mut k = [0u8; 16];
        k.copy_from_slice(bytes);
        Ok(Self {
            key: k,
            version: version.to_owned(),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Encrypt a JSON payload. Returns the Base64 ciphertext and the MD5 tag.
    pub fn encrypt(&self, payload: &Value) -> Result<(String, String), CodecError> {
        let mut buf =
            serde_json::to_vec(payload).map_err(|e| CodecError::UnencodableValue(e.to_string()))?;

        // Firmware quirk: pad only when unaligned. An already-aligned payload
        // gets no extra block, unlike canonical PKCS-7.
        let rem = buf.len() % AES_BLOCK_SIZE;
        if rem != 0 {
            let pad = (AES_BLOCK_SIZE - rem) as u8;
            buf.resize(buf.len() + pad as usize, pad);
        }

        let len = buf.len();
        let encrypted = Aes128EcbEnc::new(&self.key.into())
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .expect("buffer length is a multiple of the AES block size");

        let b64 = BASE64.encode(encrypted);
        let tag = self.md5_tag(&b64);
        Ok((b64, tag))
    }

    /// The middle 16 hex characters of md5("data=" || b64 || "||lpv=" || version || "||" || key).
    pub fn md5_tag(&self, b64: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(b"data=");
        hasher.update(b64.as_bytes());
        hasher.update(b"||lpv=");
        hasher.update(self.version.as_bytes());
        hasher.update(b"||");
        hasher.update(self.key);
        let digest = hex::encode(hasher.finalize());
        digest[8..24].to_string()
    }

    /// Decrypt a SET-style payload: version string and MD5 tag up front,
    /// then Base64 ciphertext.
    pub fn decrypt(&self, raw: &[u8]) -> Result<Value, CodecError> {
        let envelope = self.version.len() + MD5_TAG_SIZE;
        if raw.len() <= envelope {
            return Err(CodecError::CorruptFrame(
                "encrypted payload too short".to_owned(),
            ));
        }

        let mut buf = BASE64
            .decode(&raw[envelope..])
            .map_err(|e| CodecError::CorruptFrame(format!("bad base64: {e}")))?;

        if buf.is_empty() || buf.len() % AES_BLOCK_SIZE != 0 {
            return Err(CodecError::CorruptFrame(
                "ciphertext is not block-aligned".to_owned(),
            ));
        }

        let decrypted = Aes128EcbDec::new(&self.key.into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| CodecError::CorruptFrame("AES decryption failed".to_owned()))?;

        json_up_to_last_brace(decrypted)
    }
}

/// Parse the bytes up to and including the last `}`. Devices trail pad bytes
/// after the JSON text, so anything past the closing brace is discarded.
fn json_up_to_last_brace(data: &[u8]) -> Result<Value, CodecError> {
    let end = data
        .iter()
        .rposition(|&b| b == b'}')
        .ok_or_else(|| CodecError::CorruptFrame("no JSON object in payload".to_owned()))?;
    serde_json::from_slice(&data[..=end])
        .map_err(|e| CodecError::CorruptFrame(format!("bad JSON payload: {e}")))
}

// -- Frame codec --

/// Frame encoder/decoder. Announcement traffic uses a cipherless codec;
/// device sessions carry the per-device [`TuyaCipher`].
#[derive(Clone, Default)]
pub struct MessageCodec {
    cipher: Option<TuyaCipher>,
}

impl MessageCodec {
    pub fn new(cipher: TuyaCipher) -> Self {
        Self {
            cipher: Some(cipher),
        }
    }

    /// Codec for cleartext traffic (UDP announcements).
    pub fn plaintext() -> Self {
        Self { cipher: None }
    }

    pub fn cipher(&self) -> Option<&TuyaCipher> {
        self.cipher.as_ref()
    }

    /// Build a complete 55AA frame around an already-serialized payload.
    pub fn encode_raw(&self, command: Command, payload: &[u8]) -> Vec<u8> {
        // length counts everything after the length field
        let length = (RETCODE_SIZE + payload.len() + FOOTER_SIZE) as u32;

        let mut frame = Vec::with_capacity(HEADER_SIZE + length as usize);
        frame.extend_from_slice(&PREFIX);
        frame.extend_from_slice(&[0u8; 7]);
        frame.push(command.byte());
        frame.extend_from_slice(&length.to_be_bytes());
        // return code: meaningful only device -> host, zeroed outbound
        frame.extend_from_slice(&[0u8; RETCODE_SIZE]);
        frame.extend_from_slice(payload);
        // CRC is written as zeros; v3.1 firmware never checks it
        frame.extend_from_slice(&[0u8; CRC_SIZE]);
        frame.extend_from_slice(&SUFFIX);
        frame
    }

    /// GET frame: compact cleartext JSON.
    pub fn encode_get(&self, data: &Value) -> Result<Vec<u8>, CodecError> {
        let payload =
            serde_json::to_vec(data).map_err(|e| CodecError::UnencodableValue(e.to_string()))?;
        Ok(self.encode_raw(Command::Get, &payload))
    }

    /// SET frame: `version || md5_tag || base64(aes_ecb(json))`.
    pub fn encode_set(&self, data: &Value) -> Result<Vec<u8>, CodecError> {
        let cipher = self.cipher.as_ref().ok_or_else(|| {
            CodecError::UnencodableValue("SET frames require a cipher".to_owned())
        })?;
        let (b64, tag) = cipher.encrypt(data)?;

        let mut payload = Vec::with_capacity(cipher.version.len() + tag.len() + b64.len());
        payload.extend_from_slice(cipher.version.as_bytes());
        payload.extend_from_slice(tag.as_bytes());
        payload.extend_from_slice(b64.as_bytes());
        Ok(self.encode_raw(Command::Set, &payload))
    }

    /// Decode a buffer into `(return_code, body)` pairs. Devices concatenate
    /// frames into a single segment, so the declared length is used to
    /// re-slice and the excess is parsed as the next frame. An envelope
    /// mismatch yields a single `(999, Undecodable)` entry and stops.
    pub fn parse(&self, data: &[u8]) -> Vec<(u32, FrameBody)> {
        let mut results = Vec::new();
        let mut rest = data;

        loop {
            if rest.len() < HEADER_SIZE + FOOTER_SIZE {
                results.push((
                    CORRUPT_CODE,
                    FrameBody::Undecodable(CodecError::CorruptFrame(
                        "message too short".to_owned(),
                    )),
                ));
                break;
            }
            if rest[..4] != PREFIX {
                results.push((
                    CORRUPT_CODE,
                    FrameBody::Undecodable(CodecError::CorruptFrame("incorrect prefix".to_owned())),
                ));
                break;
            }

            let cmd = rest[11];
            let declared =
                u32::from_be_bytes([rest[12], rest[13], rest[14], rest[15]]) as usize;
            let total = HEADER_SIZE + declared;

            if total < HEADER_SIZE + RETCODE_SIZE + FOOTER_SIZE || total > rest.len() {
                results.push((
                    CORRUPT_CODE,
                    FrameBody::Undecodable(CodecError::CorruptFrame(format!(
                        "declared length {declared} does not fit buffer of {}",
                        rest.len()
                    ))),
                ));
                break;
            }

            let frame = &rest[..total];
            rest = &rest[total..];

            if frame[total - SUFFIX_SIZE..] != SUFFIX {
                results.push((
                    CORRUPT_CODE,
                    FrameBody::Undecodable(CodecError::CorruptFrame("incorrect suffix".to_owned())),
                ));
                break;
            }

            let inner = &frame[HEADER_SIZE..total - FOOTER_SIZE];
            let code = u32::from_be_bytes([inner[0], inner[1], inner[2], inner[3]]);

            // Strip the left 0x00 padding of the payload region.
            let mut body = &inner[RETCODE_SIZE..];
            while let [0x00, tail @ ..] = body {
                body = tail;
            }

            if body.is_empty() {
                results.push((code, FrameBody::Empty));
            } else {
                // GET responses travel in the clear even on ciphered sessions
                let decoded = match &self.cipher {
                    Some(cipher) if cmd != Command::Get.byte() => cipher.decrypt(body),
                    _ => json_up_to_last_brace(body),
                };
                results.push((code, decoded.map_or_else(FrameBody::Undecodable, FrameBody::Json)));
            }

            if rest.is_empty() {
                break;
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "0123456789abcdef";

    fn codec() -> MessageCodec {
        MessageCodec::new(TuyaCipher::new(KEY, "3.1").unwrap())
    }

    #[test]
    fn cipher_rejects_short_key() {
        assert!(TuyaCipher::new("tooshort", "3.1").is_err());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = TuyaCipher::new(KEY, "3.1").unwrap();
        let payload = json!({"devId": "abc", "dps": {"1": true}});

        let (b64, tag) = cipher.encrypt(&payload).unwrap();
        assert_eq!(tag.len(), 16);
        assert!(tag.bytes().all(|b| b.is_ascii_hexdigit()));

        let mut raw = Vec::new();
        raw.extend_from_slice(b"3.1");
        raw.extend_from_slice(tag.as_bytes());
        raw.extend_from_slice(b64.as_bytes());

        assert_eq!(cipher.decrypt(&raw).unwrap(), payload);
    }

    #[test]
    fn aligned_payload_gets_no_padding() {
        // 16 bytes of JSON encrypt to exactly one block
        let cipher = TuyaCipher::new(KEY, "3.1").unwrap();
        let payload = json!({"ab": "0123456"});
        assert_eq!(serde_json::to_vec(&payload).unwrap().len(), 16);

        let (b64, _) = cipher.encrypt(&payload).unwrap();
        assert_eq!(BASE64.decode(&b64).unwrap().len(), 16);
    }

    #[test]
    fn set_frame_roundtrip() {
        let codec = codec();
        let payload = json!({"devId": "abc", "uid": "", "t": "1700000000", "dps": {"1": false}});

        let frame = codec.encode_set(&payload).unwrap();
        let parsed = codec.parse(&frame);

        assert_eq!(parsed.len(), 1);
        let (code, body) = &parsed[0];
        assert_eq!(*code, 0);
        match body {
            FrameBody::Json(v) => assert_eq!(*v, payload),
            other => panic!("expected JSON body, got {other:?}"),
        }
    }

    #[test]
    fn get_frame_roundtrip() {
        let codec = codec();
        let payload = json!({"devId": "abc", "gwId": "abc"});

        let frame = codec.encode_get(&payload).unwrap();
        let parsed = codec.parse(&frame);

        assert_eq!(parsed.len(), 1);
        match &parsed[0] {
            (0, FrameBody::Json(v)) => assert_eq!(*v, payload),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn concatenated_frames_decode_in_order() {
        let codec = codec();
        let a = json!({"dps": {"1": true}});
        let b = json!({"dps": {"1": false}});

        let mut buffer = codec.encode_set(&a).unwrap();
        buffer.extend_from_slice(&codec.encode_set(&b).unwrap());

        let parsed = codec.parse(&buffer);
        assert_eq!(parsed.len(), 2);
        match (&parsed[0], &parsed[1]) {
            ((0, FrameBody::Json(x)), (0, FrameBody::Json(y))) => {
                assert_eq!(*x, a);
                assert_eq!(*y, b);
            }
            other => panic!("unexpected results {other:?}"),
        }
    }

    #[test]
    fn corrupt_prefix_stops_parsing() {
        let codec = codec();
        let mut buffer = codec.encode_get(&json!({"gwId": "abc"})).unwrap();
        buffer.extend_from_slice(&codec.encode_get(&json!({"gwId": "def"})).unwrap());
        buffer[0] = 0xff;

        let parsed = codec.parse(&buffer);
        assert_eq!(parsed.len(), 1);
        match &parsed[0] {
            (code, FrameBody::Undecodable(CodecError::CorruptFrame(_))) => {
                assert_eq!(*code, CORRUPT_CODE)
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn empty_payload_keeps_return_code() {
        let codec = codec();
        let mut frame = codec.encode_raw(Command::Get, b"");
        // patch a device-style non-zero return code into the frame
        frame[HEADER_SIZE + RETCODE_SIZE - 1] = 0x01;

        let parsed = codec.parse(&frame);
        assert_eq!(parsed.len(), 1);
        assert!(matches!(parsed[0], (1, FrameBody::Empty)));
    }

    #[test]
    fn leading_zeros_are_stripped_before_json() {
        let codec = MessageCodec::plaintext();
        let mut payload = vec![0u8; 5];
        payload.extend_from_slice(br#"{"gwId":"abc","ip":"10.0.0.5"}"#);

        let frame = codec.encode_raw(Command::Get, &payload);
        let parsed = codec.parse(&frame);
        assert_eq!(parsed.len(), 1);
        match &parsed[0] {
            (0, FrameBody::Json(v)) => assert_eq!(v["gwId"], "abc"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn announcement_parses_without_cipher() {
        let codec = MessageCodec::plaintext();
        let ann = json!({"gwId": "abc", "ip": "10.0.0.5", "version": "3.1"});

        let frame = codec.encode_get(&ann).unwrap();
        let parsed = codec.parse(&frame);
        match &parsed[0] {
            (0, FrameBody::Json(v)) => assert_eq!(*v, ann),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn trailing_garbage_after_json_is_discarded() {
        let cipher = TuyaCipher::new(KEY, "3.1").unwrap();
        // unaligned payload gains pad bytes past the closing brace
        let payload = json!({"devId": "abcdefgh"});
        let (b64, tag) = cipher.encrypt(&payload).unwrap();

        let mut raw = Vec::new();
        raw.extend_from_slice(b"3.1");
        raw.extend_from_slice(tag.as_bytes());
        raw.extend_from_slice(b64.as_bytes());
        assert_eq!(cipher.decrypt(&raw).unwrap(), payload);
    }

    #[test]
    fn unknown_command_byte_is_rejected() {
        assert!(matches!(
            Command::try_from(0x12),
            Err(CodecError::UnknownCommand(0x12))
        ));
        assert_eq!(Command::try_from(0x0a).unwrap(), Command::Get);
        assert_eq!(Command::try_from(0x07).unwrap(), Command::Set);
    }
}
