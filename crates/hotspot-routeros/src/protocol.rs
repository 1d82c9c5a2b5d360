// RouterOS API wire codec
//
// A sentence is a sequence of words terminated by a zero-length word.
// Each word is prefixed by a variable-length (1-5 byte) length header.
// Replies start with `!re`, `!done`, `!trap` or `!fatal`, followed by
// `=key=value` attribute words and an optional `.tag=` word.

use std::collections::BTreeMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Words larger than this are treated as a framing error.
const MAX_WORD_LEN: usize = 16 * 1024 * 1024;

// ── Length header ───────────────────────────────────────────────────

/// Encode a word length into its RouterOS length header.
pub fn encode_length(len: usize) -> Vec<u8> {
    let Ok(len) = u32::try_from(len) else {
        return vec![0xF0, 0xFF, 0xFF, 0xFF, 0xFF];
    };
    let bytes = len.to_be_bytes();
    match len {
        0..0x80 => vec![bytes[3]],
        0x80..0x4000 => {
            let v = (len | 0x8000).to_be_bytes();
            vec![v[2], v[3]]
        }
        0x4000..0x20_0000 => {
            let v = (len | 0x00C0_0000).to_be_bytes();
            vec![v[1], v[2], v[3]]
        }
        0x20_0000..0x1000_0000 => (len | 0xE000_0000).to_be_bytes().to_vec(),
        _ => vec![0xF0, bytes[0], bytes[1], bytes[2], bytes[3]],
    }
}

async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, Error> {
    let first = reader.read_u8().await?;
    let (extra, initial) = match first {
        b if b & 0x80 == 0x00 => (0, u32::from(b)),
        b if b & 0xC0 == 0x80 => (1, u32::from(b & 0x3F)),
        b if b & 0xE0 == 0xC0 => (2, u32::from(b & 0x1F)),
        b if b & 0xF0 == 0xE0 => (3, u32::from(b & 0x0F)),
        0xF0 => (4, 0),
        other => {
            return Err(Error::Protocol(format!(
                "unexpected control byte 0x{other:02X} in length header"
            )));
        }
    };

    let mut len = initial;
    for _ in 0..extra {
        len = (len << 8) | u32::from(reader.read_u8().await?);
    }
    usize::try_from(len).map_err(|_| Error::Protocol(format!("word length {len} overflows")))
}

// ── Words & sentences ───────────────────────────────────────────────

/// Serialize a sentence (words + terminating empty word).
pub fn encode_sentence<S: AsRef<str>>(words: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for word in words {
        let bytes = word.as_ref().as_bytes();
        out.extend_from_slice(&encode_length(bytes.len()));
        out.extend_from_slice(bytes);
    }
    out.push(0);
    out
}

pub async fn write_sentence<W, S>(writer: &mut W, words: &[S]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    writer.write_all(&encode_sentence(words)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one word; `None` marks the end of a sentence.
pub async fn read_word<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<String>, Error> {
    let len = read_length(reader).await?;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_WORD_LEN {
        return Err(Error::Protocol(format!("word of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

pub async fn read_sentence<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<String>, Error> {
    let mut words = Vec::new();
    while let Some(word) = read_word(reader).await? {
        words.push(word);
    }
    Ok(words)
}

// ── Replies ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Re,
    Done,
    Trap,
    Fatal,
}

/// A parsed reply sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub attributes: BTreeMap<String, String>,
    pub tag: Option<String>,
    /// Free-form words (e.g. the reason following `!fatal`).
    pub message: Option<String>,
}

impl Reply {
    pub fn parse(words: Vec<String>) -> Result<Self, Error> {
        let mut iter = words.into_iter();
        let kind = match iter.next().as_deref() {
            Some("!re") => ReplyKind::Re,
            Some("!done") => ReplyKind::Done,
            Some("!trap") => ReplyKind::Trap,
            Some("!fatal") => ReplyKind::Fatal,
            Some(other) => {
                return Err(Error::Protocol(format!("unexpected reply word '{other}'")));
            }
            None => return Err(Error::Protocol("empty reply sentence".into())),
        };

        let mut attributes = BTreeMap::new();
        let mut tag = None;
        let mut message = None;
        for word in iter {
            if let Some(rest) = word.strip_prefix('=') {
                let (key, value) = rest.split_once('=').unwrap_or((rest, ""));
                attributes.insert(key.to_owned(), value.to_owned());
            } else if let Some(t) = word.strip_prefix(".tag=") {
                tag = Some(t.to_owned());
            } else {
                message = Some(word);
            }
        }

        Ok(Self {
            kind,
            attributes,
            tag,
            message,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn length_header_boundaries() {
        assert_eq!(encode_length(0), vec![0x00]);
        assert_eq!(encode_length(0x7F), vec![0x7F]);
        assert_eq!(encode_length(0x80), vec![0x80, 0x80]);
        assert_eq!(encode_length(0x3FFF), vec![0xBF, 0xFF]);
        assert_eq!(encode_length(0x4000), vec![0xC0, 0x40, 0x00]);
        assert_eq!(encode_length(0x20_0000), vec![0xE0, 0x20, 0x00, 0x00]);
        assert_eq!(encode_length(0x1000_0000), vec![0xF0, 0x10, 0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn reads_multi_byte_lengths() {
        for len in [1usize, 0x80, 0x3FFF, 0x4000, 0x20_0001] {
            let header = encode_length(len);
            let mut cursor = std::io::Cursor::new(header);
            assert_eq!(read_length(&mut cursor).await.unwrap(), len);
        }
    }

    #[tokio::test]
    async fn sentence_reads_until_empty_word() {
        let bytes = encode_sentence(&["!re", "=.id=*1", "=comment=a=b"]);
        let mut cursor = std::io::Cursor::new(bytes);
        let words = read_sentence(&mut cursor).await.unwrap();
        assert_eq!(words, vec!["!re", "=.id=*1", "=comment=a=b"]);
    }

    #[test]
    fn reply_attributes_keep_embedded_equals() {
        let reply = Reply::parse(vec![
            "!re".into(),
            "=.id=*1A".into(),
            "=comment=authorized|user=0812=x".into(),
            ".tag=7".into(),
        ])
        .unwrap();
        assert_eq!(reply.kind, ReplyKind::Re);
        assert_eq!(reply.attributes["comment"], "authorized|user=0812=x");
        assert_eq!(reply.attributes[".id"], "*1A");
        assert_eq!(reply.tag.as_deref(), Some("7"));
    }

    #[test]
    fn fatal_carries_message() {
        let reply = Reply::parse(vec!["!fatal".into(), "session terminated".into()]).unwrap();
        assert_eq!(reply.kind, ReplyKind::Fatal);
        assert_eq!(reply.message.as_deref(), Some("session terminated"));
    }

    #[test]
    fn unknown_reply_is_protocol_error() {
        let err = Reply::parse(vec!["!weird".into()]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
