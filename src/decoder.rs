//! Incremental UTF-8 decoding of received chunks.
//!
//! Reads arrive at arbitrary byte boundaries, so a multi-byte character can
//! be split between two chunks. The decoder holds back an incomplete trailing
//! sequence (at most 3 bytes) and prepends it to the next chunk. Bytes that
//! can never form valid UTF-8 are handled according to [`DecodePolicy`].

use crate::error::DecodeError;
use bytes::BytesMut;
use serde::Deserialize;

/// What to do with invalid UTF-8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DecodePolicy {
    /// Reject the chunk and end the connection.
    #[default]
    Strict,
    /// Substitute U+FFFD for each invalid sequence and keep going.
    Lossy,
}

/// Stateful decoder for one connection.
#[derive(Debug)]
pub struct Utf8Decoder {
    policy: DecodePolicy,
    pending: BytesMut,
    /// Stream offset of the first byte in `pending`.
    offset: u64,
}

impl Utf8Decoder {
    pub fn new(policy: DecodePolicy) -> Self {
        Self {
            policy,
            pending: BytesMut::with_capacity(4),
            offset: 0,
        }
    }

    /// Decode the next chunk of the stream.
    ///
    /// Returns the text that is complete so far, which may be empty if the
    /// chunk only carried the start of a character.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<String, DecodeError> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut input = &buf[..];
        let mut consumed = 0usize;

        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    consumed += input.len();
                    input = &[];
                    break;
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    consumed += valid.len();

                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            input = rest;
                            break;
                        }
                        Some(len) => match self.policy {
                            DecodePolicy::Strict => {
                                return Err(DecodeError::Invalid {
                                    offset: self.offset + consumed as u64,
                                    byte: rest[0],
                                });
                            }
                            DecodePolicy::Lossy => {
                                out.push(char::REPLACEMENT_CHARACTER);
                                consumed += len;
                                input = &rest[len..];
                            }
                        },
                    }
                }
            }
        }

        self.offset += consumed as u64;
        self.pending = BytesMut::from(input);
        Ok(out)
    }

    /// Flush the decoder at end of stream.
    pub fn finish(&mut self) -> Result<String, DecodeError> {
        if self.pending.is_empty() {
            return Ok(String::new());
        }

        let pending = self.pending.len();
        self.offset += pending as u64;
        self.pending.clear();

        match self.policy {
            DecodePolicy::Strict => Err(DecodeError::Truncated { pending }),
            DecodePolicy::Lossy => Ok(char::REPLACEMENT_CHARACTER.to_string()),
        }
    }

    /// Number of bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
