use std::marker::PhantomData;

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use tokio_util::codec::Decoder;

use crate::error::Error;

/// The largest incomplete JSON value we are willing to buffer.
pub(crate) const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Decodes a stream of JSON values.
///
/// Values may follow each other without any separator,
/// and may be split across reads.
///
/// Objects and arrays are only parsed once their closing bracket is in,
/// and bytes already scanned are not scanned again when more arrive.
#[derive(Debug)]
pub(crate) struct JsonCodec<T> {
    scan: Scan,
    _item: PhantomData<fn() -> T>,
}

/// How far into an incomplete object or array we have looked.
#[derive(Debug, Default, Clone, Copy)]
struct Scan {
    offset: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scan {
    /// The length of the object or array starting `src`, if it is complete.
    fn complete_len(&mut self, src: &[u8]) -> Option<usize> {
        for (i, &byte) in src.iter().enumerate().skip(self.offset) {
            if self.in_string {
                match byte {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        *self = Scan::default();
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }

        self.offset = src.len();
        None
    }
}

impl<T> JsonCodec<T> {
    pub(crate) fn new() -> Self {
        Self {
            scan: Scan::default(),
            _item: PhantomData,
        }
    }
}

fn too_large() -> Error {
    Error::Decode(format!("message exceeds {MAX_MESSAGE_BYTES} bytes"))
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.scan.offset == 0 {
            let whitespace = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
            src.advance(whitespace);
        }

        let Some(&first) = src.first() else {
            return Ok(None);
        };

        if matches!(first, b'{' | b'[') {
            let Some(len) = self.scan.complete_len(src) else {
                return if src.len() > MAX_MESSAGE_BYTES {
                    Err(too_large())
                } else {
                    Ok(None)
                };
            };

            let value = serde_json::from_slice(&src[..len])
                .map_err(|e| Error::Decode(e.to_string()))?;
            src.advance(len);
            return Ok(Some(value));
        }

        // Anything else is not something a tool should send, let the parser say why.
        let (next, consumed) = {
            let mut values = serde_json::Deserializer::from_slice(src).into_iter::<T>();
            let next = values.next();
            (next, values.byte_offset())
        };

        match next {
            Some(Ok(value)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > MAX_MESSAGE_BYTES {
                    Err(too_large())
                } else {
                    Ok(None)
                }
            }
            Some(Err(e)) => Err(Error::Decode(e.to_string())),
            None => Ok(None),
        }
    }
}
