use bytes::Bytes;
use std::io::{Cursor, Read};

use super::error::RelayError;

/// The inbound request body captured once; every upstream attempt gets its
/// own fresh reader over the same bytes.
#[derive(Debug, Clone, Default)]
pub(crate) struct RewindableBody {
    bytes: Bytes,
}

impl RewindableBody {
    pub(crate) fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Reads the client body to the end, failing with 413 past `max_bytes`.
    pub(crate) fn capture<R: Read + ?Sized>(
        reader: &mut R,
        max_bytes: usize,
    ) -> Result<Self, RelayError> {
        let mut body = Vec::new();
        let mut chunk = [0_u8; 8192];
        loop {
            let read = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(RelayError::Local {
                        status: 400,
                        code: "read_request_body_failed".to_string(),
                        message: format!("read request body failed: {err}"),
                    })
                }
            };
            body.extend_from_slice(&chunk[..read]);
            if body.len() > max_bytes {
                return Err(RelayError::Local {
                    status: 413,
                    code: "request_body_too_large".to_string(),
                    message: format!("request body too large: content-length>{max_bytes}"),
                });
            }
        }
        Ok(Self::from_bytes(body))
    }

    pub(crate) fn view(&self) -> Cursor<Bytes> {
        Cursor::new(self.bytes.clone())
    }

    pub(crate) fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
