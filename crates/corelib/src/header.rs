//! Per-call frame header.

use serde::{Deserialize, Serialize};

/// Header preceding every request and response body on the wire.
///
/// One header travels in each direction per call. `error` is empty on
/// requests and on successful replies; a non-empty value marks the reply
/// as failed and its body as a placeholder to be discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Target in the form `"Service.Method"`.
    pub service_method: String,
    /// Sequence number chosen by the client.
    pub seq: u64,
    pub error: String,
}

impl Header {
    /// Header for an outgoing request.
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// True if the header signals an application or dispatch error.
    #[inline]
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Turn a request header into the matching error reply.
    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = error.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_has_no_error() {
        let h = Header::request("Arith.Multiply", 7);
        assert_eq!(h.seq, 7);
        assert!(!h.is_error());
    }

    #[test]
    fn test_json_field_names() {
        let h = Header::request("Arith.Multiply", 1).with_error("boom");
        let text = serde_json::to_string(&h).unwrap();
        assert_eq!(
            text,
            r#"{"serviceMethod":"Arith.Multiply","seq":1,"error":"boom"}"#
        );
    }
}
