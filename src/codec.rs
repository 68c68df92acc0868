//! Boundary contract consumed from the HTTP/1 wire codec.
//!
//! The codec itself (header parsing, chunked encoding, etc.) lives outside this crate; the pool
//! only drives it through [`CodecClient`] and receives decoded events through
//! [`ResponseDecoder`].

use bytes::Bytes;

use crate::error::Result;

/// The HTTP version a codec client is speaking, as observed from the response.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum HttpProtocol {
    Http10,
    Http11,
    /// Not an HTTP protocol at all (the TCP tunnel specialization).
    Invalid,
}

impl HttpProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
            Self::Invalid => "",
        }
    }
}

/// Receives decoded response events for one stream. Implemented by the stream wrapper.
///
/// Not `Send`, for the same reason as [`crate::transport::ClientConnection`]: everything reachable
/// from a pool is pinned to the single thread driving its dispatcher.
pub trait ResponseDecoder {
    /// Called once the response headers are available.
    fn decode_headers(&mut self, headers: &http::HeaderMap, end_stream: bool);

    /// Called with a chunk of response body.
    fn decode_data(&mut self, data: Bytes, end_stream: bool);

    /// Called when the codec resets the stream instead of completing it normally.
    fn on_reset_stream(&mut self, reason: &str, detail: &str);
}

/// Encodes one outbound request. Returned by [`CodecClient::new_stream`].
pub trait RequestEncoder {
    fn encode_headers(&mut self, headers: &http::HeaderMap, end_stream: bool) -> Result<()>;
    fn encode_data(&mut self, data: Bytes, end_stream: bool) -> Result<()>;
}

/// One HTTP/1 connection's codec, exclusively owned by the `Http1Client` that created it.
pub trait CodecClient {
    /// Starts a new request/response exchange. HTTP/1 allows exactly one live exchange per
    /// codec client at a time; calling this while one is already in flight is a caller error.
    fn new_stream(&mut self, response_decoder: Box<dyn ResponseDecoder>) -> Box<dyn RequestEncoder>;

    /// The protocol version negotiated or observed so far.
    fn protocol(&self) -> HttpProtocol;

    /// Feeds raw bytes read off the connection to the codec for parsing.
    fn dispatch(&mut self, data: Bytes) -> Result<()>;

    /// Closes the codec client and its underlying connection.
    fn close(&mut self);

    /// Whether the codec observed the peer close the connection.
    fn remote_closed(&self) -> bool;
}
