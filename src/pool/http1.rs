//! HTTP/1 specialization: one stream per connection, `Connection: close` / HTTP/1.0 detection,
//! and the factory glue (`FixedHttpPool`) that binds a codec factory to [`PoolCore`].

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{CodecClient, HttpProtocol, RequestEncoder, ResponseDecoder};
use crate::dispatcher::Dispatcher;
use crate::error::{PoolFailureReason, Result};
use crate::host::{Host, HostDescription, HostId, Priority};
use crate::options::ConnectionPoolOptions;
use crate::transport::{ClientConnection, ReadFilter};

use super::client::{ActiveClientBase, ClientListKind};
use super::core::{ActiveClientOps, ClientId, ClientLifecycle, DrainBehavior, PoolCore};
use super::pending::CancelHandle;
use super::{ConnectionPool, HttpConnectionPool};

/// Builds the codec client for a freshly connected transport connection. HTTP/1 framing,
/// chunked encoding, and header parsing all live on the other side of this boundary.
pub trait Http1CodecFactory {
    fn new_codec_client(&self, connection: &mut dyn ClientConnection) -> Box<dyn CodecClient>;
}

/// The outcome of one `new_stream` call, delivered to whatever owns the attach context.
pub trait Http1PoolCallbacks {
    /// The stream was attached; `encoder` writes the request and `protocol` is the connection's
    /// negotiated HTTP version.
    fn on_pool_ready(
        &mut self,
        encoder: Box<dyn RequestEncoder>,
        host_description: Arc<dyn HostDescription>,
        protocol: HttpProtocol,
    );

    /// The stream could not be attached.
    fn on_pool_failure(&mut self, reason: PoolFailureReason, host_description: Arc<dyn HostDescription>);
}

/// The attach context for one HTTP/1 `new_stream` call: an opaque pair carried through
/// [`PoolCore`] unchanged.
pub struct Http1Context {
    pub response_decoder: Box<dyn ResponseDecoder>,
    pub callbacks: Box<dyn Http1PoolCallbacks>,
}

/// Whether a response should end the connection: HTTP/1.0 has no persistent-connection default,
/// and `Connection: close` opts out explicitly regardless of version.
fn should_close_after_response(protocol: HttpProtocol, headers: &http::HeaderMap) -> bool {
    if protocol == HttpProtocol::Http10 {
        return true;
    }
    headers
        .get(http::header::CONNECTION)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"close"))
        .unwrap_or(false)
}

/// Shared state between a stream's response-decoder and request-encoder halves: each direction
/// completing independently needs to observe the other's completion before the exchange as a
/// whole can be considered finished. See §4.6 "StreamWrapper semantics".
struct StreamWrapperShared {
    pool: Weak<RefCell<PoolCore<Http1Ops>>>,
    id: ClientId<Http1Ops>,
    decode_complete: bool,
    encode_complete: bool,
    close_connection: bool,
}

impl StreamWrapperShared {
    fn with_codec<R>(&self, f: impl FnOnce(&mut dyn CodecClient) -> R) -> Option<R> {
        let pool = self.pool.upgrade()?;
        let mut pool = pool.borrow_mut();
        let client = pool.client_mut(self.id)?;
        Some(f(&mut *client.codec))
    }

    fn on_decode_complete(&mut self) {
        self.decode_complete = true;
        if !self.encode_complete {
            // A response arrived before its request finished encoding: a protocol error.
            self.with_codec(|codec| codec.close());
            return;
        }
        let remote_closed = self.with_codec(|codec| codec.remote_closed()).unwrap_or(true);
        if self.close_connection || remote_closed {
            self.with_codec(|codec| codec.close());
            return;
        }
        let Some(pool_rc) = self.pool.upgrade() else {
            return;
        };
        {
            let mut pool = pool_rc.borrow_mut();
            if let Some(client) = pool.client_mut(self.id) {
                client.stream_wrapper = None;
            }
            pool.on_stream_closed(self.id, true);
            pool.schedule_on_upstream_ready();
            pool.idle_close_sweep();
        }
    }
}

struct ResponseDecoderWrapper {
    shared: Rc<RefCell<StreamWrapperShared>>,
    inner: Box<dyn ResponseDecoder>,
}

impl ResponseDecoder for ResponseDecoderWrapper {
    fn decode_headers(&mut self, headers: &http::HeaderMap, end_stream: bool) {
        let protocol = self
            .shared
            .borrow()
            .with_codec(|codec| codec.protocol())
            .unwrap_or(HttpProtocol::Http11);
        if should_close_after_response(protocol, headers) {
            self.shared.borrow_mut().close_connection = true;
        }
        self.inner.decode_headers(headers, end_stream);
        if end_stream {
            self.shared.borrow_mut().on_decode_complete();
        }
    }

    fn decode_data(&mut self, data: Bytes, end_stream: bool) {
        self.inner.decode_data(data, end_stream);
        if end_stream {
            self.shared.borrow_mut().on_decode_complete();
        }
    }

    fn on_reset_stream(&mut self, reason: &str, detail: &str) {
        self.inner.on_reset_stream(reason, detail);
        self.shared.borrow().with_codec(|codec| codec.close());
    }
}

struct RequestEncoderWrapper {
    shared: Rc<RefCell<StreamWrapperShared>>,
    inner: Box<dyn RequestEncoder>,
}

impl RequestEncoder for RequestEncoderWrapper {
    fn encode_headers(&mut self, headers: &http::HeaderMap, end_stream: bool) -> Result<()> {
        self.inner.encode_headers(headers, end_stream)?;
        if end_stream {
            self.shared.borrow_mut().encode_complete = true;
        }
        Ok(())
    }

    fn encode_data(&mut self, data: Bytes, end_stream: bool) -> Result<()> {
        self.inner.encode_data(data, end_stream)?;
        if end_stream {
            self.shared.borrow_mut().encode_complete = true;
        }
        Ok(())
    }
}

/// One HTTP/1 connection's active request/response exchange. Exists from `new_stream_encoder`
/// until both directions complete (or the codec is closed out from under it).
struct StreamWrapper {
    shared: Rc<RefCell<StreamWrapperShared>>,
}

/// An HTTP/1 upstream connection: one stream at a time, no early data.
pub struct Http1Client {
    base: ActiveClientBase,
    codec: Box<dyn CodecClient>,
    dispatcher: Rc<dyn Dispatcher>,
    stream_wrapper: Option<StreamWrapper>,
    self_pool: Weak<RefCell<PoolCore<Http1Ops>>>,
    self_id: Option<ClientId<Http1Ops>>,
}

impl Http1Client {
    /// `closing_with_incomplete_stream ≡ stream_wrapper.is_some() && !decode_complete`, §4.6.
    pub fn closing_with_incomplete_stream(&self) -> bool {
        self.stream_wrapper
            .as_ref()
            .map(|w| !w.shared.borrow().decode_complete)
            .unwrap_or(false)
    }

    fn new_stream_encoder(&mut self, response_decoder: Box<dyn ResponseDecoder>) -> Box<dyn RequestEncoder> {
        let id = self.self_id.expect("client has an id by the time a stream attaches");
        let shared = Rc::new(RefCell::new(StreamWrapperShared {
            pool: self.self_pool.clone(),
            id,
            decode_complete: false,
            encode_complete: false,
            close_connection: false,
        }));
        let decoder = Box::new(ResponseDecoderWrapper {
            shared: shared.clone(),
            inner: response_decoder,
        });
        let encoder = self.codec.new_stream(decoder);
        self.stream_wrapper = Some(StreamWrapper { shared: shared.clone() });
        Box::new(RequestEncoderWrapper { shared, inner: encoder })
    }
}

impl ClientLifecycle for Http1Client {
    fn base(&self) -> &ActiveClientBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActiveClientBase {
        &mut self.base
    }

    fn supports_early_data(&self) -> bool {
        false
    }

    fn num_active_streams(&self) -> u32 {
        if self.stream_wrapper.is_some() {
            1
        } else {
            0
        }
    }

    fn release_resources(&mut self) {
        if self.base.release_resources_once() {
            self.codec.close();
            if let Some(wrapper) = self.stream_wrapper.take() {
                self.dispatcher.deferred_delete(Box::new(wrapper));
            }
        }
    }
}

/// Binds an [`Http1CodecFactory`] to [`PoolCore`] via [`ActiveClientOps`].
pub struct Http1Ops {
    codec_factory: Box<dyn Http1CodecFactory>,
}

impl Http1Ops {
    pub fn new(codec_factory: Box<dyn Http1CodecFactory>) -> Self {
        Self { codec_factory }
    }
}

impl ActiveClientOps for Http1Ops {
    type Client = Http1Client;
    type Context = Http1Context;

    fn instantiate_active_client(
        &mut self,
        host: &dyn Host,
        dispatcher: &Rc<dyn Dispatcher>,
    ) -> Result<(Self::Client, Arc<dyn HostDescription>)> {
        let (mut connection, host_description) = host.create_connection(dispatcher.as_ref())?;
        let codec = self.codec_factory.new_codec_client(&mut *connection);
        let lifetime_stream_limit = host_description.cluster().max_requests_per_connection();
        let base = ActiveClientBase::new(host_description.clone(), connection, lifetime_stream_limit, 1);
        Ok((
            Http1Client {
                base,
                codec,
                dispatcher: dispatcher.clone(),
                stream_wrapper: None,
                self_pool: Weak::new(),
                self_id: None,
            },
            host_description,
        ))
    }

    fn on_pool_ready(&mut self, client: &mut Self::Client, mut context: Self::Context) {
        let protocol = client.codec.protocol();
        let encoder = client.new_stream_encoder(context.response_decoder);
        context
            .callbacks
            .on_pool_ready(encoder, client.base.real_host_description.clone(), protocol);
    }

    fn on_pool_failure(
        &mut self,
        host_description: Arc<dyn HostDescription>,
        reason: PoolFailureReason,
        mut context: Self::Context,
    ) {
        context.callbacks.on_pool_failure(reason, host_description);
    }

    fn on_connected(&mut self, _client: &mut Self::Client) {}

    fn on_connect_failed(&mut self, _client: &mut Self::Client) {}

    fn on_client_instantiated(
        &mut self,
        client: &mut Self::Client,
        pool: Weak<RefCell<PoolCore<Self>>>,
        id: ClientId<Self>,
    ) {
        client.self_pool = pool.clone();
        client.self_id = Some(id);
        client
            .base_mut()
            .connection
            .add_read_filter(Box::new(Http1ReadFilter { pool, id }));
    }
}

/// Feeds raw bytes read off the transport connection to the codec client, keyed to `(pool, id)`
/// the same way [`super::core::ConnectionEventSink`] resolves connection events.
struct Http1ReadFilter {
    pool: Weak<RefCell<PoolCore<Http1Ops>>>,
    id: ClientId<Http1Ops>,
}

impl ReadFilter for Http1ReadFilter {
    fn on_data(&mut self, data: Bytes, _end_stream: bool) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let mut pool = pool.borrow_mut();
        let Some(client) = pool.client_mut(self.id) else {
            return;
        };
        if client.codec.dispatch(data).is_err() {
            client.codec.close();
        }
    }
}

/// Router-facing HTTP/1 pool: factory glue binding a codec factory to [`PoolCore`].
pub struct FixedHttpPool {
    core: Rc<RefCell<PoolCore<Http1Ops>>>,
}

impl FixedHttpPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        codec_factory: Box<dyn Http1CodecFactory>,
        host: Arc<dyn Host>,
        host_description: Arc<dyn HostDescription>,
        host_id: HostId,
        priority: Priority,
        dispatcher: Rc<dyn Dispatcher>,
        options: ConnectionPoolOptions,
    ) -> Self {
        let core = super::core::new_pool(
            Http1Ops::new(codec_factory),
            host,
            host_description,
            host_id,
            priority,
            dispatcher,
            options,
        );
        Self { core }
    }
}

impl ConnectionPool for FixedHttpPool {
    fn add_idle_callback(&self, cb: Box<dyn FnOnce()>) {
        self.core.borrow_mut().add_idle_callback(cb);
    }

    fn is_idle(&self) -> bool {
        self.core.borrow().is_idle()
    }

    fn drain_connections(&self, behavior: DrainBehavior) {
        self.core.borrow_mut().drain_connections(behavior);
    }

    fn host(&self) -> Arc<dyn HostDescription> {
        self.core.borrow().host_description().clone()
    }

    fn maybe_preconnect(&self, ratio: f32) -> bool {
        self.core.borrow_mut().maybe_preconnect(ratio)
    }
}

impl HttpConnectionPool for FixedHttpPool {
    fn new_stream(&self, context: Http1Context, can_send_early_data: bool) -> Option<CancelHandle> {
        self.core.borrow_mut().new_stream(context, can_send_early_data)
    }

    fn has_active_connections(&self) -> bool {
        let core = self.core.borrow();
        !core.list(ClientListKind::Ready).is_empty()
            || !core.list(ClientListKind::EarlyData).is_empty()
            || !core.list(ClientListKind::BusyOrDraining).is_empty()
    }

    fn protocol_description(&self) -> &'static str {
        "HTTP/1.1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http10_always_closes() {
        let headers = http::HeaderMap::new();
        assert!(should_close_after_response(HttpProtocol::Http10, &headers));
    }

    #[test]
    fn http11_keeps_alive_by_default() {
        let headers = http::HeaderMap::new();
        assert!(!should_close_after_response(HttpProtocol::Http11, &headers));
    }

    #[test]
    fn connection_close_header_closes_http11() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONNECTION, "close".parse().unwrap());
        assert!(should_close_after_response(HttpProtocol::Http11, &headers));
    }

    #[test]
    fn connection_close_header_is_case_insensitive() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONNECTION, "Close".parse().unwrap());
        assert!(should_close_after_response(HttpProtocol::Http11, &headers));
    }

    #[test]
    fn keep_alive_header_does_not_close_http11() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONNECTION, "keep-alive".parse().unwrap());
        assert!(!should_close_after_response(HttpProtocol::Http11, &headers));
    }
}
