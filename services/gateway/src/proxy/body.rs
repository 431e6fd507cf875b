//! Body types used on both legs of the proxy.
//!
//! Bodies are never buffered: the inbound request body is boxed and handed to
//! the backend connection as-is, and the backend response body is wrapped in a
//! [`ReleaseBody`] that returns the pooled connection once the last frame has
//! been read.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;

use crate::proxy::pool::PooledConnection;

/// Body sent to backends.
pub type BackendBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Body returned to callers.
pub type GatewayBody = UnsyncBoxBody<Bytes, hyper::Error>;

pub fn full(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> GatewayBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Backend response body that releases its pooled connection.
///
/// The connection goes back to the pool as healthy once the body reports end
/// of stream. A body error, or a body dropped before its end (the caller went
/// away), releases the connection as unhealthy so it is closed.
pub struct ReleaseBody {
    inner: Incoming,
    conn: Option<PooledConnection>,
}

impl ReleaseBody {
    pub fn new(inner: Incoming, conn: PooledConnection) -> Self {
        let mut body = Self {
            inner,
            conn: Some(conn),
        };
        if body.inner.is_end_stream() {
            body.finish(true);
        }
        body
    }

    fn finish(&mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            conn.release(healthy);
        }
    }
}

impl Body for ReleaseBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.finish(true),
            Poll::Ready(Some(Err(_))) => this.finish(false),
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => this.finish(true),
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ReleaseBody {
    fn drop(&mut self) {
        let healthy = self.inner.is_end_stream();
        self.finish(healthy);
    }
}
