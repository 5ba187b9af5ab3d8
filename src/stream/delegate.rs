//! Application callbacks and the handle they act through.

use bytes::Bytes;

use crate::stream::{DataStreamId, DataStreamRequest};
use crate::transport::{CompletionHandler, Transmission};

/// Application side of a Data Stream.
///
/// Callbacks run while the transport is in the middle of an event. Data
/// operations and invalidation issued through [`StreamControl`] take effect
/// once the callback returns.
pub trait DataStreamDelegate: Send {
    /// A new stream was accepted.
    fn handle_accept(&mut self, stream: &mut StreamControl<'_>);

    /// A frame of `total_data_bytes` arrived.
    ///
    /// The delegate must consume it with `receive_data` / `skip_data` chunks
    /// totalling exactly that many bytes.
    fn handle_data(&mut self, stream: &mut StreamControl<'_>, total_data_bytes: usize);

    /// The stream is gone. Its id is stale from now on.
    fn handle_invalidate(&mut self, request: &DataStreamRequest, id: DataStreamId);
}

/// Requests raised from inside a callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ControlRequests {
    pub invalidate: bool,
    pub send: bool,
    pub receive: bool,
}

/// Access to one stream from inside a delegate or completion callback.
pub struct StreamControl<'a> {
    id: DataStreamId,
    request: &'a DataStreamRequest,
    receive: &'a mut Transmission,
    send: &'a mut Transmission,
    destroying: bool,
    requests: ControlRequests,
}

impl<'a> StreamControl<'a> {
    pub(crate) fn new(
        id: DataStreamId,
        request: &'a DataStreamRequest,
        receive: &'a mut Transmission,
        send: &'a mut Transmission,
        destroying: bool,
    ) -> Self {
        Self {
            id,
            request,
            receive,
            send,
            destroying,
            requests: ControlRequests::default(),
        }
    }

    pub(crate) fn into_requests(self) -> ControlRequests {
        self.requests
    }

    pub fn id(&self) -> DataStreamId {
        self.id
    }

    pub fn request(&self) -> &DataStreamRequest {
        self.request
    }

    /// Whether the stream is about to be invalidated.
    pub fn is_destroying(&self) -> bool {
        self.destroying || self.requests.invalidate
    }

    /// Announce a frame of `total` bytes to send.
    pub fn prepare_data(&mut self, total: usize, handler: CompletionHandler) {
        self.check_live();
        self.send.prepare(total, handler);
        self.requests.send = true;
    }

    pub fn send_data(&mut self, bytes: Bytes, handler: CompletionHandler) {
        self.check_live();
        self.send.submit_send(bytes, handler);
        self.requests.send = true;
    }

    /// Send a chunk that is encrypted in place; the ciphertext is handed back.
    pub fn send_mutable_data(&mut self, buf: Vec<u8>, handler: CompletionHandler) {
        self.check_live();
        self.send.submit_send_mutable(buf, handler);
        self.requests.send = true;
    }

    pub fn receive_data(&mut self, buf: Vec<u8>, handler: CompletionHandler) {
        self.check_live();
        self.receive.submit_receive(buf, handler);
        self.requests.receive = true;
    }

    pub fn skip_data(&mut self, n: usize, handler: CompletionHandler) {
        self.check_live();
        self.receive.submit_skip(n, handler);
        self.requests.receive = true;
    }

    /// Tear the stream down once the current callback returns.
    pub fn invalidate(&mut self) {
        self.requests.invalidate = true;
    }

    fn check_live(&self) {
        assert!(!self.is_destroying(), "data operation on a stream that is being invalidated");
    }
}

/// Run `f` with a [`StreamControl`] over one stream's transmissions.
pub(crate) fn with_control<R>(
    id: DataStreamId,
    request: &DataStreamRequest,
    receive: &mut Transmission,
    send: &mut Transmission,
    destroying: bool,
    f: impl FnOnce(&mut StreamControl<'_>) -> R,
) -> (R, ControlRequests) {
    let mut control = StreamControl::new(id, request, receive, send, destroying);
    let result = f(&mut control);
    (result, control.into_requests())
}
