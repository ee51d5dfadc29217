use std::fmt::{Debug, Formatter};
use tokio::sync::{mpsc, oneshot};

/// Can be used to respond to a request sent into the engine.
#[must_use = "response token should be used to respond to a request"]
pub struct ResponseToken<T> {
    sender: oneshot::Sender<T>,
}

impl<T> Debug for ResponseToken<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Response token")
    }
}

impl<T> ResponseToken<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { sender: tx }, rx)
    }

    pub fn respond(self, response: T) {
        if self.sender.send(response).is_err() {
            log::warn!("Could not send a response, the other end hung up");
        }
    }
}

pub type RpcSender<T> = mpsc::UnboundedSender<T>;
pub type RpcReceiver<T> = mpsc::UnboundedReceiver<T>;

pub fn make_rpc_queue<T>() -> (RpcSender<T>, RpcReceiver<T>) {
    mpsc::unbounded_channel()
}

/// Helper for request/response calls: builds a response token, lets the
/// callback enqueue the request and returns the receiving end.
pub fn initiate_request<F, Response>(make_request: F) -> oneshot::Receiver<Response>
where
    F: FnOnce(ResponseToken<Response>),
{
    let (token, rx) = ResponseToken::new();
    make_request(token);
    rx
}
