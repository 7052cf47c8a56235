use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Future, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::adapter::Adapter;
use crate::errors::Error;
use crate::socket::Socket;

/// Response produced by an event handler and sent back to the emitter when
/// the event carried an ack id. The dispatch layer sends it at most once.
pub enum Ack<T>
where
    T: Serialize + Send + Sync + 'static,
{
    Bin(Vec<Vec<u8>>),
    Data(T),
    DataBin(T, Vec<Vec<u8>>),
    None,
}

impl From<()> for Ack<()> {
    fn from(_: ()) -> Self {
        Ack::None
    }
}

/// Payload of a received acknowledgement: the argument array and the binary
/// attachments, if any.
pub type AckResponse<T> = (T, Vec<Vec<u8>>);

/// Object-safe face of a typed event handler.
///
/// `call` returns the handler future instead of spawning it, so lifecycle
/// events can be awaited in order while regular events are deferred to their
/// own task.
pub(crate) trait MessageCaller<A: Adapter>: Send + Sync + 'static {
    fn call(
        &self,
        s: Arc<Socket<A>>,
        v: Value,
        bin: Vec<Vec<u8>>,
        ack_id: Option<i64>,
    ) -> BoxFuture<'static, ()>;
}

struct MessageHandler<Param, RetV, F, A> {
    param: PhantomData<Param>,
    ret: PhantomData<RetV>,
    adapter: PhantomData<A>,
    handler: F,
}

/// Box a typed handler into an [`Arc<dyn MessageCaller>`].
pub(crate) fn boxed<A, C, F, V, RetV>(callback: C) -> Arc<dyn MessageCaller<A>>
where
    A: Adapter,
    C: Fn(Arc<Socket<A>>, V, Vec<Vec<u8>>) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Ack<RetV>, Error>> + Send + 'static,
    V: DeserializeOwned + Send + Sync + 'static,
    RetV: Serialize + Send + Sync + 'static,
{
    let handler = move |s: Arc<Socket<A>>, v: V, bin: Vec<Vec<u8>>| callback(s, v, bin).boxed();
    Arc::new(MessageHandler::<V, RetV, _, A> {
        param: PhantomData,
        ret: PhantomData,
        adapter: PhantomData,
        handler,
    })
}

impl<Param, RetV, F, A> MessageCaller<A> for MessageHandler<Param, RetV, F, A>
where
    Param: DeserializeOwned + Send + Sync + 'static,
    RetV: Serialize + Send + Sync + 'static,
    F: Fn(Arc<Socket<A>>, Param, Vec<Vec<u8>>) -> BoxFuture<'static, Result<Ack<RetV>, Error>>
        + Send
        + Sync
        + 'static,
    A: Adapter,
{
    fn call(
        &self,
        s: Arc<Socket<A>>,
        v: Value,
        bin: Vec<Vec<u8>>,
        ack_id: Option<i64>,
    ) -> BoxFuture<'static, ()> {
        // Payloads are argument arrays; unwrap them for single-argument
        // handlers and map an empty list to null.
        let v = match v {
            Value::Array(mut args) => match args.len() {
                0 => Value::Null,
                1 => args.pop().unwrap_or(Value::Null),
                _ => Value::Array(args),
            },
            v => v,
        };
        let v: Param = match serde_json::from_value(v) {
            Ok(v) => v,
            Err(e) => {
                debug!("[sid={}] event payload deserialization error: {e}", s.id);
                return futures::future::ready(()).boxed();
            }
        };
        let owned_socket = s.clone();
        let fut = (self.handler)(s, v, bin);
        async move {
            match fut.await {
                Ok(ack) => {
                    let Some(ack_id) = ack_id else { return };
                    let res = match ack {
                        Ack::Bin(b) => owned_socket.send_bin_ack(ack_id, json!({}), b),
                        Ack::Data(d) => owned_socket.send_ack(ack_id, d),
                        Ack::DataBin(d, b) => owned_socket.send_bin_ack(ack_id, d, b),
                        Ack::None => Ok(()),
                    };
                    if let Err(e) = res {
                        debug!("[sid={}] ack send error: {e:?}", owned_socket.id);
                    }
                }
                Err(e) => debug!("[sid={}] handler error: {e:?}", owned_socket.id),
            }
        }
        .boxed()
    }
}
