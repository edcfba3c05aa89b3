use std::{
    future::Future,
    task::{ready, Context, Poll},
};

use tokio::sync::{mpsc, oneshot};
use webparse::Binary;

use crate::{ProtError, ProtResult, Body, BodySource};

/// 占位流: 真正的输入稍后由异步操作填入.
/// 填充端在投递前丢弃即视为取消, 消费端收到 Cancelled.
pub struct DelayedBody {
    slot: Option<oneshot::Receiver<ProtResult<Body>>>,
    inner: Option<Body>,
}

/// 填充端, 恰好使用一次
pub struct DelayedSender {
    slot: oneshot::Sender<ProtResult<Body>>,
}

impl DelayedSender {
    pub fn set(self, body: Body) {
        let _ = self.slot.send(Ok(body));
    }

    pub fn fail(self, err: ProtError) {
        let _ = self.slot.send(Err(err));
    }

    /// 开一条通道流并立即占位, 适合一边下载一边供给
    pub fn channel(self) -> mpsc::Sender<(bool, Binary)> {
        let (sender, receiver) = mpsc::channel(30);
        self.set(Body::new(receiver, webparse::BinaryMut::new(), false));
        sender
    }
}

impl DelayedBody {
    pub fn new() -> (Self, DelayedSender) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                slot: Some(receiver),
                inner: None,
            },
            DelayedSender { slot: sender },
        )
    }

    pub fn into_body() -> (Body, DelayedSender) {
        let (delayed, sender) = DelayedBody::new();
        (Body::new_source(Box::new(delayed)), sender)
    }
}

impl BodySource for DelayedBody {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        if self.inner.is_none() {
            let slot = match &mut self.slot {
                Some(v) => v,
                None => return Poll::Ready(Ok((true, Binary::new()))),
            };
            match ready!(std::pin::Pin::new(slot).poll(cx)) {
                Ok(Ok(body)) => {
                    self.slot = None;
                    self.inner = Some(body);
                }
                Ok(Err(e)) => {
                    self.slot = None;
                    return Poll::Ready(Err(e));
                }
                Err(_) => {
                    // 填充端未投递就消失了
                    self.slot = None;
                    return Poll::Ready(Err(ProtError::Cancelled));
                }
            }
        }
        self.inner.as_mut().unwrap().poll_data(cx)
    }

    fn origin_len(&self) -> Option<u64> {
        self.inner.as_ref().and_then(|v| v.available())
    }
}
