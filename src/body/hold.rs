use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{ready, Context, Poll, Waker},
};

use webparse::Binary;

use crate::{ProtResult, Body, BodySource};

/// 暂停开关, 在栈回卷期间阻止重入式读取
#[derive(Clone)]
pub struct HoldHandle {
    released: Arc<AtomicBool>,
    waker: Arc<Mutex<Option<Waker>>>,
}

impl HoldHandle {
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        if let Ok(mut waker) = self.waker.lock() {
            if let Some(w) = waker.take() {
                w.wake();
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// 包住一个流, 在释放前缓冲其数据与结束事件.
/// 典型用法是先构造来源再接消费者, 或暂停读取防止重入.
pub struct HoldBody {
    input: Body,
    handle: HoldHandle,
    buffered: Vec<(bool, Binary)>,
    input_end: bool,
}

impl HoldBody {
    pub fn new(input: Body) -> (Self, HoldHandle) {
        let handle = HoldHandle {
            released: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(Mutex::new(None)),
        };
        (
            Self {
                input,
                handle: handle.clone(),
                buffered: vec![],
                input_end: false,
            },
            handle,
        )
    }

    pub fn into_body(input: Body) -> (Body, HoldHandle) {
        let (hold, handle) = HoldBody::new(input);
        (Body::new_source(Box::new(hold)), handle)
    }
}

impl BodySource for HoldBody {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        if !self.handle.is_released() {
            // 释放前照常吸入上游, 但不对外吐出
            while !self.input_end {
                match self.input.poll_data(cx) {
                    Poll::Ready(Ok((is_end, bin))) => {
                        self.input_end = is_end;
                        self.buffered.push((is_end, bin));
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => break,
                }
            }
            if let Ok(mut waker) = self.handle.waker.lock() {
                *waker = Some(cx.waker().clone());
            }
            // release 之后靠存下的 waker 唤醒
            if !self.handle.is_released() {
                return Poll::Pending;
            }
        }
        if !self.buffered.is_empty() {
            return Poll::Ready(Ok(self.buffered.remove(0)));
        }
        if self.input_end {
            return Poll::Ready(Ok((true, Binary::new())));
        }
        let v = ready!(self.input.poll_data(cx))?;
        self.input_end = v.0;
        Poll::Ready(Ok(v))
    }

    fn origin_len(&self) -> Option<u64> {
        self.input.available()
    }
}
