use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::time::{sleep_until, Instant, Sleep};
use webparse::Binary;

use crate::{ProtError, ProtResult, Body, BodySource};

/// 给生产端加上相邻两段数据之间的期限,
/// 超过期限没有任何字节到达就以超时错误终结流.
pub struct TimeoutBody {
    input: Body,
    duration: Duration,
    sleep: Pin<Box<Sleep>>,
    input_end: bool,
}

impl TimeoutBody {
    pub fn new(input: Body, duration: Duration) -> Self {
        Self {
            input,
            duration,
            sleep: Box::pin(sleep_until(Instant::now() + duration)),
            input_end: false,
        }
    }

    pub fn into_body(input: Body, duration: Duration) -> Body {
        Body::new_source(Box::new(TimeoutBody::new(input, duration)))
    }
}

impl BodySource for TimeoutBody {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        if self.input_end {
            return Poll::Ready(Ok((true, Binary::new())));
        }
        match self.input.poll_data(cx) {
            Poll::Ready(Ok((is_end, bin))) => {
                self.input_end = is_end;
                self.sleep
                    .as_mut()
                    .reset(Instant::now() + self.duration);
                Poll::Ready(Ok((is_end, bin)))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => match self.sleep.as_mut().poll(cx) {
                Poll::Ready(_) => Poll::Ready(Err(ProtError::body_timeout("stream"))),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn origin_len(&self) -> Option<u64> {
        self.input.available()
    }
}
