use std::task::{ready, Context, Poll};

use webparse::{Binary, BinaryMut, Buf, BufMut};

use crate::{ProtResult, Body, BodySource};

/// 先把上游攒进内存, 攒到阈值或读完为止, 再整段向下游放行.
/// 用来避免对细碎的小响应体走流式路径.
pub struct BufferedBody {
    input: Body,
    threshold: usize,
    buffer: BinaryMut,
    materialized: bool,
    input_end: bool,
}

impl BufferedBody {
    pub fn new(input: Body, threshold: usize) -> Self {
        Self {
            input,
            threshold,
            buffer: BinaryMut::new(),
            materialized: false,
            input_end: false,
        }
    }

    pub fn into_body(input: Body, threshold: usize) -> Body {
        Body::new_source(Box::new(BufferedBody::new(input, threshold)))
    }
}

impl BodySource for BufferedBody {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        while !self.materialized {
            match ready!(self.input.poll_data(cx)) {
                Ok((is_end, bin)) => {
                    self.buffer.put_slice(bin.chunk());
                    self.input_end = is_end;
                    if is_end || self.buffer.remaining() >= self.threshold {
                        self.materialized = true;
                    }
                }
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        if self.buffer.remaining() > 0 {
            let data = Binary::from(self.buffer.chunk().to_vec());
            self.buffer.advance_all();
            return Poll::Ready(Ok((self.input_end, data)));
        }
        if self.input_end {
            return Poll::Ready(Ok((true, Binary::new())));
        }
        // 阈值已破, 其后直接透传
        let v = ready!(self.input.poll_data(cx))?;
        self.input_end = v.0;
        Poll::Ready(Ok(v))
    }

    fn origin_len(&self) -> Option<u64> {
        if self.input_end {
            Some(self.buffer.remaining() as u64)
        } else {
            self.input.available().map(|v| v + self.buffer.remaining() as u64)
        }
    }
}
