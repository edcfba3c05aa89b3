use std::{
    collections::VecDeque,
    task::{ready, Context, Poll},
};

use webparse::{Binary, Buf};

use crate::{ProtResult, Body, BodySource};

/// 惰性拼接多个流, 逐个拉完
pub struct CatBody {
    inputs: VecDeque<Body>,
}

impl CatBody {
    pub fn new(inputs: Vec<Body>) -> Self {
        Self {
            inputs: inputs.into(),
        }
    }

    pub fn into_body(inputs: Vec<Body>) -> Body {
        Body::new_source(Box::new(CatBody::new(inputs)))
    }
}

impl BodySource for CatBody {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        loop {
            let front = match self.inputs.front_mut() {
                Some(v) => v,
                None => return Poll::Ready(Ok((true, Binary::new()))),
            };
            let (is_end, bin) = ready!(front.poll_data(cx))?;
            if is_end {
                self.inputs.pop_front();
            }
            let all_end = is_end && self.inputs.is_empty();
            if bin.remaining() > 0 || all_end {
                return Poll::Ready(Ok((all_end, bin)));
            }
        }
    }

    fn origin_len(&self) -> Option<u64> {
        let mut total = 0u64;
        for input in &self.inputs {
            total += input.available()?;
        }
        Some(total)
    }
}
