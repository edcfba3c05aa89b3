use std::{
    collections::VecDeque,
    task::{ready, Context, Poll},
};

use webparse::{Binary, BinaryMut, Buf, BufMut};

use crate::{ProtError, ProtResult, Body, BodySource};

struct ReplaceRange {
    start: usize,
    end: usize,
    body: Body,
}

/// 对累积的源数据做区间替换: 记录 (start, end, 替换流),
/// 区间必须递增且互不重叠; 输出按位置交错源数据与替换流.
/// settle 之前的字节即可流出, 不必等全部源数据到齐.
pub struct Replace {
    buffer: BinaryMut,
    /// 已追加的源字节总数
    source_len: usize,
    /// 已对外输出(或跳过)的源位置
    position: usize,
    /// 此位置之前的源数据允许字面输出
    settled: usize,
    /// 已注册区间的最大 end, 保证递增不重叠
    last_range_end: usize,
    ranges: VecDeque<ReplaceRange>,
    current: Option<Body>,
    finished: bool,
}

impl Replace {
    pub fn new() -> Self {
        Self {
            buffer: BinaryMut::new(),
            source_len: 0,
            position: 0,
            settled: 0,
            last_range_end: 0,
            ranges: VecDeque::new(),
            current: None,
            finished: false,
        }
    }

    pub fn source_len(&self) -> usize {
        self.source_len
    }

    pub fn append(&mut self, data: &[u8]) {
        debug_assert!(!self.finished);
        self.buffer.put_slice(data);
        self.source_len += data.len();
    }

    /// 注册一个替换区间, 引用已追加的数据
    pub fn add(&mut self, start: usize, end: usize, body: Body) -> ProtResult<()> {
        if start > end {
            return Err(ProtError::Extension("replace range out of bounds"));
        }
        if start < self.last_range_end || start < self.position {
            return Err(ProtError::Extension("replace range not ascending"));
        }
        self.last_range_end = end;
        if self.settled < end {
            self.settled = end;
        }
        self.ranges.push_back(ReplaceRange { start, end, body });
        Ok(())
    }

    /// 声明 pos 之前不会再有替换, 允许字面输出
    pub fn settle(&mut self, pos: usize) {
        if pos > self.settled && pos <= self.source_len {
            self.settled = pos;
        }
    }

    pub fn finish(&mut self) {
        self.finished = true;
        self.settled = self.source_len;
    }

    fn take_source(&mut self, until: usize) -> Binary {
        let len = until - self.position;
        let data = Binary::from(self.buffer.chunk()[..len].to_vec());
        self.buffer.advance(len);
        self.position = until;
        data
    }

    fn is_end(&self) -> bool {
        self.finished
            && self.current.is_none()
            && self.ranges.is_empty()
            && self.position >= self.source_len
    }

    /// 产出下一段输出; 源与替换都暂不可用时返回 Pending
    /// (依赖调用方先行拉取源输入以注册唤醒)
    pub fn poll_output(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        loop {
            if let Some(cur) = &mut self.current {
                let (is_end, bin) = ready!(cur.poll_data(cx))?;
                if is_end {
                    self.current = None;
                }
                if bin.remaining() > 0 {
                    return Poll::Ready(Ok((is_end && self.is_end(), bin)));
                }
                continue;
            }

            if let Some(front) = self.ranges.front() {
                if self.position < front.start {
                    let until = std::cmp::min(front.start, self.source_len);
                    if until > self.position {
                        let data = self.take_source(until);
                        return Poll::Ready(Ok((false, data)));
                    }
                    return Poll::Pending;
                }
                if self.source_len < front.end {
                    // 等待被替换的源字节到齐
                    return Poll::Pending;
                }
                // 跳过被替换的源字节, 改放替换流
                let range = self.ranges.pop_front().unwrap();
                let skip = range.end - self.position;
                self.buffer.advance(skip);
                self.position = range.end;
                self.current = Some(range.body);
                continue;
            }

            let limit = if self.finished {
                self.source_len
            } else {
                self.settled
            };
            if self.position < limit {
                let data = self.take_source(limit);
                return Poll::Ready(Ok((self.is_end(), data)));
            }
            if self.is_end() {
                return Poll::Ready(Ok((true, Binary::new())));
            }
            return Poll::Pending;
        }
    }
}

/// 独立使用的区间替换流: 区间预先注册, 源数据流入后交错输出
pub struct ReplaceBody {
    input: Body,
    replace: Replace,
    input_end: bool,
}

impl ReplaceBody {
    pub fn new(input: Body) -> Self {
        Self {
            input,
            replace: Replace::new(),
            input_end: false,
        }
    }

    pub fn add(&mut self, start: usize, end: usize, body: Body) -> ProtResult<()> {
        self.replace.add(start, end, body)
    }

    pub fn into_body(self) -> Body {
        Body::new_source(Box::new(self))
    }
}

impl BodySource for ReplaceBody {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        loop {
            while !self.input_end {
                match self.input.poll_data(cx) {
                    Poll::Ready(Ok((is_end, bin))) => {
                        self.replace.append(bin.chunk());
                        let len = self.replace.source_len();
                        self.replace.settle(len);
                        if is_end {
                            self.input_end = true;
                            self.replace.finish();
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => break,
                }
            }
            match self.replace.poll_output(cx) {
                Poll::Ready(v) => return Poll::Ready(v),
                Poll::Pending => {
                    if self.input_end {
                        return Poll::Pending;
                    }
                    // 源未结束时输出饥饿, 继续等源
                    return Poll::Pending;
                }
            }
        }
    }
}
