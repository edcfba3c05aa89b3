use std::{
    collections::VecDeque,
    task::{ready, Context, Poll},
};

use webparse::{Binary, BinaryMut, Buf, BufMut};

use crate::{ProtResult, Body, BodySource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubstState {
    /// 正在寻找首个可能的匹配字符
    None,
    /// 已命中前缀, 继续比对
    Match,
    /// 流已经结束
    Closed,
}

/// 关键字替换流: 注册若干 关键字→替换串, 边读边替换.
/// 同一前缀下取最长可完整命中的关键字; 半截匹配失败时回退,
/// 原样吐出第一个字节后把剩余部分重新走一遍状态机,
/// 跨数据块边界的部分匹配同样成立.
pub struct SubstBody {
    input: Body,
    dict: Vec<(Vec<u8>, Binary)>,
    state: SubstState,
    /// 处于部分匹配中的字节
    pending: Vec<u8>,
    /// pending 前缀里已完整命中的最长关键字
    last_complete: Option<usize>,
    /// 回退后待重新扫描的字节
    rescan: VecDeque<u8>,
    output: BinaryMut,
    input_end: bool,
}

impl SubstBody {
    pub fn new(input: Body) -> Self {
        Self {
            input,
            dict: vec![],
            state: SubstState::None,
            pending: vec![],
            last_complete: None,
            rescan: VecDeque::new(),
            output: BinaryMut::new(),
            input_end: false,
        }
    }

    /// 注册一条替换, 重复注册同一关键字以先注册的为准
    pub fn add(&mut self, keyword: &str, replacement: &str) -> &mut Self {
        if !keyword.is_empty() && !self.dict.iter().any(|(k, _)| k == keyword.as_bytes()) {
            self.dict.push((
                keyword.as_bytes().to_vec(),
                Binary::from(replacement.as_bytes().to_vec()),
            ));
        }
        self
    }

    pub fn into_body(self) -> Body {
        Body::new_source(Box::new(self))
    }

    fn is_prefix(&self, pending: &[u8]) -> bool {
        self.dict.iter().any(|(k, _)| k.starts_with(pending))
    }

    fn find_exact(&self, pending: &[u8]) -> Option<usize> {
        self.dict.iter().position(|(k, _)| k == pending)
    }

    fn emit_replacement(&mut self, index: usize) {
        let data = self.dict[index].1.clone();
        self.output.put_slice(data.chunk());
    }

    /// 单字节推进状态机
    fn feed(&mut self, byte: u8) {
        match self.state {
            SubstState::Closed => {}
            SubstState::None => {
                if self.is_prefix(&[byte]) {
                    self.pending.push(byte);
                    self.last_complete = self.find_exact(&[byte]);
                    self.state = SubstState::Match;
                } else {
                    self.output.put_slice(&[byte]);
                }
            }
            SubstState::Match => {
                self.pending.push(byte);
                if self.is_prefix(&self.pending) {
                    if let Some(idx) = self.find_exact(&self.pending) {
                        self.last_complete = Some(idx);
                        // 若无更长关键字共享该前缀, 立即落定
                        let longer = self
                            .dict
                            .iter()
                            .any(|(k, _)| k.len() > self.pending.len() && k.starts_with(&self.pending));
                        if !longer {
                            self.emit_replacement(idx);
                            self.pending.clear();
                            self.last_complete = None;
                            self.state = SubstState::None;
                        }
                    }
                    return;
                }
                // 失配: 先结算已完整命中的部分, 余下字节回炉
                let pending = std::mem::take(&mut self.pending);
                let rest: &[u8];
                if let Some(idx) = self.last_complete.take() {
                    let matched_len = self.dict[idx].0.len();
                    self.emit_replacement(idx);
                    rest = &pending[matched_len..];
                } else {
                    self.output.put_slice(&pending[..1]);
                    rest = &pending[1..];
                }
                for (i, b) in rest.iter().enumerate() {
                    self.rescan.insert(i, *b);
                }
                self.state = SubstState::None;
            }
        }
    }

    fn feed_all(&mut self, data: &[u8]) {
        let mut i = 0;
        loop {
            // 回退队列优先于新输入
            while let Some(b) = self.rescan.pop_front() {
                self.feed(b);
            }
            if i >= data.len() {
                break;
            }
            let b = data[i];
            i += 1;
            self.feed(b);
        }
        while let Some(b) = self.rescan.pop_front() {
            self.feed(b);
        }
    }

    fn finish(&mut self) {
        // 流结束时结算残余的部分匹配
        loop {
            if self.pending.is_empty() && self.rescan.is_empty() {
                break;
            }
            let pending = std::mem::take(&mut self.pending);
            if let Some(idx) = self.last_complete.take() {
                let matched_len = self.dict[idx].0.len();
                self.emit_replacement(idx);
                for (i, b) in pending[matched_len..].iter().enumerate() {
                    self.rescan.insert(i, *b);
                }
            } else if !pending.is_empty() {
                self.output.put_slice(&pending[..1]);
                for (i, b) in pending[1..].iter().enumerate() {
                    self.rescan.insert(i, *b);
                }
            }
            self.state = SubstState::None;
            let rescan: Vec<u8> = self.rescan.drain(..).collect();
            for b in rescan {
                self.feed(b);
            }
        }
        self.state = SubstState::Closed;
    }
}

impl BodySource for SubstBody {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        loop {
            if self.output.remaining() > 0 {
                let data = Binary::from(self.output.chunk().to_vec());
                self.output.advance_all();
                let end = self.state == SubstState::Closed;
                return Poll::Ready(Ok((end, data)));
            }
            if self.state == SubstState::Closed {
                return Poll::Ready(Ok((true, Binary::new())));
            }
            if self.input_end {
                self.finish();
                continue;
            }
            let (is_end, bin) = ready!(self.input.poll_data(cx))?;
            self.feed_all(bin.chunk());
            if is_end {
                self.input_end = true;
                self.finish();
            }
        }
    }
}
