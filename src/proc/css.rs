use std::{
    sync::Arc,
    task::{Context, Poll},
};

use webparse::{Binary, Buf};

use crate::{Body, BodySource, ProtResult, Replace, RewriteMode, WidgetRef, WidgetTree};

use super::ProcessorEnv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CssState {
    Text,
    /// 已见 "url" 前缀的若干字节
    UrlKeyword(usize),
    /// url( 之后, 积攒参数
    UrlValue,
}

/// CSS 处理流: 把 url(...) 里的相对引用走同一套重写规则.
/// 只认 url 函数, 别的语法一概透传.
pub struct CssProcessorBody {
    input: Body,
    env: Arc<ProcessorEnv>,
    tree: WidgetTree,
    context: Option<WidgetRef>,
    replace: Replace,
    state: CssState,
    consumed: usize,
    value_buf: Vec<u8>,
    value_start: usize,
    input_end: bool,
}

const URL_KEYWORD: &[u8] = b"url(";

impl CssProcessorBody {
    pub fn new(
        input: Body,
        env: Arc<ProcessorEnv>,
        tree: WidgetTree,
        context: Option<WidgetRef>,
    ) -> Self {
        Self {
            input,
            env,
            tree,
            context,
            replace: Replace::new(),
            state: CssState::Text,
            consumed: 0,
            value_buf: vec![],
            value_start: 0,
            input_end: false,
        }
    }

    pub fn into_body(self) -> Body {
        Body::new_source(Box::new(self))
    }

    fn settle_boundary(&self) -> usize {
        match self.state {
            CssState::Text => self.consumed,
            CssState::UrlKeyword(matched) => self.consumed - matched,
            CssState::UrlValue => self.value_start,
        }
    }

    fn feed(&mut self, data: &[u8]) {
        for &b in data {
            let offset = self.consumed;
            self.consumed += 1;
            match self.state {
                CssState::Text => {
                    if b == URL_KEYWORD[0] {
                        self.state = CssState::UrlKeyword(1);
                    }
                }
                CssState::UrlKeyword(matched) => {
                    if b == URL_KEYWORD[matched] {
                        if matched + 1 == URL_KEYWORD.len() {
                            self.state = CssState::UrlValue;
                            self.value_buf.clear();
                            self.value_start = offset + 1;
                        } else {
                            self.state = CssState::UrlKeyword(matched + 1);
                        }
                    } else {
                        self.state = if b == URL_KEYWORD[0] {
                            CssState::UrlKeyword(1)
                        } else {
                            CssState::Text
                        };
                    }
                }
                CssState::UrlValue => {
                    if b == b')' {
                        self.rewrite_url(offset);
                        self.state = CssState::Text;
                    } else {
                        self.value_buf.push(b);
                        if self.value_buf.len() > 8 * 1024 {
                            self.state = CssState::Text;
                        }
                    }
                }
            }
        }
    }

    fn rewrite_url(&mut self, end: usize) {
        let context = match self.context {
            Some(v) => v,
            None => return,
        };
        let raw = String::from_utf8_lossy(&self.value_buf).to_string();
        let trimmed = raw.trim().trim_matches('"').trim_matches('\'');
        if trimmed.is_empty()
            || trimmed.starts_with("http://")
            || trimmed.starts_with("https://")
            || trimmed.starts_with("data:")
        {
            return;
        }
        if let Some(rewritten) = crate::rewrite_widget_uri(
            &self.env.rewrite,
            &self.tree,
            context,
            RewriteMode::Direct,
            trimmed,
        ) {
            let _ = self.replace.add(
                self.value_start,
                end,
                Body::from(format!("\"{}\"", rewritten)),
            );
        }
    }
}

impl BodySource for CssProcessorBody {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        while !self.input_end {
            match self.input.poll_data(cx) {
                Poll::Ready(Ok((is_end, bin))) => {
                    self.replace.append(bin.chunk());
                    self.feed(bin.chunk());
                    if is_end {
                        self.input_end = true;
                        self.replace.finish();
                    } else {
                        let boundary = self.settle_boundary();
                        self.replace.settle(boundary);
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }
        self.replace.poll_output(cx)
    }
}

/// 入口: 处理一个 CSS 流
pub struct CssProcessor;

impl CssProcessor {
    pub fn process(
        input: Body,
        env: Arc<ProcessorEnv>,
        tree: WidgetTree,
        context: Option<WidgetRef>,
    ) -> Body {
        CssProcessorBody::new(input, env, tree, context).into_body()
    }
}
