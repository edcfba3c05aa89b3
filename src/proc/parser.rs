// Copyright 2023 - 2024 Wmgate See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2023/12/04 16:55:30

/// 解析出的标签属性, 值的位置用绝对偏移记下来, 方便原位替换
#[derive(Debug, Clone)]
pub struct TagAttr {
    pub name: String,
    pub value: String,
    /// 值在源文档里的 [start, end), 不含引号
    pub value_start: usize,
    pub value_end: usize,
}

/// 流式扫描产出的事件, 位置都是源文档的绝对偏移
#[derive(Debug)]
pub enum HtmlEvent {
    /// 完整的部件标签(含自闭合或配对的关闭标签) [start, end)
    WidgetTag {
        start: usize,
        end: usize,
        attrs: Vec<TagAttr>,
    },
    /// 普通标签, 交给上层挑 URI 属性重写
    Tag {
        name: String,
        attrs: Vec<TagAttr>,
        /// 是否在 script 内容里(上层决定要不要动)
        in_script: bool,
    },
    /// &c:xxx; 形式的替换标记 [start, end)
    ContextToken {
        start: usize,
        end: usize,
        name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Text,
    /// 积攒 '<'..'>' 之间的内容
    Tag,
    /// 积攒 '&'..';' 之间的内容
    Entity,
    /// 部件标签开着, 找 "</beng:widget>"
    WidgetBody,
}

pub const WIDGET_TAG: &str = "beng:widget";
const WIDGET_CLOSE: &[u8] = b"</beng:widget>";

/// 增量式 HTML 标签扫描器.
/// 不做完整的 DOM, 只认三类构造: 部件标签, 普通标签的属性,
/// &c: 上下文标记; 跨块的半截构造自动续上.
pub struct HtmlParser {
    state: ParseState,
    /// 已吞入的总字节数
    consumed: usize,
    tag_buf: Vec<u8>,
    tag_start: usize,
    /// 标签内当前的引号字符
    quote: Option<u8>,
    entity_buf: Vec<u8>,
    entity_start: usize,
    in_script: bool,
    /// 部件开标签的起点与属性
    widget_start: usize,
    widget_attrs: Vec<TagAttr>,
    /// WidgetBody 状态下已匹配的关闭标签字节数
    close_matched: usize,
}

impl HtmlParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Text,
            consumed: 0,
            tag_buf: vec![],
            tag_start: 0,
            quote: None,
            entity_buf: vec![],
            entity_start: 0,
            in_script: false,
            widget_start: 0,
            widget_attrs: vec![],
            close_matched: 0,
        }
    }

    /// 当前半截构造的起点, 之前的字节不会再被引用
    pub fn settle_boundary(&self) -> usize {
        match self.state {
            ParseState::Text => self.consumed,
            ParseState::Tag => self.tag_start,
            ParseState::Entity => self.entity_start,
            ParseState::WidgetBody => self.widget_start,
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<HtmlEvent> {
        let mut events = vec![];
        for &b in data {
            let offset = self.consumed;
            self.consumed += 1;
            match self.state {
                ParseState::Text => {
                    if b == b'<' {
                        self.state = ParseState::Tag;
                        self.tag_buf.clear();
                        self.tag_start = offset;
                        self.quote = None;
                    } else if b == b'&' && !self.in_script {
                        self.state = ParseState::Entity;
                        self.entity_buf.clear();
                        self.entity_start = offset;
                    }
                }
                ParseState::Entity => {
                    if b == b';' {
                        self.state = ParseState::Text;
                        let name = String::from_utf8_lossy(&self.entity_buf).to_string();
                        if name.starts_with("c:") {
                            events.push(HtmlEvent::ContextToken {
                                start: self.entity_start,
                                end: offset + 1,
                                name: name[2..].to_string(),
                            });
                        }
                    } else if b == b'&' {
                        // 新的 & 重新开始
                        self.entity_buf.clear();
                        self.entity_start = offset;
                    } else if !(b.is_ascii_alphanumeric() || b == b':' || b == b'_' || b == b'-') {
                        self.state = ParseState::Text;
                        if b == b'<' {
                            self.state = ParseState::Tag;
                            self.tag_buf.clear();
                            self.tag_start = offset;
                            self.quote = None;
                        }
                    } else {
                        self.entity_buf.push(b);
                        if self.entity_buf.len() > 64 {
                            self.state = ParseState::Text;
                        }
                    }
                }
                ParseState::Tag => {
                    match self.quote {
                        Some(q) => {
                            if b == q {
                                self.quote = None;
                            }
                            self.tag_buf.push(b);
                        }
                        None => {
                            if b == b'"' || b == b'\'' {
                                self.quote = Some(b);
                                self.tag_buf.push(b);
                            } else if b == b'>' {
                                self.state = ParseState::Text;
                                self.finish_tag(offset + 1, &mut events);
                            } else {
                                self.tag_buf.push(b);
                                if self.tag_buf.len() > 64 * 1024 {
                                    // 不像话的长标签按文本放掉
                                    self.state = ParseState::Text;
                                }
                            }
                        }
                    }
                }
                ParseState::WidgetBody => {
                    if b == WIDGET_CLOSE[self.close_matched] {
                        self.close_matched += 1;
                        if self.close_matched == WIDGET_CLOSE.len() {
                            self.state = ParseState::Text;
                            events.push(HtmlEvent::WidgetTag {
                                start: self.widget_start,
                                end: offset + 1,
                                attrs: std::mem::take(&mut self.widget_attrs),
                            });
                        }
                    } else {
                        self.close_matched = if b == WIDGET_CLOSE[0] { 1 } else { 0 };
                    }
                }
            }
        }
        events
    }

    /// 流结束: 半截构造按文本揭过
    pub fn finish(&mut self) {
        self.state = ParseState::Text;
    }

    fn finish_tag(&mut self, end: usize, events: &mut Vec<HtmlEvent>) {
        let text = String::from_utf8_lossy(&self.tag_buf).to_string();
        let trimmed = text.trim_start();
        if trimmed.starts_with('!') || trimmed.starts_with('?') {
            return;
        }
        if let Some(close_name) = trimmed.strip_prefix('/') {
            if close_name.trim().eq_ignore_ascii_case("script") {
                self.in_script = false;
            }
            return;
        }

        let self_closing = trimmed.ends_with('/');
        let name_end = trimmed
            .find(|c: char| c.is_ascii_whitespace() || c == '/')
            .unwrap_or(trimmed.len());
        let name = trimmed[..name_end].to_ascii_lowercase();
        // 属性偏移要算上开头被修掉的空白与 '<'
        let base = self.tag_start + 1 + (text.len() - trimmed.len());
        let attrs = parse_attrs(trimmed, base + name_end, name_end);

        if name == "script" && !self_closing {
            self.in_script = true;
        }

        if name == WIDGET_TAG {
            if self_closing {
                events.push(HtmlEvent::WidgetTag {
                    start: self.tag_start,
                    end,
                    attrs,
                });
            } else {
                self.widget_start = self.tag_start;
                self.widget_attrs = attrs;
                self.close_matched = 0;
                self.state = ParseState::WidgetBody;
            }
            return;
        }

        events.push(HtmlEvent::Tag {
            name,
            attrs,
            in_script: self.in_script,
        });
    }
}

/// 从标签文本里拆属性, 记录值的绝对偏移
fn parse_attrs(tag: &str, mut abs: usize, mut pos: usize) -> Vec<TagAttr> {
    let bytes = tag.as_bytes();
    let mut attrs = vec![];
    loop {
        // 跳空白
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
            abs += 1;
        }
        if pos >= bytes.len() || bytes[pos] == b'/' {
            break;
        }
        // 属性名
        let name_start = pos;
        while pos < bytes.len()
            && !bytes[pos].is_ascii_whitespace()
            && bytes[pos] != b'='
            && bytes[pos] != b'/'
        {
            pos += 1;
            abs += 1;
        }
        let name = tag[name_start..pos].to_ascii_lowercase();
        // 等号
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
            abs += 1;
        }
        if pos >= bytes.len() || bytes[pos] != b'=' {
            if !name.is_empty() {
                attrs.push(TagAttr {
                    name,
                    value: String::new(),
                    value_start: abs,
                    value_end: abs,
                });
            }
            continue;
        }
        pos += 1;
        abs += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
            abs += 1;
        }
        if pos >= bytes.len() {
            break;
        }
        // 值: 引号包着或裸写
        let (value, value_start, value_end) = if bytes[pos] == b'"' || bytes[pos] == b'\'' {
            let quote = bytes[pos];
            pos += 1;
            abs += 1;
            let start_abs = abs;
            let start_pos = pos;
            while pos < bytes.len() && bytes[pos] != quote {
                pos += 1;
                abs += 1;
            }
            let v = tag[start_pos..pos].to_string();
            let end_abs = abs;
            if pos < bytes.len() {
                pos += 1;
                abs += 1;
            }
            (v, start_abs, end_abs)
        } else {
            let start_abs = abs;
            let start_pos = pos;
            while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() && bytes[pos] != b'/' {
                pos += 1;
                abs += 1;
            }
            (tag[start_pos..pos].to_string(), start_abs, abs)
        };
        attrs.push(TagAttr {
            name,
            value,
            value_start,
            value_end,
        });
    }
    attrs
}
