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
// Created Date: 2023/12/06 09:12:48

use std::{
    sync::Arc,
    task::{Context, Poll},
};

use webparse::{Binary, Buf};

use crate::{
    html_escape_str, spawn_inline_widget, Body, BodySource, InlineEnv, InlineRequest, ProtResult,
    Replace, RewriteEnv, RewriteMode, WidgetRef, WidgetTree,
};

use super::parser::{HtmlEvent, HtmlParser, TagAttr};

/// 需要重写的 URI 属性与各自的默认模式
fn default_uri_mode(tag: &str, attr: &str) -> Option<RewriteMode> {
    let mode = match attr {
        "href" if tag == "a" || tag == "link" => RewriteMode::Focus,
        "src" => RewriteMode::Direct,
        "action" if tag == "form" => RewriteMode::Focus,
        "formaction" => RewriteMode::Focus,
        "background" => RewriteMode::Direct,
        _ => return None,
    };
    Some(mode)
}

/// 组装一次 HTML 处理所需的全部环境
pub struct ProcessorEnv {
    pub inline: Arc<InlineEnv>,
    pub rewrite: RewriteEnv,
    /// &c: 标记的取值表 (uri/path/frame/view/base/args)
    pub context_values: Vec<(String, String)>,
    /// 被处理的文档本身是哪个部件的输出, 顶层模板为 None
    pub context_widget: Option<WidgetRef>,
    /// 聚焦的部件路径与它的 path_info
    pub focus: Option<String>,
    pub focus_path_info: Option<String>,
    /// 是否也处理 <script> 内容
    pub rewrite_script: bool,
}

impl ProcessorEnv {
    fn context_value(&self, name: &str) -> Option<&String> {
        self.context_values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// HTML 处理流: 边解析边替换, 部件标签换成子请求的占位流,
/// URI 属性按模式重写, &c: 标记换成转义后的上下文值.
/// 子请求全部并行, 输出顺序由模板位置决定.
pub struct ProcessorBody {
    input: Body,
    env: Arc<ProcessorEnv>,
    parser: HtmlParser,
    replace: Replace,
    tree: WidgetTree,
    parent: WidgetRef,
    input_end: bool,
}

impl ProcessorBody {
    pub fn new(input: Body, env: Arc<ProcessorEnv>, tree: WidgetTree, parent: WidgetRef) -> Self {
        Self {
            input,
            env,
            parser: HtmlParser::new(),
            replace: Replace::new(),
            tree,
            parent,
            input_end: false,
        }
    }

    pub fn into_body(self) -> Body {
        Body::new_source(Box::new(self))
    }

    fn handle_widget(&mut self, start: usize, end: usize, attrs: Vec<TagAttr>) {
        let mut request = InlineRequest::default();
        let mut display_none = false;
        for attr in &attrs {
            match &*attr.name {
                "type" => request.class_name = attr.value.clone(),
                "id" => request.id = Some(attr.value.clone()),
                "view" => request.view_name = Some(attr.value.clone()),
                "args" => request.path_info = attr.value.clone(),
                "display" => display_none = attr.value == "none",
                _ => {}
            }
        }
        if request.class_name.is_empty() || display_none {
            // 没有类别名的标签直接抹掉
            let _ = self.replace.add(start, end, Body::empty());
            return;
        }

        let child = self
            .tree
            .add_child(self.parent, &request.class_name, request.id.clone());
        let child_path = self.tree.path(child);

        // 聚焦的部件带上请求侧的 path_info
        if self.env.focus.as_deref() == Some(child_path.as_str()) {
            self.tree.get_mut(child).focused = true;
            if let Some(path_info) = &self.env.focus_path_info {
                request.path_info = path_info.clone();
            }
        }

        let body = spawn_inline_widget(self.env.inline.clone(), request);
        let _ = self.replace.add(start, end, body);
    }

    fn handle_tag(&mut self, name: String, attrs: Vec<TagAttr>, in_script: bool) {
        if in_script && !self.env.rewrite_script {
            return;
        }
        // meta refresh 的 content 里藏着一个 url
        if name == "meta" {
            let refresh = attrs.iter().any(|a| {
                a.name == "http-equiv" && a.value.eq_ignore_ascii_case("refresh")
            });
            if refresh {
                if let Some(content) = attrs.iter().find(|a| a.name == "content") {
                    self.rewrite_meta_refresh(content);
                }
            }
            return;
        }

        let context = match self.env.context_widget {
            Some(v) => v,
            None => {
                // 顶层模板只动显式标了 beng:mode 的属性
                if !attrs.iter().any(|a| a.name == "beng:mode") {
                    return;
                }
                self.parent
            }
        };

        let explicit_mode = attrs
            .iter()
            .find(|a| a.name == "beng:mode")
            .and_then(|a| RewriteMode::parse(&a.value));

        for attr in &attrs {
            let mode = match explicit_mode {
                // 显式标了模式就不看标签名, 只要是 URI 属性
                Some(m) => {
                    if is_uri_attr(&attr.name) {
                        m
                    } else {
                        continue;
                    }
                }
                None => match default_uri_mode(&name, &attr.name) {
                    Some(m) => m,
                    None => continue,
                },
            };
            if attr.value.is_empty() || is_absolute_uri(&attr.value) {
                continue;
            }
            if let Some(rewritten) =
                crate::rewrite_widget_uri(&self.env.rewrite, &self.tree, context, mode, &attr.value)
            {
                let _ = self.replace.add(
                    attr.value_start,
                    attr.value_end,
                    Body::from(html_escape_str(&rewritten)),
                );
            }
        }
    }

    fn rewrite_meta_refresh(&mut self, content: &TagAttr) {
        let lower = content.value.to_ascii_lowercase();
        let url_pos = match lower.find("url=") {
            Some(v) => v,
            None => return,
        };
        let url = &content.value[url_pos + 4..];
        if url.is_empty() || is_absolute_uri(url) {
            return;
        }
        let context = match self.env.context_widget {
            Some(v) => v,
            None => return,
        };
        if let Some(rewritten) = crate::rewrite_widget_uri(
            &self.env.rewrite,
            &self.tree,
            context,
            RewriteMode::Focus,
            url,
        ) {
            let _ = self.replace.add(
                content.value_start + url_pos + 4,
                content.value_end,
                Body::from(html_escape_str(&rewritten)),
            );
        }
    }

    fn handle_token(&mut self, start: usize, end: usize, name: &str) {
        let value = match self.env.context_value(name) {
            Some(v) => html_escape_str(v),
            None => String::new(),
        };
        let _ = self.replace.add(start, end, Body::from(value));
    }
}

fn is_uri_attr(attr: &str) -> bool {
    matches!(attr, "href" | "src" | "action" | "formaction" | "background")
}

fn is_absolute_uri(value: &str) -> bool {
    value.starts_with("http://")
        || value.starts_with("https://")
        || value.starts_with("//")
        || value.starts_with("data:")
        || value.starts_with("mailto:")
        || value.starts_with('#')
}

impl BodySource for ProcessorBody {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        loop {
            while !self.input_end {
                match self.input.poll_data(cx) {
                    Poll::Ready(Ok((is_end, bin))) => {
                        self.replace.append(bin.chunk());
                        let events = self.parser.feed(bin.chunk());
                        for event in events {
                            match event {
                                HtmlEvent::WidgetTag { start, end, attrs } => {
                                    self.handle_widget(start, end, attrs)
                                }
                                HtmlEvent::Tag {
                                    name,
                                    attrs,
                                    in_script,
                                } => self.handle_tag(name, attrs, in_script),
                                HtmlEvent::ContextToken { start, end, name } => {
                                    self.handle_token(start, end, &name)
                                }
                            }
                        }
                        if is_end {
                            self.input_end = true;
                            self.parser.finish();
                            self.replace.finish();
                        } else {
                            let boundary = self.parser.settle_boundary();
                            self.replace.settle(boundary);
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => break,
                }
            }
            match self.replace.poll_output(cx) {
                Poll::Ready(v) => return Poll::Ready(v),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// 入口: 处理一个 HTML 流
pub struct Processor;

impl Processor {
    pub fn process(
        input: Body,
        env: Arc<ProcessorEnv>,
        tree: WidgetTree,
        parent: WidgetRef,
    ) -> Body {
        ProcessorBody::new(input, env, tree, parent).into_body()
    }
}
