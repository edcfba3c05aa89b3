use std::task::{ready, Context, Poll};

use webparse::{Binary, BinaryMut, Buf, BufMut};

use crate::{ProtResult, Body, BodySource};

/// 转义 HTML 里的五个危险字符
pub fn html_escape(data: &[u8], out: &mut BinaryMut) {
    for b in data {
        match b {
            b'&' => out.put_slice(b"&amp;"),
            b'<' => out.put_slice(b"&lt;"),
            b'>' => out.put_slice(b"&gt;"),
            b'"' => out.put_slice(b"&quot;"),
            b'\'' => out.put_slice(b"&#39;"),
            _ => out.put_slice(&[*b]),
        };
    }
}

pub fn html_escape_str(value: &str) -> String {
    let mut out = BinaryMut::new();
    html_escape(value.as_bytes(), &mut out);
    String::from_utf8_lossy(out.chunk()).to_string()
}

/// 透传并转义的流
pub struct HtmlEscapeBody {
    input: Body,
}

impl HtmlEscapeBody {
    pub fn new(input: Body) -> Self {
        Self { input }
    }

    pub fn into_body(input: Body) -> Body {
        Body::new_source(Box::new(HtmlEscapeBody::new(input)))
    }
}

impl BodySource for HtmlEscapeBody {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        let (is_end, bin) = ready!(self.input.poll_data(cx))?;
        let mut out = BinaryMut::new();
        html_escape(bin.chunk(), &mut out);
        Poll::Ready(Ok((is_end, out.freeze())))
    }

    fn origin_len(&self) -> Option<u64> {
        // 转义会放大长度, 无法预知
        None
    }
}
