pub(crate) mod ajp;
pub(crate) mod fcgi;
mod http1;
mod was;

pub use self::ajp::AjpClient;
pub use self::fcgi::FcgiClient;
pub use self::http1::HttpClient;
pub use self::was::WasClient;

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, ReadBuf},
    sync::mpsc::{channel, Receiver, Sender},
};
use webparse::{Binary, BinaryMut, BufMut};

use crate::{ProtError, ProtResult, Body, BodySource};

/// 大小写无关地取一个头的值
pub(crate) fn header_value(headers: &webparse::HeaderMap, name: &str) -> Option<String> {
    for (key, value) in headers.iter() {
        if key.to_string().eq_ignore_ascii_case(name) {
            return value.as_string();
        }
    }
    None
}

/// 找 CGI 头的结束位置, 返回头部(含分隔)总长
pub(crate) fn find_headers_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| data.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
}

/// 解析 CGI 风格的响应头, Status 头给状态码
pub(crate) fn parse_cgi_headers(data: &[u8]) -> ProtResult<(u16, Vec<(String, String)>)> {
    let text = String::from_utf8_lossy(data);
    let mut status = 200u16;
    let mut headers = vec![];
    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(ProtError::Protocol("malformed CGI header"))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            status = value
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or(ProtError::Protocol("malformed CGI status"))?;
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }
    Ok((status, headers))
}

/// 读一段数据进缓冲, 返回本次读到的字节数, 0 即对端关闭
pub(crate) async fn read_some<T: AsyncRead + Unpin>(
    io: &mut T,
    buf: &mut BinaryMut,
) -> io::Result<usize> {
    buf.reserve(8192);
    let n = std::future::poll_fn(|cx| {
        let mut read_buf = ReadBuf::uninit(buf.chunk_mut());
        match Pin::new(&mut *io).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    })
    .await?;
    unsafe {
        buf.advance_mut(n);
    }
    Ok(n)
}

/// 后端响应体的通道流: 与普通通道流不同, 载荷带错误位,
/// 半途出错能原样传到消费端; 发送端无疾而终视为响应提前截断.
pub struct BackendBody {
    receiver: Receiver<ProtResult<(bool, Binary)>>,
    ended: bool,
}

impl BackendBody {
    pub fn channel(buffer: usize) -> (Sender<ProtResult<(bool, Binary)>>, Body) {
        let (sender, receiver) = channel(buffer);
        (
            sender,
            Body::new_source(Box::new(BackendBody {
                receiver,
                ended: false,
            })),
        )
    }
}

impl BodySource for BackendBody {
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<ProtResult<(bool, Binary)>> {
        if self.ended {
            return Poll::Ready(Ok((true, Binary::new())));
        }
        match std::task::ready!(self.receiver.poll_recv(cx)) {
            Some(Ok((is_end, bin))) => {
                self.ended = is_end;
                Poll::Ready(Ok((is_end, bin)))
            }
            Some(Err(e)) => {
                self.ended = true;
                Poll::Ready(Err(e))
            }
            None => {
                self.ended = true;
                Poll::Ready(Err(ProtError::Protocol("premature end of response")))
            }
        }
    }
}
