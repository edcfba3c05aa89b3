#![deny(rust_2018_idioms)]

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use webparse::{BinaryMut, Buf, Request};
    use wmgate::{AjpClient, AjpRequestInfo, Body, SocketLease};

    /// 读一个请求方向的包 (0x12 0x34 + 长度), 返回净载荷
    async fn read_packet(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x12);
        assert_eq!(header[1], 0x34);
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await.unwrap();
        payload
    }

    fn put_string(out: &mut Vec<u8>, value: &str) {
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }

    /// 响应方向的包: 'A' 'B' + 长度
    fn write_packet(out: &mut Vec<u8>, payload: &[u8]) {
        out.push(b'A');
        out.push(b'B');
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
    }

    /// 镜像服务: 校验 FORWARD_REQUEST 的逐字节编码,
    /// 用 GET_BODY_CHUNK 拉请求体, 再把同样的体发回去
    async fn run_mirror_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let forward = read_packet(&mut stream).await;
            // FORWARD_REQUEST + POST 的方法编码
            assert_eq!(forward[0], 2);
            assert_eq!(forward[1], 4);
            // protocol 字符串
            let proto_len = u16::from_be_bytes([forward[2], forward[3]]) as usize;
            assert_eq!(&forward[4..4 + proto_len], b"HTTP/1.1");
            // 属性表以 0xff 收尾
            assert_eq!(*forward.last().unwrap(), 0xff);

            // 拉请求体
            let mut get_chunk = vec![6u8];
            get_chunk.extend_from_slice(&8186u16.to_be_bytes());
            let mut out = vec![];
            write_packet(&mut out, &get_chunk);
            stream.write_all(&out).await.unwrap();

            // 第一个体包: u16 长度 + 数据
            let body = read_packet(&mut stream).await;
            let chunk_len = u16::from_be_bytes([body[0], body[1]]) as usize;
            assert_eq!(chunk_len, 3);
            assert_eq!(&body[2..5], b"bar");

            // 空体终结包
            let terminator = read_packet(&mut stream).await;
            assert!(terminator.is_empty());

            // SEND_HEADERS(200) + SEND_BODY_CHUNK("bar") + END_RESPONSE
            let mut headers = vec![4u8];
            headers.extend_from_slice(&200u16.to_be_bytes());
            put_string(&mut headers, "OK");
            headers.extend_from_slice(&1u16.to_be_bytes());
            headers.extend_from_slice(&0xA003u16.to_be_bytes());
            put_string(&mut headers, "3");

            let mut chunk = vec![3u8];
            chunk.extend_from_slice(&3u16.to_be_bytes());
            chunk.extend_from_slice(b"bar");

            let end = vec![5u8, 1];

            let mut out = vec![];
            write_packet(&mut out, &headers);
            write_packet(&mut out, &chunk);
            write_packet(&mut out, &end);
            stream.write_all(&out).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_ajp_roundtrip() {
        let addr = run_mirror_server().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let client = AjpClient::new(SocketLease::RawTcp(stream));

        let req: Request<Body> = Request::builder()
            .method("POST")
            .url(&*format!("http://{}/echo", addr))
            .header("Content-Type", "text/plain")
            .body(Body::from("bar"))
            .unwrap();

        let mut response = client
            .request(req, AjpRequestInfo::default())
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let mut out = BinaryMut::new();
        response.body_mut().read_all(&mut out).await.unwrap();
        assert_eq!(out.chunk(), b"bar");
    }

    #[tokio::test]
    async fn test_ajp_premature_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_packet(&mut stream).await;

            // 只发头, 宣告了 3 字节却直接挂断
            let mut headers = vec![4u8];
            headers.extend_from_slice(&200u16.to_be_bytes());
            put_string(&mut headers, "OK");
            headers.extend_from_slice(&1u16.to_be_bytes());
            headers.extend_from_slice(&0xA003u16.to_be_bytes());
            put_string(&mut headers, "3");
            let mut out = vec![];
            write_packet(&mut out, &headers);
            stream.write_all(&out).await.unwrap();
            let _ = stream.shutdown().await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = AjpClient::new(SocketLease::RawTcp(stream));
        let req: Request<Body> = Request::builder()
            .method("GET")
            .url(&*format!("http://{}/", addr))
            .body(Body::empty())
            .unwrap();
        let mut response = client
            .request(req, AjpRequestInfo::default())
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let mut out = BinaryMut::new();
        let result = loop {
            match std::future::poll_fn(|cx| response.body_mut().poll_data(cx)).await {
                Ok((true, bin)) => {
                    out.put_slice(bin.chunk());
                    break Ok(());
                }
                Ok((false, bin)) => {
                    out.put_slice(bin.chunk());
                }
                Err(e) => break Err(e),
            }
        };
        match result {
            Err(wmgate::ProtError::Protocol(message)) => {
                assert_eq!(message, "premature end of response");
            }
            other => panic!("expected premature end, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_ajp_rejects_unknown_length_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = AjpClient::new(SocketLease::RawTcp(stream));

        // 通道体没有已知长度
        let (_sender, receiver) = tokio::sync::mpsc::channel(1);
        let body = Body::new(receiver, webparse::BinaryMut::new(), false);
        let req: Request<Body> = Request::builder()
            .method("POST")
            .url(&*format!("http://{}/", addr))
            .body(body)
            .unwrap();
        let result = client.request(req, AjpRequestInfo::default()).await;
        assert!(matches!(result, Err(wmgate::ProtError::Protocol(_))));
        drop(listener);
    }
}
