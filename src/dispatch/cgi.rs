use std::process::Stdio;

use tokio::{io::AsyncWriteExt, process::Command};
use webparse::{BinaryMut, Buf, Request, Response};

use crate::{ProtError, ProtResult, Body, ChildAddress};

use crate::client::{find_headers_end, parse_cgi_headers, read_some, BackendBody};

/// CGI 后端: 起子进程, 环境变量表述请求, stdout 是 CGI 响应
pub async fn run_cgi(
    address: &ChildAddress,
    req: &mut Request<Body>,
    remote_addr: &str,
    server_name: &str,
) -> ProtResult<Response<Body>> {
    let path = req.path().clone();
    let (uri, query) = match path.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (path.clone(), req.url().query.clone().unwrap_or_default()),
    };

    let mut command = Command::new(&address.executable);
    command
        .args(&address.args)
        .env_clear()
        .env("GATEWAY_INTERFACE", "CGI/1.1")
        .env("SERVER_PROTOCOL", "HTTP/1.1")
        .env("REQUEST_METHOD", req.method().to_string())
        .env("REQUEST_URI", &path)
        .env("SCRIPT_NAME", if address.script_name.is_empty() { &uri } else { &address.script_name })
        .env("QUERY_STRING", &query)
        .env("DOCUMENT_ROOT", &address.document_root)
        .env("REMOTE_ADDR", remote_addr)
        .env("SERVER_NAME", server_name)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if !address.path_info.is_empty() {
        command.env("PATH_INFO", &address.path_info);
    }
    for (name, value) in &address.envs {
        command.env(name, value);
    }
    if let Some(len) = req.body().available() {
        if len > 0 {
            command.env("CONTENT_LENGTH", len.to_string());
        }
    }
    for (name, value) in req.headers().iter() {
        let lower = name.to_string().to_ascii_lowercase();
        match &*lower {
            "content-type" => {
                command.env("CONTENT_TYPE", value.as_string().unwrap_or_default());
            }
            "content-length" => {}
            _ => {
                let env = format!("HTTP_{}", lower.to_ascii_uppercase().replace('-', "_"));
                command.env(env, value.as_string().unwrap_or_default());
            }
        }
    }

    let mut child = command.spawn().map_err(ProtError::Connect)?;

    // 请求体灌进 stdin
    let mut stdin = child.stdin.take();
    let mut body = std::mem::replace(req.body_mut(), Body::empty());
    if let Some(stdin_pipe) = &mut stdin {
        loop {
            let (is_end, bin) = std::future::poll_fn(|cx| body.poll_data(cx)).await?;
            if bin.remaining() > 0 {
                stdin_pipe.write_all(bin.chunk()).await?;
            }
            if is_end {
                break;
            }
        }
    }
    drop(stdin);

    parse_child_output(child).await
}

/// 管道后端: 当前响应体从 stdin 进, stdout 出.
/// FILTER 变换用它来串联外部程序.
pub async fn run_pipe(address: &ChildAddress, mut input: Body) -> ProtResult<Body> {
    let mut command = Command::new(&address.executable);
    command
        .args(&address.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    for (name, value) in &address.envs {
        command.env(name, value);
    }
    let mut child = command.spawn().map_err(ProtError::Connect)?;

    let mut stdin = child.stdin.take();
    tokio::spawn(async move {
        if let Some(stdin_pipe) = &mut stdin {
            loop {
                let next = std::future::poll_fn(|cx| input.poll_data(cx)).await;
                match next {
                    Ok((is_end, bin)) => {
                        if bin.remaining() > 0 {
                            if stdin_pipe.write_all(bin.chunk()).await.is_err() {
                                break;
                            }
                        }
                        if is_end {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    });

    let stdout = child
        .stdout
        .take()
        .ok_or(ProtError::Extension("no child stdout"))?;
    let (sender, out) = BackendBody::channel(30);
    tokio::spawn(async move {
        let mut stdout = stdout;
        let mut buf = BinaryMut::new();
        loop {
            match read_some(&mut stdout, &mut buf).await {
                Ok(0) => {
                    let _ = sender.send(Ok((true, webparse::Binary::new()))).await;
                    let _ = child.wait().await;
                    return;
                }
                Ok(_) => {
                    let data = webparse::Binary::from(buf.chunk().to_vec());
                    buf.advance_all();
                    if sender.send(Ok((false, data))).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = sender.send(Err(e.into())).await;
                    return;
                }
            }
        }
    });
    Ok(out)
}

/// 读子进程的 stdout, 拆出 CGI 头后把剩下的按流交付
async fn parse_child_output(mut child: tokio::process::Child) -> ProtResult<Response<Body>> {
    let mut stdout = child
        .stdout
        .take()
        .ok_or(ProtError::Extension("no child stdout"))?;
    let mut buf = BinaryMut::new();
    let (status, headers, leftover) = loop {
        let n = read_some(&mut stdout, &mut buf).await?;
        if n == 0 {
            return Err(ProtError::Protocol("premature end of CGI output"));
        }
        if let Some(pos) = find_headers_end(buf.chunk()) {
            let (status, headers) = parse_cgi_headers(&buf.chunk()[..pos])?;
            let leftover = webparse::Binary::from(buf.chunk()[pos..].to_vec());
            break (status, headers, leftover);
        }
        if buf.remaining() > 64 * 1024 {
            return Err(ProtError::Protocol("CGI headers too long"));
        }
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        builder = builder.header(name.clone(), value.clone());
    }
    let (sender, body) = BackendBody::channel(30);
    let response = builder.body(body).map_err(|e| ProtError::from(e))?;

    tokio::spawn(async move {
        if leftover.remaining() > 0 {
            if sender.send(Ok((false, leftover))).await.is_err() {
                return;
            }
        }
        let mut buf = BinaryMut::new();
        loop {
            match read_some(&mut stdout, &mut buf).await {
                Ok(0) => {
                    let _ = sender.send(Ok((true, webparse::Binary::new()))).await;
                    let _ = child.wait().await;
                    return;
                }
                Ok(_) => {
                    let data = webparse::Binary::from(buf.chunk().to_vec());
                    buf.advance_all();
                    if sender.send(Ok((false, data))).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = sender.send(Err(e.into())).await;
                    return;
                }
            }
        }
    });
    Ok(response)
}
