// 基于 reqwest 的分片传输
//
// 探测：test_method + 查询参数，状态码属于成功集合即视为服务器已有该分片。
// 上传：
// - multipart：元数据作为表单字段，分片数据作为文件字段
// - octet：元数据放在查询参数，请求体为原始字节流
// 请求体按小块流式写出，每写出一块回报一次已发送字节数。

use crate::config::{PayloadEncoding, UploadConfig};
use crate::uploader::transport::{
    ChunkMetadata, ChunkTransport, ProbeOutcome, ProgressReporter, TransportResponse,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Method};
use std::sync::Arc;
use tracing::debug;

/// 流式请求体的单块大小: 64KB
const STREAM_PIECE_SIZE: usize = 64 * 1024;

/// HTTP 分片传输
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: Arc<UploadConfig>,
}

impl HttpTransport {
    pub fn new(config: Arc<UploadConfig>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("创建 HTTP 客户端失败")?;
        Ok(Self { client, config })
    }

    fn method(name: &str) -> Result<Method> {
        Method::from_bytes(name.to_uppercase().as_bytes())
            .with_context(|| format!("无效的请求方法: {}", name))
    }

    /// 请求查询参数：`with_metadata` 为 true 时包含分片元数据
    fn query_pairs(&self, meta: &ChunkMetadata, with_metadata: bool) -> Vec<(String, String)> {
        let mut pairs = meta.query.clone();
        if with_metadata {
            pairs.extend(meta.parameters(&self.config.parameter_names));
        }
        pairs
    }

    fn header_map(meta: &ChunkMetadata) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &meta.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("无效的请求头名称: {}", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("无效的请求头值: {}", value))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// 把分片数据包装为流式请求体
    ///
    /// 进度在 reqwest 从流中取走一块数据时回报，此时数据只进入了发送缓冲区，
    /// 尚未确认写入 socket，回报值最多领先实际发送一个数据块加上连接缓冲区。
    /// 分片的最终状态只以响应为准。
    fn streaming_body(data: Vec<u8>, reporter: ProgressReporter) -> Body {
        let pieces: Vec<Vec<u8>> = data
            .chunks(STREAM_PIECE_SIZE)
            .map(<[u8]>::to_vec)
            .collect();

        let mut sent = 0u64;
        let stream = futures::stream::iter(pieces.into_iter().map(move |piece| {
            sent += piece.len() as u64;
            reporter.report(sent);
            Ok::<_, std::io::Error>(piece)
        }));

        Body::wrap_stream(stream)
    }
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn probe(&self, meta: &ChunkMetadata) -> Result<ProbeOutcome> {
        let response = self
            .client
            .request(Self::method(&self.config.test_method)?, &self.config.target)
            .query(&self.query_pairs(meta, true))
            .headers(Self::header_map(meta)?)
            .send()
            .await
            .context("探测分片请求发送失败")?;

        let status = response.status().as_u16();
        let present = self.config.is_success_status(status);

        debug!(
            "探测分片: identifier={}, chunk={}, status={}, 已存在={}",
            meta.identifier, meta.chunk_number, status, present
        );

        Ok(ProbeOutcome { present })
    }

    async fn send(
        &self,
        meta: &ChunkMetadata,
        data: Vec<u8>,
        reporter: ProgressReporter,
    ) -> Result<TransportResponse> {
        let size = data.len() as u64;
        let body = Self::streaming_body(data, reporter);

        let request = self
            .client
            .request(Self::method(&self.config.upload_method)?, &self.config.target)
            .headers(Self::header_map(meta)?);

        let request = match self.config.encoding {
            PayloadEncoding::Multipart => {
                let mut form = Form::new();
                for (name, value) in meta.parameters(&self.config.parameter_names) {
                    form = form.text(name, value);
                }
                let part = Part::stream_with_length(body, size)
                    .file_name(meta.file_name.clone())
                    .mime_str("application/octet-stream")
                    .context("构建分片表单失败")?;
                form = form.part(self.config.file_parameter_name.clone(), part);

                request
                    .query(&self.query_pairs(meta, false))
                    .multipart(form)
            }
            PayloadEncoding::Octet => request
                .query(&self.query_pairs(meta, true))
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, size)
                .body(body),
        };

        let response = request.send().await.context("上传分片请求发送失败")?;
        let status = response.status().as_u16();
        let body = response.text().await.context("读取上传分片响应失败")?;

        debug!(
            "上传分片响应: identifier={}, chunk={}/{}, size={} bytes, status={}",
            meta.identifier, meta.chunk_number, meta.total_chunks, size, status
        );

        Ok(TransportResponse::new(
            self.config.is_success_status(status),
            status,
            body,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterNames;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn meta() -> ChunkMetadata {
        ChunkMetadata {
            chunk_number: 1,
            chunk_size: 4,
            current_chunk_size: 4,
            total_size: 6,
            mime_type: "text/plain".to_string(),
            identifier: "6-atxt".to_string(),
            file_name: "a.txt".to_string(),
            relative_path: "a.txt".to_string(),
            total_chunks: 2,
            byte_range: 0..4,
            query: vec![("token".to_string(), "abc".to_string())],
            headers: vec![("X-Upload-Session".to_string(), "s1".to_string())],
        }
    }

    fn transport_to(target: &str, encoding: PayloadEncoding) -> HttpTransport {
        let config = UploadConfig {
            target: target.to_string(),
            encoding,
            parameter_names: ParameterNames {
                prefix: "r_".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        HttpTransport::new(Arc::new(config)).unwrap()
    }

    fn transport() -> HttpTransport {
        transport_to("http://127.0.0.1:9/upload", PayloadEncoding::Multipart)
    }

    /// 测试服务器收到的请求
    struct ReceivedRequest {
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl ReceivedRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        fn body_text(&self) -> String {
            String::from_utf8_lossy(&self.body).into_owned()
        }
    }

    /// 启动只处理一个请求的 HTTP 服务器，返回上传地址和收到的请求
    async fn serve_once(status: u16) -> (String, JoinHandle<ReceivedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/upload", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);

            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let mut parts = line.split_whitespace();
            let method = parts.next().unwrap().to_string();
            let path = parts.next().unwrap().to_string();

            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                let (name, value) = line.split_once(':').unwrap();
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }

            let mut request = ReceivedRequest {
                method,
                path,
                headers,
                body: Vec::new(),
            };

            if let Some(length) = request.header("content-length") {
                let mut body = vec![0u8; length.parse().unwrap()];
                reader.read_exact(&mut body).await.unwrap();
                request.body = body;
            } else if request.header("transfer-encoding") == Some("chunked") {
                loop {
                    let mut size_line = String::new();
                    reader.read_line(&mut size_line).await.unwrap();
                    let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
                    let mut piece = vec![0u8; size + 2];
                    reader.read_exact(&mut piece).await.unwrap();
                    if size == 0 {
                        break;
                    }
                    request.body.extend_from_slice(&piece[..size]);
                }
            }

            let response = format!(
                "HTTP/1.1 {} Test\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                status
            );
            let mut stream = reader.into_inner();
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.flush().await.unwrap();

            request
        });

        (url, handle)
    }

    #[test]
    fn test_query_pairs() {
        let transport = transport();
        let meta = meta();

        let plain = transport.query_pairs(&meta, false);
        assert_eq!(plain, vec![("token".to_string(), "abc".to_string())]);

        let full = transport.query_pairs(&meta, true);
        assert_eq!(full.len(), 10);
        assert_eq!(full[0], ("token".to_string(), "abc".to_string()));
        assert!(full.contains(&("r_resumableIdentifier".to_string(), "6-atxt".to_string())));
        assert!(full.contains(&("r_resumableTotalChunks".to_string(), "2".to_string())));
    }

    #[test]
    fn test_header_map() {
        let headers = HttpTransport::header_map(&meta()).unwrap();
        assert_eq!(headers.get("x-upload-session").unwrap(), "s1");

        let mut bad = meta();
        bad.headers = vec![("bad header".to_string(), "v".to_string())];
        assert!(HttpTransport::header_map(&bad).is_err());
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(HttpTransport::method("post").unwrap(), Method::POST);
        assert_eq!(HttpTransport::method("GET").unwrap(), Method::GET);
    }

    #[tokio::test]
    async fn test_send_to_unreachable_target_is_error() {
        let transport = transport();
        let result = transport
            .send(&meta(), b"abcd".to_vec(), ProgressReporter::detached())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_octet_send_puts_metadata_in_query() {
        let (url, server) = serve_once(200).await;
        let transport = transport_to(&url, PayloadEncoding::Octet);
        let reporter = ProgressReporter::detached();

        let response = transport
            .send(&meta(), b"abcd".to_vec(), reporter.clone())
            .await
            .unwrap();
        assert!(response.ok);
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "ok");
        assert_eq!(reporter.loaded(), Some(4));

        let request = server.await.unwrap();
        assert_eq!(request.method, "POST");
        assert!(request.path.starts_with("/upload?token=abc&"));
        assert!(request.path.contains("r_resumableChunkNumber=1"));
        assert!(request.path.contains("r_resumableTotalChunks=2"));
        assert!(request.path.contains("r_resumableIdentifier=6-atxt"));
        assert_eq!(request.header("content-type"), Some("application/octet-stream"));
        assert_eq!(request.header("x-upload-session"), Some("s1"));
        assert_eq!(request.body, b"abcd");
    }

    #[tokio::test]
    async fn test_multipart_send_puts_metadata_in_form() {
        let (url, server) = serve_once(201).await;
        let transport = transport_to(&url, PayloadEncoding::Multipart);

        let response = transport
            .send(&meta(), b"abcd".to_vec(), ProgressReporter::detached())
            .await
            .unwrap();
        assert!(response.ok);
        assert_eq!(response.status, 201);

        let request = server.await.unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/upload?token=abc");
        assert!(request
            .header("content-type")
            .unwrap()
            .starts_with("multipart/form-data; boundary="));

        let body = request.body_text();
        assert!(body.contains("name=\"r_resumableChunkNumber\"\r\n\r\n1\r\n"));
        assert!(body.contains("name=\"r_resumableIdentifier\"\r\n\r\n6-atxt\r\n"));
        assert!(body.contains("name=\"file\"; filename=\"a.txt\""));
        assert!(body.contains("\r\n\r\nabcd\r\n"));
    }

    #[tokio::test]
    async fn test_failed_status_is_not_ok() {
        let (url, server) = serve_once(415).await;
        let transport = transport_to(&url, PayloadEncoding::Octet);

        let response = transport
            .send(&meta(), b"abcd".to_vec(), ProgressReporter::detached())
            .await
            .unwrap();
        assert!(!response.ok);
        assert_eq!(response.status, 415);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_follows_success_statuses() {
        let (url, server) = serve_once(200).await;
        let outcome = transport_to(&url, PayloadEncoding::Multipart)
            .probe(&meta())
            .await
            .unwrap();
        assert!(outcome.present);

        let request = server.await.unwrap();
        assert_eq!(request.method, "GET");
        assert!(request.path.contains("token=abc"));
        assert!(request.path.contains("r_resumableChunkNumber=1"));
        assert_eq!(request.header("x-upload-session"), Some("s1"));

        let (url, server) = serve_once(404).await;
        let outcome = transport_to(&url, PayloadEncoding::Multipart)
            .probe(&meta())
            .await
            .unwrap();
        assert!(!outcome.present);
        server.await.unwrap();
    }
}
