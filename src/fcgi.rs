//! Minimal FastCGI responder client
//!
//! One connection carries exactly one request (id 1, no keep-alive flag):
//! BEGIN_REQUEST, the PARAMS stream, the STDIN stream, then STDOUT/STDERR
//! records are read until END_REQUEST arrives.

use crate::error::BackendError;
use hyper::body::Bytes;
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub const VERSION_1: u8 = 1;

pub const BEGIN_REQUEST: u8 = 1;
pub const END_REQUEST: u8 = 3;
pub const PARAMS: u8 = 4;
pub const STDIN: u8 = 5;
pub const STDOUT: u8 = 6;
pub const STDERR: u8 = 7;

pub const ROLE_RESPONDER: u16 = 1;

const REQUEST_ID: u16 = 1;
const HEADER_LEN: usize = 8;
const MAX_CONTENT_LEN: usize = 65535;

/// A single FastCGI record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_type: u8,
    pub request_id: u16,
    pub content: Vec<u8>,
}

/// Encode one record, padding the content to a multiple of 8 bytes
pub fn encode_record(record_type: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let padding = (8 - content.len() % 8) % 8;
    let mut buf = Vec::with_capacity(HEADER_LEN + content.len() + padding);
    buf.push(VERSION_1);
    buf.push(record_type);
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.extend_from_slice(&(content.len() as u16).to_be_bytes());
    buf.push(padding as u8);
    buf.push(0);
    buf.extend_from_slice(content);
    buf.resize(buf.len() + padding, 0);
    buf
}

/// Encode a stream of `content`, split into records, followed by the empty
/// record that terminates the stream
pub fn encode_stream(record_type: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    for chunk in content.chunks(MAX_CONTENT_LEN) {
        buf.extend(encode_record(record_type, request_id, chunk));
    }
    buf.extend(encode_record(record_type, request_id, &[]));
    buf
}

/// Read the next record, returning `None` on a clean end of stream
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Record>, BackendError> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    if header[0] != VERSION_1 {
        return Err(BackendError::Protocol(format!(
            "unsupported record version {}",
            header[0]
        )));
    }

    let record_type = header[1];
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding_len = header[6] as usize;

    let mut content = vec![0u8; content_len + padding_len];
    reader.read_exact(&mut content).await?;
    content.truncate(content_len);

    Ok(Some(Record {
        record_type,
        request_id,
        content,
    }))
}

fn encode_length(buf: &mut Vec<u8>, len: usize) {
    if len < 128 {
        buf.push(len as u8);
    } else {
        buf.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

/// Encode name/value pairs for the PARAMS stream
pub fn encode_params<'a, I>(params: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut buf = Vec::new();
    for (name, value) in params {
        encode_length(&mut buf, name.len());
        encode_length(&mut buf, value.len());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    buf
}

fn decode_length(data: &[u8], pos: &mut usize) -> Option<usize> {
    let first = *data.get(*pos)?;
    if first & 0x80 == 0 {
        *pos += 1;
        return Some(first as usize);
    }
    let bytes = data.get(*pos..*pos + 4)?;
    *pos += 4;
    Some((u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x7fff_ffff) as usize)
}

/// Decode a PARAMS stream back into name/value pairs
pub fn decode_params(data: &[u8]) -> Result<BTreeMap<String, String>, BackendError> {
    let mut params = BTreeMap::new();
    let mut pos = 0;
    while pos < data.len() {
        let malformed = || BackendError::Protocol("truncated name/value pair".to_string());
        let name_len = decode_length(data, &mut pos).ok_or_else(malformed)?;
        let value_len = decode_length(data, &mut pos).ok_or_else(malformed)?;
        let name = data.get(pos..pos + name_len).ok_or_else(malformed)?;
        pos += name_len;
        let value = data.get(pos..pos + value_len).ok_or_else(malformed)?;
        pos += value_len;
        params.insert(
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }
    Ok(params)
}

/// Content of a BEGIN_REQUEST record for the responder role
fn begin_request_body(role: u16, keep_conn: bool) -> [u8; 8] {
    let role = role.to_be_bytes();
    [role[0], role[1], keep_conn as u8, 0, 0, 0, 0, 0]
}

/// Parsed CGI response from a FastCGI application
#[derive(Debug, Clone)]
pub struct FcgiResponse {
    /// Header lines in the order the application sent them
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Split raw STDOUT into CGI header lines and body
pub fn parse_cgi_response(stdout: &[u8]) -> Result<FcgiResponse, BackendError> {
    let (head, body) = match find_header_end(stdout) {
        Some((head_end, body_start)) => (&stdout[..head_end], &stdout[body_start..]),
        None => {
            return Err(BackendError::Protocol(
                "response ended before the header block".to_string(),
            ))
        }
    };

    let mut headers = Vec::new();
    for line in String::from_utf8_lossy(head).lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| BackendError::Protocol(format!("malformed header line {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(FcgiResponse {
        headers,
        body: Bytes::copy_from_slice(body),
    })
}

/// Position of the blank line ending the header block, as (head end, body start)
fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    for i in 0..data.len() {
        if data[i..].starts_with(b"\r\n\r\n") {
            return Some((i, i + 4));
        }
        if data[i..].starts_with(b"\n\n") {
            return Some((i, i + 2));
        }
        if i == 0 && data.starts_with(b"\r\n") {
            return Some((0, 2));
        }
        if i == 0 && data.starts_with(b"\n") {
            return Some((0, 1));
        }
    }
    None
}

/// An open connection to a FastCGI application server
#[derive(Debug)]
pub struct FcgiClient {
    stream: TcpStream,
    addr: String,
}

impl FcgiClient {
    pub async fn dial(addr: &str) -> Result<Self, BackendError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| BackendError::Unavailable {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            addr: addr.to_string(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and read the complete response
    pub async fn request(
        mut self,
        params: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<FcgiResponse, BackendError> {
        let mut out = encode_record(BEGIN_REQUEST, REQUEST_ID, &begin_request_body(ROLE_RESPONDER, false));
        out.extend(encode_stream(PARAMS, REQUEST_ID, &encode_params(params)));
        out.extend(encode_stream(STDIN, REQUEST_ID, body));
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            let record = read_record(&mut self.stream).await?.ok_or_else(|| {
                BackendError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
            })?;
            if record.request_id != REQUEST_ID {
                continue;
            }
            match record.record_type {
                STDOUT => stdout.extend_from_slice(&record.content),
                STDERR => stderr.extend_from_slice(&record.content),
                END_REQUEST => break,
                other => debug!(addr = %self.addr, record_type = other, "Ignoring FastCGI record"),
            }
        }

        if !stderr.is_empty() {
            warn!(
                addr = %self.addr,
                stderr = %String::from_utf8_lossy(&stderr).trim_end(),
                "FastCGI application wrote to stderr"
            );
        }

        parse_cgi_response(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_record_padding() {
        let record = encode_record(STDOUT, 1, b"hello");
        assert_eq!(record.len(), 8 + 8);
        assert_eq!(record[0], VERSION_1);
        assert_eq!(record[1], STDOUT);
        assert_eq!(&record[2..4], &[0, 1]);
        assert_eq!(&record[4..6], &[0, 5]);
        assert_eq!(record[6], 3);
        assert_eq!(&record[8..13], b"hello");

        let aligned = encode_record(STDIN, 1, b"12345678");
        assert_eq!(aligned.len(), 16);
        assert_eq!(aligned[6], 0);
    }

    #[test]
    fn test_encode_stream_splits_large_content() {
        let content = vec![b'x'; MAX_CONTENT_LEN + 10];
        let encoded = encode_stream(STDIN, 1, &content);
        // full record (65535 + 1 padding), 10-byte record (+6 padding), terminator
        assert_eq!(encoded.len(), (8 + 65536) + (8 + 16) + 8);
    }

    #[test]
    fn test_params_long_values() {
        let mut params = BTreeMap::new();
        params.insert("SHORT".to_string(), "v".to_string());
        params.insert("LONG".to_string(), "y".repeat(300));
        let encoded = encode_params(&params);
        // "LONG" length byte, then 4-byte length with the high bit set
        assert_eq!(encoded[0], 4);
        assert_eq!(&encoded[1..5], &[0x80, 0, 1, 44]);
        assert_eq!(decode_params(&encoded).unwrap(), params);
    }

    #[test]
    fn test_decode_params_truncated() {
        assert!(decode_params(&[5, 1, b'a']).is_err());
    }

    #[tokio::test]
    async fn test_read_record() {
        let mut data = encode_record(STDOUT, 1, b"abc");
        data.extend(encode_record(END_REQUEST, 1, &[0; 8]));
        let mut reader = &data[..];

        let first = read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.record_type, STDOUT);
        assert_eq!(first.content, b"abc");
        let second = read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.record_type, END_REQUEST);
        assert!(read_record(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_record_bad_version() {
        let mut data = encode_record(STDOUT, 1, b"abc");
        data[0] = 9;
        let mut reader = &data[..];
        assert!(matches!(
            read_record(&mut reader).await,
            Err(BackendError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_cgi_response() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/html\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n<p>missing</p>";
        let response = parse_cgi_response(raw).unwrap();
        assert_eq!(response.headers.len(), 4);
        assert_eq!(response.headers[0], ("Status".to_string(), "404 Not Found".to_string()));
        assert_eq!(response.headers[3].1, "b=2");
        assert_eq!(&response.body[..], b"<p>missing</p>");
    }

    #[test]
    fn test_parse_cgi_response_lf_only() {
        let response = parse_cgi_response(b"Content-Type: text/plain\n\nok").unwrap();
        assert_eq!(response.headers[0].0, "Content-Type");
        assert_eq!(&response.body[..], b"ok");
    }

    #[test]
    fn test_parse_cgi_response_without_header_end() {
        assert!(parse_cgi_response(b"Content-Type: text/plain\r\n").is_err());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = FcgiClient::dial(&addr).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable { .. }));
    }
}
