//! FastCGI record codec
//!
//! Covers the responder role only, one request per connection. The client
//! half is used by the bridge; the server half (`read_request` and
//! [`ResponseWriter`]) backs the bundled echo worker and tests.

use crate::error::ProtocolError;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, LOCATION};
use hyper::StatusCode;
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
/// Largest content a single record can carry
pub const MAX_CONTENT_LEN: usize = 65535;

/// Request id used for the single request on each connection
pub const REQUEST_ID: u16 = 1;

pub const ROLE_RESPONDER: u16 = 1;
const FLAG_KEEP_CONN: u8 = 1;

const REQUEST_COMPLETE: u8 = 0;

/// Bound on the CGI header block a worker may send
const MAX_HEADER_BLOCK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    Other(u8),
}

impl RecordType {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            other => RecordType::Other(other),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Other(other) => other,
        }
    }
}

/// A decoded record
#[derive(Debug, Clone)]
pub struct Record {
    pub record_type: RecordType,
    pub request_id: u16,
    pub content: Bytes,
}

/// Write one record, padded to an 8-byte boundary. `content` must fit in a
/// single record.
async fn write_single<W>(writer: &mut W, record_type: RecordType, request_id: u16, content: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let padding = (8 - content.len() % 8) % 8;
    let len = content.len() as u16;
    let header = [
        VERSION_1,
        record_type.as_u8(),
        (request_id >> 8) as u8,
        request_id as u8,
        (len >> 8) as u8,
        len as u8,
        padding as u8,
        0,
    ];
    writer.write_all(&header).await?;
    writer.write_all(content).await?;
    if padding > 0 {
        writer.write_all(&[0u8; 8][..padding]).await?;
    }
    Ok(())
}

/// Write a stream payload as as many records as needed. An empty payload
/// writes the empty record that terminates the stream.
pub async fn write_stream<W>(writer: &mut W, record_type: RecordType, request_id: u16, content: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if content.is_empty() {
        return write_single(writer, record_type, request_id, &[]).await;
    }
    for chunk in content.chunks(MAX_CONTENT_LEN) {
        write_single(writer, record_type, request_id, chunk).await?;
    }
    Ok(())
}

pub async fn write_begin_request<W>(writer: &mut W, request_id: u16, keep_conn: bool) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let flags = if keep_conn { FLAG_KEEP_CONN } else { 0 };
    let body = [
        (ROLE_RESPONDER >> 8) as u8,
        ROLE_RESPONDER as u8,
        flags,
        0,
        0,
        0,
        0,
        0,
    ];
    write_single(writer, RecordType::BeginRequest, request_id, &body).await
}

pub async fn write_end_request<W>(writer: &mut W, request_id: u16, app_status: u32) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut body = [0u8; 8];
    body[..4].copy_from_slice(&app_status.to_be_bytes());
    body[4] = REQUEST_COMPLETE;
    write_single(writer, RecordType::EndRequest, request_id, &body).await
}

/// Send the environment as PARAMS records followed by the empty terminator
pub async fn write_params<W>(writer: &mut W, request_id: u16, params: &[(String, String)]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_params(params);
    if !encoded.is_empty() {
        write_stream(writer, RecordType::Params, request_id, &encoded).await?;
    }
    write_stream(writer, RecordType::Params, request_id, &[]).await
}

fn encode_length(buf: &mut Vec<u8>, len: usize) {
    if len < 128 {
        buf.push(len as u8);
    } else {
        buf.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

/// Encode name-value pairs in the FastCGI length-prefixed format
pub fn encode_params(params: &[(String, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (name, value) in params {
        encode_length(&mut buf, name.len());
        encode_length(&mut buf, value.len());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    buf
}

fn decode_length(buf: &[u8], pos: &mut usize) -> Result<usize, ProtocolError> {
    let first = *buf
        .get(*pos)
        .ok_or_else(|| ProtocolError::Malformed("truncated parameter length".into()))?;
    if first & 0x80 == 0 {
        *pos += 1;
        return Ok(first as usize);
    }
    let bytes = buf
        .get(*pos..*pos + 4)
        .ok_or_else(|| ProtocolError::Malformed("truncated parameter length".into()))?;
    *pos += 4;
    Ok((u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x7fff_ffff) as usize)
}

/// Decode a complete PARAMS stream
pub fn decode_params(buf: &[u8]) -> Result<Vec<(String, String)>, ProtocolError> {
    let mut params = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let name_len = decode_length(buf, &mut pos)?;
        let value_len = decode_length(buf, &mut pos)?;
        let end = pos + name_len + value_len;
        if end > buf.len() {
            return Err(ProtocolError::Malformed("parameter overruns record".into()));
        }
        let name = String::from_utf8_lossy(&buf[pos..pos + name_len]).into_owned();
        let value = String::from_utf8_lossy(&buf[pos + name_len..end]).into_owned();
        params.push((name, value));
        pos = end;
    }
    Ok(params)
}

/// Read one record. `Ok(None)` means the peer closed the connection cleanly
/// between records.
pub async fn read_record<R>(reader: &mut R) -> Result<Option<Record>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated);
        }
        filled += n;
    }

    if header[0] != VERSION_1 {
        return Err(ProtocolError::Malformed(format!(
            "unsupported protocol version {}",
            header[0]
        )));
    }

    let record_type = RecordType::from_u8(header[1]);
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding_len = header[6] as usize;

    let mut content = vec![0u8; content_len + padding_len];
    reader.read_exact(&mut content).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        }
    })?;
    content.truncate(content_len);

    Ok(Some(Record {
        record_type,
        request_id,
        content: Bytes::from(content),
    }))
}

/// Status and headers from the start of a CGI response
#[derive(Debug)]
pub struct CgiHead {
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

fn find_header_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    for i in from..buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, i + 4));
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, i + 2));
        }
    }
    None
}

/// Parse the CGI header block at the start of `buf`. Returns `Ok(None)` while
/// the block is incomplete; otherwise the head and the offset where the body
/// starts. `Status:` sets the status, a `Location:` without one implies 302.
///
/// The blank line ending the block is searched for from `scan_from`. A caller
/// growing `buf` chunk by chunk passes the previous length minus 3, so each
/// byte is scanned a bounded number of times.
pub fn parse_cgi_head(buf: &[u8], scan_from: usize) -> Result<Option<(CgiHead, usize)>, ProtocolError> {
    let Some((end, body_start)) = find_header_end(buf, scan_from) else {
        if buf.len() > MAX_HEADER_BLOCK {
            return Err(ProtocolError::Malformed("header block too large".into()));
        }
        return Ok(None);
    };

    let block = std::str::from_utf8(&buf[..end])
        .map_err(|_| ProtocolError::Malformed("header block is not valid UTF-8".into()))?;

    let mut status = None;
    let mut headers = Vec::new();
    for line in block.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::Malformed(format!("invalid header line {:?}", line)))?;
        let value = value.trim();

        if name.eq_ignore_ascii_case("status") {
            let code = value.get(..3).unwrap_or(value);
            let parsed = code
                .parse::<u16>()
                .ok()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| ProtocolError::Malformed(format!("invalid status {:?}", value)))?;
            status = Some(parsed);
            continue;
        }

        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ProtocolError::Malformed(format!("invalid header name {:?}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ProtocolError::Malformed(format!("invalid value for header {}", name)))?;
        headers.push((name, value));
    }

    let status = status.unwrap_or_else(|| {
        if headers.iter().any(|(name, _)| *name == LOCATION) {
            StatusCode::FOUND
        } else {
            StatusCode::OK
        }
    });

    Ok(Some((CgiHead { status, headers }, body_start)))
}

/// A request as seen by a responder
#[derive(Debug)]
pub struct Request {
    pub request_id: u16,
    pub keep_conn: bool,
    pub params: HashMap<String, String>,
    pub stdin: Vec<u8>,
}

/// Read a full request (begin, params, stdin) from the gateway side
pub async fn read_request<R>(reader: &mut R) -> Result<Request, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut begun: Option<(u16, bool)> = None;
    let mut params_buf = Vec::new();
    let mut params_done = false;
    let mut stdin = Vec::new();

    loop {
        let record = read_record(reader).await?.ok_or(ProtocolError::Truncated)?;
        match record.record_type {
            RecordType::BeginRequest => {
                if record.content.len() < 3 {
                    return Err(ProtocolError::Malformed("short begin request".into()));
                }
                let role = u16::from_be_bytes([record.content[0], record.content[1]]);
                if role != ROLE_RESPONDER {
                    return Err(ProtocolError::Malformed(format!("unsupported role {}", role)));
                }
                begun = Some((record.request_id, record.content[2] & FLAG_KEEP_CONN != 0));
            }
            RecordType::Params if begun.is_some() => {
                if record.content.is_empty() {
                    params_done = true;
                } else {
                    params_buf.extend_from_slice(&record.content);
                }
            }
            RecordType::Stdin if params_done => {
                if record.content.is_empty() {
                    break;
                }
                stdin.extend_from_slice(&record.content);
            }
            RecordType::AbortRequest => {
                return Err(ProtocolError::Malformed("request aborted".into()));
            }
            other => {
                return Err(ProtocolError::Malformed(format!("unexpected {:?} record", other)));
            }
        }
    }

    let (request_id, keep_conn) = begun.ok_or_else(|| ProtocolError::Malformed("missing begin request".into()))?;
    Ok(Request {
        request_id,
        keep_conn,
        params: decode_params(&params_buf)?.into_iter().collect(),
        stdin,
    })
}

/// Writes the responder's side of one request
pub struct ResponseWriter<W> {
    writer: W,
    request_id: u16,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    pub fn new(writer: W, request_id: u16) -> Self {
        Self { writer, request_id }
    }

    pub async fn stdout(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        write_stream(&mut self.writer, RecordType::Stdout, self.request_id, data).await
    }

    pub async fn stderr(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        write_stream(&mut self.writer, RecordType::Stderr, self.request_id, data).await
    }

    /// Close the output streams and end the request
    pub async fn finish(mut self, app_status: u32) -> io::Result<W> {
        write_stream(&mut self.writer, RecordType::Stdout, self.request_id, &[]).await?;
        write_end_request(&mut self.writer, self.request_id, app_status).await?;
        self.writer.flush().await?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_param_lengths_use_long_form_above_127() {
        let long = "x".repeat(200);
        let encoded = encode_params(&pairs(&[("A", "b"), ("LONG", &long)]));

        assert_eq!(&encoded[..4], &[1, 1, b'A', b'b']);
        assert_eq!(encoded[4], 4);
        assert_eq!(&encoded[5..9], &[0x80, 0, 0, 200]);
        assert_eq!(decode_params(&encoded).unwrap(), pairs(&[("A", "b"), ("LONG", &long)]));
    }

    #[test]
    fn test_decode_params_rejects_overrun() {
        assert!(decode_params(&[5, 5, b'a']).is_err());
    }

    #[tokio::test]
    async fn test_records_are_padded_and_split() {
        let payload = vec![7u8; MAX_CONTENT_LEN + 10];
        let mut buf = Vec::new();
        write_stream(&mut buf, RecordType::Stdin, REQUEST_ID, &payload).await.unwrap();

        let mut reader = buf.as_slice();
        let first = read_record(&mut reader).await.unwrap().unwrap();
        let second = read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.content.len(), MAX_CONTENT_LEN);
        assert_eq!(second.content.len(), 10);
        assert_eq!(second.record_type, RecordType::Stdin);
        assert!(read_record(&mut reader).await.unwrap().is_none());
        assert_eq!(buf.len() % 8, 0);
    }

    #[tokio::test]
    async fn test_read_record_truncated_header() {
        let mut reader: &[u8] = &[1, 6, 0];
        assert!(matches!(read_record(&mut reader).await, Err(ProtocolError::Truncated)));
    }

    #[tokio::test]
    async fn test_read_request_round_trip() {
        let mut buf = Vec::new();
        write_begin_request(&mut buf, REQUEST_ID, false).await.unwrap();
        write_params(&mut buf, REQUEST_ID, &pairs(&[("REQUEST_METHOD", "POST"), ("CONTENT_LENGTH", "3")]))
            .await
            .unwrap();
        write_stream(&mut buf, RecordType::Stdin, REQUEST_ID, b"2+2").await.unwrap();
        write_stream(&mut buf, RecordType::Stdin, REQUEST_ID, &[]).await.unwrap();

        let request = read_request(&mut buf.as_slice()).await.unwrap();
        assert_eq!(request.request_id, REQUEST_ID);
        assert!(!request.keep_conn);
        assert_eq!(request.params["REQUEST_METHOD"], "POST");
        assert_eq!(request.stdin, b"2+2");
    }

    #[tokio::test]
    async fn test_response_writer_output() {
        let mut writer = ResponseWriter::new(Vec::new(), REQUEST_ID);
        writer.stderr(b"warming up").await.unwrap();
        writer.stdout(b"Status: 200 OK\r\n\r\n4").await.unwrap();
        let buf = writer.finish(0).await.unwrap();

        let mut reader = buf.as_slice();
        let mut types = Vec::new();
        while let Some(record) = read_record(&mut reader).await.unwrap() {
            types.push(record.record_type);
        }
        assert_eq!(
            types,
            vec![
                RecordType::Stderr,
                RecordType::Stdout,
                RecordType::Stdout,
                RecordType::EndRequest
            ]
        );
    }

    #[test]
    fn test_parse_cgi_head_incomplete() {
        assert!(parse_cgi_head(b"Content-Type: text/plain\r\n", 0).unwrap().is_none());
    }

    #[test]
    fn test_parse_cgi_head_defaults_to_200() {
        let (head, body_start) = parse_cgi_head(b"Content-Type: text/plain\r\n\r\nhello", 0)
            .unwrap()
            .unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.headers[0].0, "content-type");
        assert_eq!(body_start, 28);
    }

    #[test]
    fn test_parse_cgi_head_status_line() {
        let (head, _) = parse_cgi_head(b"Status: 404 Not Found\nContent-Type: text/plain\n\n", 0)
            .unwrap()
            .unwrap();
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert!(head.headers.iter().all(|(name, _)| name != "status"));
    }

    #[test]
    fn test_parse_cgi_head_location_redirects() {
        let (head, _) = parse_cgi_head(b"Location: /login\r\n\r\n", 0).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::FOUND);
    }

    #[test]
    fn test_parse_cgi_head_rejects_garbage() {
        assert!(parse_cgi_head(b"not a header\r\n\r\n", 0).is_err());
        assert!(parse_cgi_head(b"Status: abc\r\n\r\n", 0).is_err());
    }

    #[test]
    fn test_parse_cgi_head_byte_by_byte() {
        let raw = b"Status: 201 Created\r\nX-Id: 7\r\n\r\nbody";
        let mut buf = Vec::new();
        let mut parsed = None;
        for &byte in raw.iter() {
            let scan_from = buf.len().saturating_sub(3);
            buf.push(byte);
            if let Some(found) = parse_cgi_head(&buf, scan_from).unwrap() {
                parsed = Some(found);
                break;
            }
        }

        let (head, body_start) = parsed.expect("terminator split across chunks is found");
        assert_eq!(head.status, StatusCode::CREATED);
        assert_eq!(head.headers.len(), 1);
        assert_eq!(buf.len(), body_start, "found as soon as the blank line completes");
    }
}
