//! HTTP engine: parses a single HTTP/1.x request from the client, then
//! branches on method. `CONNECT` tunnels opaquely after a `200` reply; any
//! other method has its already-parsed request serialized verbatim to the
//! dialed upstream before the relay begins.
//!
//! The request-line/header parser is hand-rolled rather than pulled from a
//! full HTTP library: the engine must preserve any bytes the parser already
//! buffered past the header block so they can be replayed into the
//! upstream write, and a framework that owns the whole connection lifecycle
//! would hide that buffer.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{DuoproxyError, Result};

const BAD_GATEWAY_BODY: &str = "Bad Gateway";

/// What the HTTP engine produced after parsing the request.
pub enum HttpRequestKind {
    /// `CONNECT host:port HTTP/1.1` — tunnel opaquely once dialed.
    Connect { destination: String },
    /// Any other method — forward `preamble` to the upstream verbatim
    /// before relaying the rest of the connection.
    Forward {
        destination: String,
        preamble: Vec<u8>,
    },
}

/// Read and parse one HTTP/1.x request off a buffered client reader.
///
/// Takes the concrete `BufReader` rather than a generic `AsyncBufRead` so
/// that trailing bytes past the header block can be inspected via
/// `buffer()` — a pure peek at what's already in memory — instead of
/// `fill_buf()`, which would issue a fresh socket read and block forever on
/// a client that's done sending and is waiting on a response.
pub async fn parse_request<R>(reader: &mut BufReader<R>) -> Result<HttpRequestKind>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    let mut line = String::new();

    reader.read_line(&mut line).await?;
    if line.is_empty() {
        return Err(DuoproxyError::ProtocolFramingError(
            "connection closed before a request line was read".to_owned(),
        ));
    }
    raw.extend_from_slice(line.as_bytes());
    let request_line = line.trim_end_matches(['\r', '\n']).to_owned();

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| DuoproxyError::ProtocolFramingError("empty request line".to_owned()))?
        .to_owned();
    let target = parts
        .next()
        .ok_or_else(|| DuoproxyError::ProtocolFramingError("missing request target".to_owned()))?
        .to_owned();

    let mut host_header: Option<String> = None;
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(DuoproxyError::ProtocolFramingError(
                "connection closed before headers terminated".to_owned(),
            ));
        }
        raw.extend_from_slice(line.as_bytes());
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("host") {
                host_header = Some(value.trim().to_owned());
            }
        }
    }

    // Any bytes the buffered reader already pulled off the socket past the
    // blank line (e.g. the start of a request body) travel with the
    // preamble; consume them here so the relay's copy loop doesn't see them
    // twice. This only inspects what's already sitting in the buffer — it
    // must never trigger a fresh socket read, or a client that's waiting on
    // a response instead of sending more bytes would hang the parse forever.
    let already_buffered = reader.buffer().to_vec();
    reader.consume(already_buffered.len());
    raw.extend_from_slice(&already_buffered);

    if method.eq_ignore_ascii_case("CONNECT") {
        return Ok(HttpRequestKind::Connect { destination: target });
    }

    let destination = host_header.ok_or_else(|| {
        DuoproxyError::ProtocolFramingError("request has no Host header".to_owned())
    })?;
    let destination = if destination.contains(':') {
        destination
    } else {
        format!("{destination}:80")
    };

    Ok(HttpRequestKind::Forward {
        destination,
        preamble: raw,
    })
}

/// Write the `200 Connection established` line for a successful CONNECT dial.
pub async fn write_connect_established<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    Ok(())
}

/// Write a minimal `502 Bad Gateway` for a failed dial.
pub async fn write_bad_gateway<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = BAD_GATEWAY_BODY.as_bytes();
    let response = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    writer.write_all(response.as_bytes()).await?;
    writer.write_all(body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn parses_get_request_and_extracts_host_with_default_port() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            client
                .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n")
                .await
                .unwrap();
        });

        let mut reader = BufReader::new(server);
        let outcome = parse_request(&mut reader).await.unwrap();
        match outcome {
            HttpRequestKind::Forward { destination, preamble } => {
                assert_eq!(destination, "h:80");
                assert_eq!(
                    String::from_utf8(preamble).unwrap(),
                    "GET /x HTTP/1.1\r\nHost: h\r\n\r\n"
                );
            }
            HttpRequestKind::Connect { .. } => panic!("expected Forward"),
        }
    }

    #[tokio::test]
    async fn host_header_with_explicit_port_is_kept() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            client
                .write_all(b"GET / HTTP/1.1\r\nHost: h:9090\r\n\r\n")
                .await
                .unwrap();
        });

        let mut reader = BufReader::new(server);
        let outcome = parse_request(&mut reader).await.unwrap();
        match outcome {
            HttpRequestKind::Forward { destination, .. } => assert_eq!(destination, "h:9090"),
            HttpRequestKind::Connect { .. } => panic!("expected Forward"),
        }
    }

    #[tokio::test]
    async fn connect_method_uses_request_target_as_destination() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            client
                .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
                .await
                .unwrap();
        });

        let mut reader = BufReader::new(server);
        let outcome = parse_request(&mut reader).await.unwrap();
        match outcome {
            HttpRequestKind::Connect { destination } => assert_eq!(destination, "example.com:443"),
            HttpRequestKind::Forward { .. } => panic!("expected Connect"),
        }
    }

    #[tokio::test]
    async fn missing_host_header_on_non_connect_is_a_framing_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        });

        let mut reader = BufReader::new(server);
        let err = parse_request(&mut reader).await.unwrap_err();
        assert!(matches!(err, DuoproxyError::ProtocolFramingError(_)));
    }

    #[tokio::test]
    async fn bytes_buffered_past_the_header_block_travel_in_the_preamble() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            client
                .write_all(b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let mut reader = BufReader::new(server);
        let outcome = parse_request(&mut reader).await.unwrap();
        match outcome {
            HttpRequestKind::Forward { preamble, .. } => {
                assert!(String::from_utf8(preamble).unwrap().ends_with("hello"));
            }
            HttpRequestKind::Connect { .. } => panic!("expected Forward"),
        }
    }
}
