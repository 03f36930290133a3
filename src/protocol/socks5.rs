//! SOCKS5 engine: RFC 1928 CONNECT with method `0x00` (no authentication)
//! only. UDP ASSOCIATE and BIND are rejected cleanly with no upstream dial.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DuoproxyError, Result};

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;

/// The outcome of the pre-relay SOCKS5 exchange: the destination the client
/// asked to be CONNECTed to.
pub struct Socks5Request {
    pub destination: String,
}

/// Run states S0 (method negotiation) through S3 (port), returning the
/// composed `host:port` destination. Does not dial or write any reply past
/// the method-selection message — that's `write_reply`'s job, called after
/// the dispatcher has attempted the dial.
pub async fn negotiate<S>(stream: &mut S) -> Result<Socks5Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream).await?;
    read_request(stream).await
}

async fn negotiate_method<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let [ver, nmethods] = header;
    if ver != VERSION {
        return Err(DuoproxyError::ProtocolFramingError(format!(
            "unsupported SOCKS version {ver:#x}"
        )));
    }

    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    // Reply with no-auth unconditionally, even if the client did not offer
    // it — this matches the behaviour this implementation preserves rather
    // than rejecting with 0xFF (see the design notes' open question).
    stream.write_all(&[VERSION, 0x00]).await?;
    Ok(())
}

async fn read_request<S>(stream: &mut S) -> Result<Socks5Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [ver, cmd, _rsv, atyp] = header;

    if ver != VERSION {
        return Err(DuoproxyError::ProtocolFramingError(format!(
            "unsupported SOCKS version {ver:#x} in request"
        )));
    }
    if cmd != CMD_CONNECT {
        return Err(DuoproxyError::UnsupportedProtocolFeature(format!(
            "SOCKS5 command {cmd:#x} is not CONNECT"
        )));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            if len[0] == 0 {
                return Err(DuoproxyError::ProtocolFramingError(
                    "SOCKS5 domain length is zero".to_owned(),
                ));
            }
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| {
                DuoproxyError::ProtocolFramingError("SOCKS5 domain is not valid UTF-8".to_owned())
            })?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            return Err(DuoproxyError::UnsupportedProtocolFeature(format!(
                "unknown SOCKS5 ATYP {other:#x}"
            )));
        }
    };

    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    Ok(Socks5Request {
        destination: format!("{host}:{port}"),
    })
}

/// Write the dial-outcome reply. BND fields are always zeroed IPv4 form,
/// matching the source behaviour this implementation preserves.
pub async fn write_reply<S>(stream: &mut S, dial_succeeded: bool) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let rep = if dial_succeeded { REP_SUCCESS } else { REP_HOST_UNREACHABLE };
    let reply = [VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await?;
    Ok(())
}
