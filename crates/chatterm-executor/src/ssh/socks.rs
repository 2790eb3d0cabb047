//! Server side of a SOCKS5 CONNECT handshake, no authentication.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::options::Endpoint;

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHOD: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

fn protocol_error(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("socks: {msg}"))
}

/// Negotiate a CONNECT request and return its target.
///
/// The caller must answer with [`reply`] once the target is (or is not)
/// reachable.
pub async fn handshake<S>(stream: &mut S) -> io::Result<Endpoint>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(protocol_error("unsupported version"));
    }
    let mut methods = vec![0u8; usize::from(header[1])];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&NO_AUTH) {
        stream.write_all(&[VERSION, NO_ACCEPTABLE_METHOD]).await?;
        return Err(protocol_error("no acceptable auth method"));
    }
    stream.write_all(&[VERSION, NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != VERSION {
        return Err(protocol_error("unsupported version"));
    }
    if request[1] != CMD_CONNECT {
        send_reply(stream, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(protocol_error("only CONNECT is supported"));
    }
    let host = match request[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| protocol_error("invalid domain name"))?
        }
        _ => {
            send_reply(stream, REP_ADDRESS_NOT_SUPPORTED).await?;
            return Err(protocol_error("unsupported address type"));
        }
    };
    let port = stream.read_u16().await?;
    Ok(Endpoint { host, port })
}

/// Answer a CONNECT request.
pub async fn reply<S>(stream: &mut S, connected: bool) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    send_reply(
        stream,
        if connected {
            REP_SUCCEEDED
        } else {
            REP_HOST_UNREACHABLE
        },
    )
    .await
}

async fn send_reply<S>(stream: &mut S, code: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await
}
