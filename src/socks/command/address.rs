//! SOCKS5 address reader
//!
//! Parses the `ATYP`-tagged destination that follows a command header.

use crate::error::Socks5Error;
use crate::socks::consts::*;
use crate::socks::types::TargetAddr;
use anyhow::Result;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read `DST.ADDR` and `DST.PORT` for the given address type
///
/// Returns `Ok(None)` when the client closed the stream before the address
/// was complete; there is nobody left to reply to. An unknown address type
/// fails with [`Socks5Error::AddressTypeNotSupported`].
pub async fn read_address<R>(reader: &mut R, atyp: u8) -> Result<Option<TargetAddr>>
where
    R: AsyncRead + Unpin,
{
    match parse_address(reader, atyp).await {
        Ok(addr) => Ok(Some(addr)),
        Err(e) if is_eof(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_eof(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>()
        .map(|e| e.kind() == io::ErrorKind::UnexpectedEof)
        .unwrap_or(false)
}

async fn parse_address<R>(reader: &mut R, atyp: u8) -> Result<TargetAddr>
where
    R: AsyncRead + Unpin,
{
    match atyp {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            reader.read_exact(&mut addr).await?;
            let port = reader.read_u16().await?;
            Ok(TargetAddr::ipv4(Ipv4Addr::from(addr), port))
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            reader.read_exact(&mut domain).await?;
            let port = reader.read_u16().await?;

            if len == 0 {
                return Err(Socks5Error::InvalidDomain(String::new()).into());
            }
            let domain = String::from_utf8(domain).map_err(|e| {
                Socks5Error::InvalidDomain(String::from_utf8_lossy(e.as_bytes()).into_owned())
            })?;
            Ok(TargetAddr::domain(domain, port))
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut addr = [0u8; 16];
            reader.read_exact(&mut addr).await?;
            let port = reader.read_u16().await?;
            Ok(TargetAddr::ipv6(Ipv6Addr::from(addr), port))
        }

        other => Err(Socks5Error::AddressTypeNotSupported(other).into()),
    }
}
