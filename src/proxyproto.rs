use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use eyre::{bail, eyre, Result, WrapErr};
use tokio::io::{AsyncRead, AsyncReadExt};

const SIG_V2: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

// A v1 line is at most 107 bytes including the terminator.
const V1_LIMIT: usize = 107;

/// Consume a PROXY protocol v1 or v2 preamble from the front of `stream`,
/// returning the originating client address. Reads exactly the preamble and
/// nothing past it, so the SSH byte stream that follows is untouched.
/// `None` means the proxy marked the connection UNKNOWN/LOCAL.
pub async fn accept<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<SocketAddr>> {
    let mut head = [0u8; 6];
    stream
        .read_exact(&mut head)
        .await
        .wrap_err("connection closed before a PROXY preamble")?;

    if head == *b"PROXY " {
        let mut line = Vec::with_capacity(V1_LIMIT);

        loop {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await?;
            line.push(byte[0]);

            if byte[0] == b'\n' {
                break;
            }

            if line.len() > V1_LIMIT {
                bail!("oversized PROXY v1 preamble");
            }
        }

        return parse_v1(&line);
    }

    if head == SIG_V2[..6] {
        let mut rest = [0u8; 10];
        stream.read_exact(&mut rest).await?;

        if rest[..6] != SIG_V2[6..] {
            bail!("malformed PROXY v2 signature");
        }

        let (version_command, family) = (rest[6], rest[7]);
        let length = usize::from(u16::from_be_bytes([rest[8], rest[9]]));

        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await?;

        return parse_v2(version_command, family, &body);
    }

    bail!("expected a PROXY protocol preamble");
}

// The line as received after the "PROXY " prefix, terminator included.
fn parse_v1(line: &[u8]) -> Result<Option<SocketAddr>> {
    let line = std::str::from_utf8(line)
        .wrap_err("PROXY v1 preamble is not ascii")?
        .trim_end_matches(['\r', '\n']);

    let mut fields = line.split(' ');

    match fields.next() {
        Some("UNKNOWN") => Ok(None),
        Some("TCP4" | "TCP6") => {
            let source: IpAddr = fields
                .next()
                .ok_or_else(|| eyre!("missing source address"))?
                .parse()?;

            // Destination address and port follow; only the source matters
            // here, but the fields must be present and well-formed.
            let _destination: IpAddr = fields
                .next()
                .ok_or_else(|| eyre!("missing destination address"))?
                .parse()?;

            let port: u16 = fields
                .next()
                .ok_or_else(|| eyre!("missing source port"))?
                .parse()?;

            let _destination_port: u16 = fields
                .next()
                .ok_or_else(|| eyre!("missing destination port"))?
                .parse()?;

            Ok(Some(SocketAddr::new(source, port)))
        }
        other => bail!("unsupported PROXY v1 protocol: {other:?}"),
    }
}

fn parse_v2(version_command: u8, family: u8, body: &[u8]) -> Result<Option<SocketAddr>> {
    if version_command >> 4 != 2 {
        bail!("unsupported PROXY v2 version: {version_command:#04x}");
    }

    // LOCAL: health checks and the like; no address to report.
    if version_command & 0x0F == 0 {
        return Ok(None);
    }

    match family >> 4 {
        // AF_INET: src4 dst4 sport dport
        1 => {
            if body.len() < 12 {
                bail!("short PROXY v2 body for TCP4");
            }

            let source = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[8], body[9]]);

            Ok(Some(SocketAddr::new(IpAddr::V4(source), port)))
        }
        // AF_INET6: src16 dst16 sport dport
        2 => {
            if body.len() < 36 {
                bail!("short PROXY v2 body for TCP6");
            }

            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[..16]);
            let port = u16::from_be_bytes([body[32], body[33]]);

            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn v1_preamble_yields_the_source() {
        let mut input: &[u8] = b"PROXY TCP4 192.168.0.7 10.0.0.1 56324 2222\r\nSSH-2.0-x";

        let source = accept(&mut input).await.unwrap();

        assert_eq!(source, Some("192.168.0.7:56324".parse().unwrap()));
        // The SSH identification string must be left in the stream.
        assert_eq!(input, b"SSH-2.0-x");
    }

    #[tokio::test]
    async fn v1_unknown_yields_no_source() {
        let mut input: &[u8] = b"PROXY UNKNOWN\r\n";

        assert_eq!(accept(&mut input).await.unwrap(), None);
    }

    #[tokio::test]
    async fn v2_preamble_yields_the_source() {
        let mut input = Vec::from(SIG_V2);
        input.push(0x21); // PROXY
        input.push(0x11); // TCP over IPv4
        input.extend_from_slice(&12u16.to_be_bytes());
        input.extend_from_slice(&[192, 168, 0, 7]); // source
        input.extend_from_slice(&[10, 0, 0, 1]); // destination
        input.extend_from_slice(&56324u16.to_be_bytes());
        input.extend_from_slice(&2222u16.to_be_bytes());
        input.extend_from_slice(b"SSH-2.0-x");

        let mut stream = input.as_slice();
        let source = accept(&mut stream).await.unwrap();

        assert_eq!(source, Some("192.168.0.7:56324".parse().unwrap()));
        assert_eq!(stream, b"SSH-2.0-x");
    }

    #[tokio::test]
    async fn v2_local_yields_no_source() {
        let mut input = Vec::from(SIG_V2);
        input.push(0x20); // LOCAL
        input.push(0x00);
        input.extend_from_slice(&0u16.to_be_bytes());

        let mut stream = input.as_slice();
        assert_eq!(accept(&mut stream).await.unwrap(), None);
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let mut input: &[u8] = b"SSH-2.0-OpenSSH_9.7\r\n";

        assert!(accept(&mut input).await.is_err());
    }
}
