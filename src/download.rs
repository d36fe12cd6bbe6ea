//! HTTP(S) throughput probe over the tunnel stack.
//!
//! Fetches one large file from a built-in mirror list, dialing through the
//! tunnel, and reports bytes read plus elapsed time. The URL is picked with
//! a seedable RNG so tests can pin the selection. HTTPS wraps the tunnel
//! TCP connection in rustls with the Mozilla root set.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rand::Rng;
use rustls::pki_types::ServerName;
use url::Url;

use crate::device::NetTunnel;
use crate::error::{DownloadError, TunnelError};
use crate::sockets::IpVersion;

/// Bulk-download mirrors for IPv4 probes.
pub const DOWNLOAD_URLS_V4: &[&str] = &[
    "https://hil-speed.hetzner.com/100MB.bin",
    "https://nbg1-speed.hetzner.com/100MB.bin",
    "https://fsn1-speed.hetzner.com/100MB.bin",
    "https://ash-speed.hetzner.com/100MB.bin",
    "https://hel1-speed.hetzner.com/100MB.bin",
    "https://proof.ovh.net/files/100Mb.dat",
    "http://cachefly.cachefly.net/100mb.test",
    "https://sin-speed.hetzner.com/100MB.bin",
];

/// Bulk-download mirrors for IPv6 probes; https only.
pub const DOWNLOAD_URLS_V6: &[&str] = &[
    "https://hil-speed.hetzner.com/100MB.bin",
    "https://nbg1-speed.hetzner.com/100MB.bin",
    "https://fsn1-speed.hetzner.com/100MB.bin",
    "https://ash-speed.hetzner.com/100MB.bin",
    "https://hel1-speed.hetzner.com/100MB.bin",
    "https://proof.ovh.net/files/100Mb.dat",
    "https://sin-speed.hetzner.com/100MB.bin",
];

static TLS_CONFIG: Lazy<Arc<rustls::ClientConfig>> = Lazy::new(|| {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let roots =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

/// Pick a download URL for the address family.
pub fn choose_download_url<R: Rng>(version: IpVersion, rng: &mut R) -> &'static str {
    let urls = match version {
        IpVersion::V4 => DOWNLOAD_URLS_V4,
        IpVersion::V6 => DOWNLOAD_URLS_V6,
    };
    urls[rng.gen_range(0..urls.len())]
}

/// GET `url_str` through the tunnel with an overall `timeout` spanning
/// connect, TLS, request and body. Returns `(body_bytes, elapsed)`.
pub fn download_file(
    tunnel: &NetTunnel,
    url_str: &str,
    timeout: Duration,
    version: IpVersion,
) -> Result<(usize, Duration), DownloadError> {
    let url = Url::parse(url_str).map_err(|e| DownloadError::Url(e.to_string()))?;
    let https = match url.scheme() {
        "http" => false,
        "https" => true,
        other => return Err(DownloadError::Url(format!("unsupported scheme {other:?}"))),
    };
    let host = url
        .host_str()
        .ok_or_else(|| DownloadError::Url("missing host".into()))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| DownloadError::Url("missing port".into()))?;
    let path = if url.path().is_empty() { "/" } else { url.path() };

    let start = Instant::now();
    let deadline = start + timeout;

    let mut conn = tunnel
        .dial_tcp(&host, port, version, timeout)
        .map_err(|e| match e {
            TunnelError::Socket(io) => DownloadError::Connect(io),
            other => DownloadError::Connect(std::io::Error::new(
                std::io::ErrorKind::Other,
                other.to_string(),
            )),
        })?;
    conn.set_read_deadline(Some(deadline));
    conn.set_write_deadline(Some(deadline));

    let response = if https {
        let name = ServerName::try_from(host.clone())
            .map_err(|e| DownloadError::Tls(e.to_string()))?;
        let mut session = rustls::ClientConnection::new(TLS_CONFIG.clone(), name)
            .map_err(|e| DownloadError::Tls(e.to_string()))?;
        let mut stream = rustls::Stream::new(&mut session, &mut conn);
        fetch(&mut stream, &host, path)?
    } else {
        fetch(&mut conn, &host, path)?
    };
    conn.close();

    let status = parse_status(&response)?;
    if status != 200 {
        return Err(DownloadError::Status(status));
    }
    let body_len = body_length(&response)?;

    Ok((body_len, start.elapsed()))
}

/// Write the GET request and read the whole response. Timeouts surface as
/// `TimedOut` reads from the underlying connection; EOF-ish errors after
/// data has arrived end the body (the server side of `Connection: close`
/// teardown is not always graceful, TLS close_notify included).
fn fetch<S: Read + Write>(stream: &mut S, host: &str, path: &str) -> Result<Vec<u8>, DownloadError> {
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: wgnet-probe\r\nAccept: */*\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes())?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(DownloadError::Timeout);
            }
            Err(e)
                if !response.is_empty()
                    && matches!(
                        e.kind(),
                        std::io::ErrorKind::UnexpectedEof
                            | std::io::ErrorKind::ConnectionAborted
                            | std::io::ErrorKind::ConnectionReset
                    ) =>
            {
                break;
            }
            Err(e) => return Err(DownloadError::Io(e)),
        }
    }
    Ok(response)
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Status code from the response line, e.g. `HTTP/1.1 200 OK`.
fn parse_status(response: &[u8]) -> Result<u16, DownloadError> {
    let line_end = response
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| DownloadError::Malformed("no status line".into()))?;
    let line = std::str::from_utf8(&response[..line_end])
        .map_err(|_| DownloadError::Malformed("status line is not utf-8".into()))?;
    let code = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| DownloadError::Malformed("short status line".into()))?;
    code.parse()
        .map_err(|_| DownloadError::Malformed(format!("bad status code {code:?}")))
}

/// Number of payload bytes in the response, de-chunking when the transfer
/// encoding asks for it.
fn body_length(response: &[u8]) -> Result<usize, DownloadError> {
    let header_end =
        find_header_end(response).ok_or_else(|| DownloadError::Malformed("no header end".into()))?;
    let headers = String::from_utf8_lossy(&response[..header_end]).to_lowercase();
    let body = &response[header_end + 4..];

    if headers.contains("transfer-encoding: chunked") {
        Ok(decode_chunked_len(body))
    } else {
        Ok(body.len())
    }
}

/// Total payload length of a chunked body, tolerating a truncated tail.
fn decode_chunked_len(mut body: &[u8]) -> usize {
    let mut total = 0usize;
    loop {
        let Some(size_end) = body.windows(2).position(|w| w == b"\r\n") else {
            return total;
        };
        let Ok(size_str) = std::str::from_utf8(&body[..size_end]) else {
            return total;
        };
        // Chunk extensions after ';' are ignored.
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_str, 16) else {
            return total;
        };
        if size == 0 {
            return total;
        }
        let data_start = size_end + 2;
        let data_end = data_start + size;
        if data_end > body.len() {
            // Truncated chunk; count what arrived.
            return total + body.len().saturating_sub(data_start);
        }
        total += size;
        body = &body[data_end..];
        if body.starts_with(b"\r\n") {
            body = &body[2..];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn seeded_pick_is_deterministic_and_in_list() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let first = choose_download_url(IpVersion::V4, &mut a);
        let second = choose_download_url(IpVersion::V4, &mut b);
        assert_eq!(first, second);
        assert!(DOWNLOAD_URLS_V4.contains(&first));
    }

    #[test]
    fn v6_list_is_https_only() {
        for url in DOWNLOAD_URLS_V6 {
            assert!(url.starts_with("https://"), "{url}");
        }
        // The v4 list intentionally carries one plain-http mirror.
        assert!(DOWNLOAD_URLS_V4.iter().any(|u| u.starts_with("http://")));
    }

    #[test]
    fn parses_status_lines() {
        assert_eq!(parse_status(b"HTTP/1.1 200 OK\r\n\r\n").unwrap(), 200);
        assert_eq!(
            parse_status(b"HTTP/1.1 404 Not Found\r\nServer: x\r\n\r\n").unwrap(),
            404
        );
        assert!(parse_status(b"garbage").is_err());
    }

    #[test]
    fn body_length_content_length_and_chunked() {
        let plain = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(body_length(plain).unwrap(), 5);

        let chunked =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwire\r\n5\r\nguard\r\n0\r\n\r\n";
        assert_eq!(body_length(chunked).unwrap(), 9);
    }

    #[test]
    fn truncated_chunk_counts_received_bytes() {
        assert_eq!(decode_chunked_len(b"a\r\n12345"), 5);
        assert_eq!(decode_chunked_len(b""), 0);
    }
}
