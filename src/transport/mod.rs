//! Transport bootstrapper: resolve, connect, upgrade, erase.
//!
//! Turns a `Config` into an established `Channel` — plain TCP upgraded via
//! STARTTLS or TLS from the first byte, authenticated against the
//! configured trust anchor. After bootstrap the caller only sees
//! `send`/`recv`/`close`; which path produced the stream is erased.

pub mod dns;
pub mod tls;

use crate::config::{Config, TrustAnchor};
use crate::error::Error;
use crate::jid::Jid;
use crate::stanza::framing::{next_frame, Frame};
use dns::{Endpoint, UpgradeMode};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, info, warn};

/// TCP connect timeout. Without it the OS default applies, which can keep
/// the user waiting well over a minute for an unreachable host.
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for the whole STARTTLS negotiation exchange before the TLS
/// handshake itself.
const STARTTLS_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything that can carry the XMPP byte stream.
pub trait Wire: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Wire for T {}

/// Established byte channel with the transport specifics erased.
pub struct Channel {
    stream: Box<dyn Wire>,
}

impl Channel {
    pub fn new(stream: impl Wire + 'static) -> Channel {
        Channel {
            stream: Box::new(stream),
        }
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.stream.write_all(bytes).await.map_err(Error::Send)?;
        self.stream.flush().await.map_err(Error::Send)
    }

    /// Read more bytes off the wire. `Ok(0)` means the peer closed.
    pub async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf).await
    }

    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Bootstrap result: the channel plus the negotiated-TLS summary line.
/// The summary is diagnostic only and never gates whether we proceed.
pub struct Established {
    pub channel: Channel,
    pub tls_summary: Option<String>,
}

/// Resolve and connect per the configuration, trying candidate endpoints
/// in order until one yields an encrypted channel.
pub async fn bootstrap(config: &Config) -> Result<Established, Error> {
    let account = Jid::parse(&config.jid).ok_or_else(|| Error::Resolve {
        domain: config.jid.clone(),
        reason: "account address is not a valid JID".to_string(),
    })?;
    let domain = account.domain().to_string();

    let endpoints = match &config.server {
        Some(server) => vec![dns::explicit_endpoint(server, &domain)],
        None => dns::resolve(&domain).await?,
    };

    let mut last_err = None;
    for endpoint in endpoints {
        info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode,
            "connecting");
        match connect_endpoint(&endpoint, &config.trust).await {
            Ok(established) => return Ok(established),
            Err(e) => {
                warn!(host = %endpoint.host, port = endpoint.port, error = %e,
                    "endpoint failed, trying next");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(Error::Resolve {
        domain,
        reason: "no candidate endpoints".to_string(),
    }))
}

async fn connect_endpoint(
    endpoint: &Endpoint,
    anchor: &TrustAnchor,
) -> Result<Established, Error> {
    let addr = format!("{}:{}", endpoint.host, endpoint.port);
    let connect_err = |source| Error::Connect {
        host: endpoint.host.clone(),
        port: endpoint.port,
        source,
    };
    let mut tcp = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| {
            connect_err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no answer within {}s", TCP_CONNECT_TIMEOUT.as_secs()),
            ))
        })?
        .map_err(connect_err)?;

    if endpoint.mode == UpgradeMode::StartTls {
        negotiate_starttls(&mut tcp, &endpoint.domain).await?;
        info!(host = %endpoint.host, "STARTTLS negotiated, upgrading");
    }

    let connector = tls::connector(anchor)?;
    let server_name =
        ServerName::try_from(endpoint.tls_name().to_string()).map_err(|e| Error::TlsUpgrade {
            host: endpoint.tls_name().to_string(),
            reason: format!("invalid server name: {}", e),
        })?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::TlsUpgrade {
            host: endpoint.tls_name().to_string(),
            reason: e.to_string(),
        })?;

    let summary = {
        let (_, conn) = tls_stream.get_ref();
        let version = conn
            .protocol_version()
            .map(|v| format!("{:?}", v))
            .unwrap_or_else(|| "unknown".to_string());
        let suite = conn
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_else(|| "unknown".to_string());
        format!("TLS established: {}, cipher suite {}", version, suite)
    };
    info!(host = %endpoint.host, summary = %summary, "transport upgraded");

    Ok(Established {
        channel: Channel::new(tls_stream),
        tls_summary: Some(summary),
    })
}

/// Read the next complete frame from `stream`, honoring `deadline`.
async fn read_frame_deadline<S: AsyncRead + Unpin>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    deadline: tokio::time::Instant,
    host: &str,
) -> Result<Frame, Error> {
    let upgrade_err = |reason: String| Error::TlsUpgrade {
        host: host.to_string(),
        reason,
    };
    loop {
        if let Some((frame, used)) = next_frame(buffer) {
            buffer.drain(..used);
            return Ok(frame);
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(upgrade_err("timed out waiting for server".to_string()));
        }
        let mut read_buf = [0u8; 8192];
        let n = tokio::time::timeout(remaining, stream.read(&mut read_buf))
            .await
            .map_err(|_| upgrade_err("timed out waiting for server".to_string()))?
            .map_err(|e| upgrade_err(format!("read failed: {}", e)))?;
        if n == 0 {
            return Err(upgrade_err(
                "server closed the connection during negotiation".to_string(),
            ));
        }
        buffer.extend_from_slice(&read_buf[..n]);
    }
}

/// In-band STARTTLS exchange on a plain stream: open the stream, require
/// `<starttls>` in the advertised features, request the upgrade, expect
/// `<proceed/>`. The caller performs the TLS handshake afterwards.
pub(crate) async fn negotiate_starttls<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    domain: &str,
) -> Result<(), Error> {
    let upgrade_err = |reason: String| Error::TlsUpgrade {
        host: domain.to_string(),
        reason,
    };
    let deadline = tokio::time::Instant::now() + STARTTLS_TIMEOUT;

    let open = format!(
        "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
        domain
    );
    stream
        .write_all(open.as_bytes())
        .await
        .map_err(|e| upgrade_err(format!("failed to open stream: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| upgrade_err(format!("failed to open stream: {}", e)))?;

    let mut buffer = Vec::new();
    let mut saw_header = false;
    let features = loop {
        match read_frame_deadline(stream, &mut buffer, deadline, domain).await? {
            Frame::StreamHeader(_) => saw_header = true,
            Frame::Stanza(text) if text.contains("features") => break text,
            Frame::Stanza(text) => {
                debug!(stanza = %text, "unexpected stanza before features");
            }
            Frame::StreamEnd => {
                return Err(upgrade_err("server closed the stream".to_string()))
            }
        }
    };
    if !saw_header {
        return Err(upgrade_err("missing server stream header".to_string()));
    }
    if !features.contains("<starttls") {
        return Err(upgrade_err(
            "server does not offer STARTTLS".to_string(),
        ));
    }

    stream
        .write_all(b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
        .await
        .map_err(|e| upgrade_err(format!("failed to request STARTTLS: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| upgrade_err(format!("failed to request STARTTLS: {}", e)))?;

    let answer = loop {
        match read_frame_deadline(stream, &mut buffer, deadline, domain).await? {
            Frame::Stanza(text) => break text,
            Frame::StreamHeader(_) => {}
            Frame::StreamEnd => {
                return Err(upgrade_err("server closed the stream".to_string()))
            }
        }
    };
    if answer.contains("<failure") {
        return Err(upgrade_err(format!("server rejected STARTTLS: {}", answer)));
    }
    if !answer.contains("<proceed") {
        return Err(upgrade_err(format!(
            "unexpected STARTTLS answer: {}",
            answer
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_send_and_recv() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut channel = Channel::new(client);

        channel.send(b"<presence/>").await.unwrap();
        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<presence/>");

        server.write_all(b"<iq type='result' id='1'/>").await.unwrap();
        let n = channel.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<iq type='result' id='1'/>");
    }

    #[tokio::test]
    async fn test_channel_recv_zero_after_close() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut channel = Channel::new(client);
        let mut buf = [0u8; 16];
        assert_eq!(channel.recv(&mut buf).await.unwrap(), 0);
    }

    async fn scripted_starttls_peer(
        mut peer: tokio::io::DuplexStream,
        features: &'static str,
        answer: &'static str,
    ) {
        let mut buf = [0u8; 4096];
        // Client stream open
        let _ = peer.read(&mut buf).await.unwrap();
        peer.write_all(
            b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='s1' version='1.0'>",
        )
        .await
        .unwrap();
        peer.write_all(features.as_bytes()).await.unwrap();
        // Client <starttls/>
        let _ = peer.read(&mut buf).await.unwrap();
        peer.write_all(answer.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_starttls_negotiation_proceeds() {
        let (mut client, server) = tokio::io::duplex(8192);
        let peer = tokio::spawn(scripted_starttls_peer(
            server,
            "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>",
            "<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>",
        ));
        negotiate_starttls(&mut client, "example.com").await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_starttls_not_offered_is_upgrade_error() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let peer = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(
                b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'><stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>",
            )
            .await
            .unwrap();
        });
        let err = negotiate_starttls(&mut client, "example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TlsUpgrade { .. }));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_starttls_failure_is_upgrade_error() {
        let (mut client, server) = tokio::io::duplex(8192);
        let peer = tokio::spawn(scripted_starttls_peer(
            server,
            "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>",
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>",
        ));
        let err = negotiate_starttls(&mut client, "example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TlsUpgrade { .. }));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        // Port 1 on loopback is about as reliably closed as it gets.
        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port: 1,
            mode: UpgradeMode::StartTls,
            domain: "example.com".to_string(),
        };
        let result = connect_endpoint(&endpoint, &TrustAnchor::System).await;
        assert!(matches!(result, Err(Error::Connect { port: 1, .. })));
    }
}
