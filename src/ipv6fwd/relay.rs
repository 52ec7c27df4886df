//! Bidirectional TCP copy engine.
//!
//! Each accepted IPv6 connection is spliced onto an outbound IPv4
//! connection with two 4 KiB pumps, one per direction. EOF or error on
//! either socket tears the pair down; both streams are dropped (and thus
//! closed) when [`splice`] returns. A zero-byte read is terminal.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Per-direction copy buffer.
const BUF_SIZE: usize = 4096;

/// Splice two streams until either side closes or fails.
pub async fn splice(mut client: TcpStream, mut server: TcpStream) -> std::io::Result<()> {
    let (mut client_rd, mut client_wr) = client.split();
    let (mut server_rd, mut server_wr) = server.split();

    let result = tokio::select! {
        r = pump(&mut client_rd, &mut server_wr) => r,
        r = pump(&mut server_rd, &mut client_wr) => r,
    };

    debug!("relay pair torn down");
    result
}

/// Copy until EOF. Short reads go straight through; a partial write simply
/// keeps the pump parked until the peer drains, which bounds the data in
/// flight to one buffer per direction.
async fn pump(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
) -> std::io::Result<()> {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Echo server on a loopback ephemeral port.
    async fn spawn_echo() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn splice_carries_traffic_both_ways() {
        let echo_port = spawn_echo().await;

        // Relay listener standing in for the per-rule worker.
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (inbound, _) = relay.accept().await.unwrap();
            let outbound = TcpStream::connect(("127.0.0.1", echo_port)).await.unwrap();
            let _ = splice(inbound, outbound).await;
        });

        let mut client = TcpStream::connect(("127.0.0.1", relay_port)).await.unwrap();
        client.write_all(b"ping over the relay").await.unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping over the relay");
    }

    #[tokio::test]
    async fn splice_propagates_eof() {
        let echo_port = spawn_echo().await;

        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay.local_addr().unwrap().port();
        let relay_done = tokio::spawn(async move {
            let (inbound, _) = relay.accept().await.unwrap();
            let outbound = TcpStream::connect(("127.0.0.1", echo_port)).await.unwrap();
            splice(inbound, outbound).await
        });

        let client = TcpStream::connect(("127.0.0.1", relay_port)).await.unwrap();
        drop(client);

        // Client hangup unwinds the whole pair.
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), relay_done)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn splice_moves_large_payload() {
        let echo_port = spawn_echo().await;

        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (inbound, _) = relay.accept().await.unwrap();
            let outbound = TcpStream::connect(("127.0.0.1", echo_port)).await.unwrap();
            let _ = splice(inbound, outbound).await;
        });

        let mut client = TcpStream::connect(("127.0.0.1", relay_port)).await.unwrap();
        // Larger than the copy buffer to exercise multiple pump iterations.
        // Reader and writer run concurrently; a half-close would tear the
        // pair down before the echo drains.
        let payload: Vec<u8> = (0..32 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let (mut rd, mut wr) = client.split();
        let write = async {
            wr.write_all(&payload).await.unwrap();
        };
        let read = async {
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            while received.len() < expected.len() {
                let n = rd.read(&mut buf).await.unwrap();
                assert!(n > 0, "relay closed early");
                received.extend_from_slice(&buf[..n]);
            }
            received
        };
        let ((), received) = tokio::join!(write, read);
        assert_eq!(received, expected);
    }
}
