//! Bidirectional splice between two byte streams.
//!
//! Two pump loops race; when either direction ends (EOF or error) both
//! endpoints are dropped, which closes them. There is no graceful half-close
//! relay.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Pump bytes in both directions until one side finishes. Returns
/// (bytes a→b, bytes b→a), counting through the moment the pair ended.
pub async fn splice<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    tokio::select! {
        result = pump(&mut a_read, &mut b_write, &a_to_b) => {
            if let Err(e) = result {
                debug!("relay a->b ended: {e}");
            }
        }
        result = pump(&mut b_read, &mut a_write, &b_to_a) => {
            if let Err(e) = result {
                debug!("relay b->a ended: {e}");
            }
        }
    }

    (a_to_b.load(Ordering::Relaxed), b_to_a.load(Ordering::Relaxed))
}

async fn pump<R, W>(read: &mut R, write: &mut W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        let n = read.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        write.write_all(&buf[..n]).await?;
        write.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn payload_round_trips_unchanged() {
        let (client, near) = duplex(64);
        let (far, upstream) = duplex(64);
        let relay = tokio::spawn(splice(near, far));

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let writer = tokio::spawn(async move {
            client_write.write_all(&payload).await.unwrap();
            client_write
        });

        // Echo on the upstream end until the relay tears it down.
        let echo = tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(upstream);
            let mut buf = vec![0u8; 4096];
            loop {
                let n = r.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                w.write_all(&buf[..n]).await.unwrap();
            }
        });

        let mut received = vec![0u8; expected.len()];
        client_read.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        // Closing the client ends the pair; both directions carried the
        // full payload by then.
        let client_write = writer.await.unwrap();
        drop(client_write);
        drop(client_read);

        let (sent, returned) = relay.await.unwrap();
        assert_eq!(sent, expected.len() as u64);
        assert_eq!(returned, expected.len() as u64);
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn closing_one_side_ends_the_pair() {
        let (client, near) = duplex(64);
        let (far, upstream) = duplex(64);
        let relay = tokio::spawn(splice(near, far));

        drop(client);

        // The splice returns and drops its halves, so the upstream sees EOF.
        relay.await.unwrap();
        let (mut r, _w) = tokio::io::split(upstream);
        let mut buf = [0u8; 1];
        assert_eq!(r.read(&mut buf).await.unwrap(), 0);
    }
}
