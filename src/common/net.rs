//! Bidirectional stream copying, built on the greedy buffer in `buffer`.

use crate::Result;
use tokio::io::{AsyncRead, AsyncWrite};

use super::buffer;

/// Copy data between two streams bidirectionally.
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    buffer::greedy_copy_bidirectional(a, b).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_copy_bidirectional_relays_both_directions() {
        let (mut a1, mut a2) = duplex(64);
        let (mut b1, mut b2) = duplex(64);

        let relay = tokio::spawn(async move { copy_bidirectional(&mut a2, &mut b1).await });

        tokio::io::AsyncWriteExt::write_all(&mut a1, b"ping").await.unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut a1).await.unwrap();

        let mut out = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut b2, &mut out).await.unwrap();
        assert_eq!(&out, b"ping");

        tokio::io::AsyncWriteExt::write_all(&mut b2, b"pong").await.unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut b2).await.unwrap();

        let mut out = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut a1, &mut out).await.unwrap();
        assert_eq!(&out, b"pong");

        relay.await.unwrap().unwrap();
    }
}
