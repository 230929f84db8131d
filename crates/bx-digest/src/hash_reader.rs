//! Hash-verifying AsyncRead wrapper.
//!
//! Streams data through while computing a sha256, verifying on EOF.

use pin_project_lite::pin_project;
use sha2::{Digest as _, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use crate::Digest;

pin_project! {
    /// AsyncRead wrapper that verifies the content digest on completion.
    ///
    /// Computes the hash while streaming data through, then verifies both
    /// hash and size when EOF is reached. Returns an error if either does
    /// not match the expected digest.
    pub struct Sha256VerifyingReader<R> {
        #[pin]
        inner: R,
        hasher: Sha256,
        size: u64,
        expected: Digest,
        verified: bool,
    }
}

impl<R: AsyncRead> Sha256VerifyingReader<R> {
    /// Create a new verifying reader with an expected digest.
    pub fn new(inner: R, expected: Digest) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            size: 0,
            expected,
            verified: false,
        }
    }
}

impl<R: AsyncRead> AsyncRead for Sha256VerifyingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();

        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let after = buf.filled().len();
                let new_data = &buf.filled()[before..after];

                this.hasher.update(new_data);
                *this.size += new_data.len() as u64;

                // EOF (no new data): verify hash and size once.
                if new_data.is_empty() && !*this.verified {
                    let actual = Digest {
                        hash: this.hasher.finalize_reset().into(),
                        size_bytes: *this.size,
                    };
                    if actual != *this.expected {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!(
                                "digest mismatch: expected {}, got {}",
                                this.expected, actual
                            ),
                        )));
                    }
                    *this.verified = true;
                }

                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Verify a fetched blob against its expected digest, streaming it
/// through the verifying reader. Returns the bytes on success.
pub async fn verify_blob(data: Vec<u8>, expected: Digest) -> io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut out = Vec::with_capacity(data.len());
    let mut r = Sha256VerifyingReader::new(std::io::Cursor::new(data), expected);
    r.read_to_end(&mut out).await?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn verify_blob_round_trips() {
        let data = b"fetched".to_vec();
        let d = Digest::from_bytes(&data);
        assert_eq!(verify_blob(data.clone(), d).await.unwrap(), data);
        let wrong = Digest::from_bytes(b"no");
        assert!(verify_blob(data, wrong).await.is_err());
    }

    #[tokio::test]
    async fn matching_digest_passes() {
        let data = b"blob contents".to_vec();
        let expected = Digest::from_bytes(&data);
        let mut r = Sha256VerifyingReader::new(std::io::Cursor::new(data.clone()), expected);
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn mismatched_digest_fails_on_eof() {
        let data = b"blob contents".to_vec();
        let wrong = Digest::from_bytes(b"other contents");
        let mut r = Sha256VerifyingReader::new(std::io::Cursor::new(data), wrong);
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn size_mismatch_fails() {
        let data = b"blob".to_vec();
        let mut wrong = Digest::from_bytes(&data);
        wrong.size_bytes += 1;
        let mut r = Sha256VerifyingReader::new(std::io::Cursor::new(data), wrong);
        let mut out = Vec::new();
        assert!(r.read_to_end(&mut out).await.is_err());
    }
}
