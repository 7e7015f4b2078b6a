//! Bidirectional byte-copy between two streams, with half-close.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, copy};
use tokio::net::TcpStream;

/// Splice `a` and `b` until both directions have reached EOF or errored.
///
/// Each direction runs in its own task so a stall in one does not block the
/// other. When a copy finishes it shuts down the write half of the opposite
/// stream, propagating EOF onward; the call returns once both directions
/// have completed, at which point both streams are fully closed.
pub async fn relay(a: TcpStream, b: TcpStream) {
    let (mut ar, mut aw) = a.into_split();
    let (mut br, mut bw) = b.into_split();

    let a_to_b = tokio::spawn(async move {
        let _ = copy(&mut ar, &mut bw).await;
        let _ = bw.shutdown().await;
    });

    let b_to_a = tokio::spawn(async move {
        let _ = copy(&mut br, &mut aw).await;
        let _ = aw.shutdown().await;
    });

    let _ = tokio::join!(a_to_b, b_to_a);
}

/// Generic splice for any pair of owned async streams, used where the
/// endpoints are not both [`TcpStream`] (e.g. a relayed local target paired
/// with a dial-back connection already split elsewhere).
pub async fn relay_halves<AR, AW, BR, BW>(mut ar: AR, mut aw: AW, mut br: BR, mut bw: BW)
where
    AR: AsyncRead + Unpin + Send + 'static,
    AW: AsyncWrite + Unpin + Send + 'static,
    BR: AsyncRead + Unpin + Send + 'static,
    BW: AsyncWrite + Unpin + Send + 'static,
{
    let a_to_b = tokio::spawn(async move {
        let _ = copy(&mut ar, &mut bw).await;
        let _ = bw.shutdown().await;
    });

    let b_to_a = tokio::spawn(async move {
        let _ = copy(&mut br, &mut aw).await;
        let _ = aw.shutdown().await;
    });

    let _ = tokio::join!(a_to_b, b_to_a);
}
