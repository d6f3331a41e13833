use russh::client;
use russh::Channel;
use tokio::net::{TcpStream, UnixStream};

use super::session::ForwardTarget;

/// Pipe one forwarded channel to the local RPC endpoint until either side
/// closes.
pub(crate) async fn pipe(channel: Channel<client::Msg>, target: ForwardTarget) {
    let mut stream = channel.into_stream();

    let result = match &target {
        ForwardTarget::Tcp(address) => match TcpStream::connect(address).await {
            Ok(mut local) => tokio::io::copy_bidirectional(&mut stream, &mut local)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        },
        ForwardTarget::Unix(path) => match UnixStream::connect(path).await {
            Ok(mut local) => tokio::io::copy_bidirectional(&mut stream, &mut local)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        tracing::debug!(forward = ?target, error = %e, "Forwarded connection closed with error");
    }
}
