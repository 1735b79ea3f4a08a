use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::codec::FrameCodec;
use crate::connection::Connection;
use crate::frame::Frame;

/// Connection wired to an in-memory peer that answers the n-th request with `replies[n]`
/// verbatim. An empty reply swallows the request. The peer hangs up once the script runs out,
/// unless the last reply was swallowed, and hands back every request it received.
pub(crate) fn scripted(replies: &[&'static [u8]]) -> (Connection, JoinHandle<Vec<Vec<Bytes>>>) {
    let replies = replies.to_vec();
    let hold_open = replies.last().is_some_and(|reply| reply.is_empty());
    let (client, server) = tokio::io::duplex(1 << 20);

    let handle = tokio::spawn(async move {
        let mut framed = Framed::new(server, FrameCodec::new());
        let mut requests = Vec::new();

        for reply in replies {
            let request = match framed.next().await {
                Some(Ok(frame)) => frame,
                _ => return requests,
            };
            requests.push(command_parts(request));

            if framed.get_mut().write_all(reply).await.is_err() {
                return requests;
            }
        }

        if hold_open {
            while let Some(Ok(_)) = framed.next().await {}
        }

        requests
    });

    (Connection::new(client), handle)
}

fn command_parts(frame: Frame) -> Vec<Bytes> {
    frame
        .into_array()
        .unwrap_or_default()
        .into_iter()
        .filter_map(Frame::into_bytes)
        .collect()
}

/// Connection to an in-memory peer answering every request with `reply`.
pub(crate) fn responder(reply: &'static [u8]) -> Connection {
    let (client, server) = tokio::io::duplex(1 << 16);

    tokio::spawn(async move {
        let mut framed = Framed::new(server, FrameCodec::new());
        while let Some(Ok(_)) = framed.next().await {
            if framed.get_mut().write_all(reply).await.is_err() {
                break;
            }
        }
    });

    Connection::new(client)
}
