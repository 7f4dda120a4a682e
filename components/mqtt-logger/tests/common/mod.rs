//! In-process MQTT 3.1.1 peer shared by the integration tests.
#![allow(dead_code)]

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const CONNECT: u8 = 1;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

/// CONNACK return code for an accepted connection.
pub const ACCEPTED: u8 = 0x00;
/// CONNACK return code "not authorized".
pub const NOT_AUTHORIZED: u8 = 0x05;

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        len |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await?;
    Ok((header >> 4, body))
}

fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let remaining = 2 + topic.len() + payload.len();
    assert!(remaining < 128, "test packets use a one byte length");
    let mut packet = vec![0x30, remaining as u8];
    packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Serves a single client: acknowledges the connect with `connack_code`,
/// grants the subscription, publishes `sensors/temp` = `23.5` and reports
/// whether a DISCONNECT arrived.
pub async fn fake_broker(listener: TcpListener, connack_code: u8, disconnected: oneshot::Sender<bool>) {
    let (mut stream, _) = listener.accept().await.expect("client connects");
    let mut saw_disconnect = false;

    while let Ok((kind, body)) = read_packet(&mut stream).await {
        let written = match kind {
            CONNECT => stream.write_all(&[0x20, 0x02, 0x00, connack_code]).await,
            SUBSCRIBE => {
                let mut reply = vec![0x90, 0x03, body[0], body[1], 0x00];
                reply.extend(publish_packet("sensors/temp", b"23.5"));
                stream.write_all(&reply).await
            }
            PINGREQ => stream.write_all(&[0xd0, 0x00]).await,
            DISCONNECT => {
                saw_disconnect = true;
                break;
            }
            _ => Ok(()),
        };
        if written.is_err() {
            break;
        }
    }
    let _ = disconnected.send(saw_disconnect);
}

/// Accepts the TCP connection and never answers the MQTT CONNECT.
pub async fn silent_broker(listener: TcpListener) {
    let accepted = listener.accept().await;
    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    drop(accepted);
}
