//! Wire-level broker tests: a real listener, real sockets, the full
//! handshake and frame codec.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use hmq::context::ServerContext;
use hmq::net::Builder;
use hmq::server::HmqServer;
use hmq_codec::types::{content_types, headers};
use hmq_codec::{Frame, FrameCodec, FrameFlags, HandshakeCodec, HmqCodec, HmqPacket, MessageType};

type Client = Framed<TcpStream, HmqCodec>;

async fn start_broker() -> SocketAddr {
    let scx = ServerContext::new().build().await;
    let listener = Builder::new()
        .name("test/tcp")
        .laddr(([127, 0, 0, 1], 0).into())
        .bind()
        .unwrap()
        .tcp()
        .unwrap();
    let addr = listener.local_addr().unwrap();
    HmqServer::new(scx).listener(listener).build().start();
    addr
}

async fn connect(addr: SocketAddr, client_id: &str, name: &str) -> Client {
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut io = Framed::new(socket, HmqCodec::Handshake(HandshakeCodec));

    io.send(HmqPacket::Handshake).await.unwrap();
    match io.next().await {
        Some(Ok(HmqPacket::Handshake)) => {}
        other => panic!("expected server magic, got {:?}", other),
    }
    *io.codec_mut() = HmqCodec::Frame(FrameCodec::new(1024 * 1024));

    let mut hello = Frame::new(MessageType::Server);
    hello.content_type = content_types::HELLO;
    hello.set_content_string(&format!(
        "CONNECT /\r\nClient-Id: {client_id}\r\nClient-Name: {name}\r\n"
    ));
    io.send(HmqPacket::Frame(hello)).await.unwrap();

    let accepted = recv_frame(&mut io).await;
    assert_eq!(accepted.content_type, content_types::ACCEPTED);
    assert_eq!(accepted.message_id, client_id);
    io
}

async fn recv_frame(io: &mut Client) -> Frame {
    match tokio::time::timeout(Duration::from_secs(5), io.next()).await {
        Ok(Some(Ok(HmqPacket::Frame(frame)))) => frame,
        other => panic!("expected a frame, got {:?}", other),
    }
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let addr = start_broker().await;
    let mut c = connect(addr, "c1", "C").await;

    c.send(HmqPacket::Frame(Frame::ping())).await.unwrap();
    let frame = recv_frame(&mut c).await;
    assert_eq!(frame.typ, MessageType::Pong);
}

#[tokio::test]
async fn direct_message_request_response() {
    let addr = start_broker().await;
    let mut b = connect(addr, "client-b", "B").await;
    let mut a = connect(addr, "client-a", "A").await;

    let mut request = Frame::new(MessageType::DirectMessage);
    request.content_type = 1234;
    request.flags |= FrameFlags::WAIT_RESPONSE;
    request.set_message_id("m1").set_target("@name:B");
    request.set_content_string("ping?");
    a.send(HmqPacket::Frame(request)).await.unwrap();

    let got = recv_frame(&mut b).await;
    assert_eq!(got.typ, MessageType::DirectMessage);
    assert_eq!(got.message_id, "m1");
    assert_eq!(got.source, "client-a");
    assert_eq!(got.content_as_str(), Some("ping?"));

    let mut response = got.create_response();
    response.set_content_string("pong!");
    b.send(HmqPacket::Frame(response)).await.unwrap();

    let answered = recv_frame(&mut a).await;
    assert_eq!(answered.typ, MessageType::Response);
    assert_eq!(answered.message_id, "m1");
    assert_eq!(answered.content_as_str(), Some("pong!"));
}

#[tokio::test]
async fn queue_publish_reaches_a_joined_consumer() {
    let addr = start_broker().await;
    let mut consumer = connect(addr, "worker-1", "worker").await;
    let mut producer = connect(addr, "producer-1", "producer").await;

    let mut join = Frame::new(MessageType::Server);
    join.content_type = content_types::JOIN;
    join.set_message_id("j1").set_target("jobs");
    consumer.send(HmqPacket::Frame(join)).await.unwrap();

    let ack = recv_frame(&mut consumer).await;
    assert_eq!(ack.typ, MessageType::Acknowledge);
    assert_eq!(ack.message_id, "j1");
    assert!(!ack.is_negative_ack());

    let mut publish = Frame::new(MessageType::QueueMessage);
    publish.set_message_id("m1").set_target("jobs");
    publish.set_content_string("work item");
    producer.send(HmqPacket::Frame(publish)).await.unwrap();

    let delivered = recv_frame(&mut consumer).await;
    assert_eq!(delivered.typ, MessageType::QueueMessage);
    assert_eq!(delivered.message_id, "m1");
    assert_eq!(delivered.content_as_str(), Some("work item"));
}

#[tokio::test]
async fn unresponsive_request_times_out() {
    // broker with a short response deadline
    let scx = ServerContext::new().response_timeout(Duration::from_millis(300)).build().await;
    let listener =
        Builder::new().name("t/tcp").laddr(([127, 0, 0, 1], 0).into()).bind().unwrap().tcp().unwrap();
    let addr = listener.local_addr().unwrap();
    HmqServer::new(scx).listener(listener).build().start();

    let _silent = connect(addr, "client-b", "B").await;
    let mut a = connect(addr, "client-a", "A").await;

    let mut request = Frame::new(MessageType::DirectMessage);
    request.flags |= FrameFlags::WAIT_RESPONSE;
    request.set_message_id("m9").set_target("@name:B");
    a.send(HmqPacket::Frame(request)).await.unwrap();

    let answered = recv_frame(&mut a).await;
    assert_eq!(answered.typ, MessageType::Acknowledge);
    assert_eq!(answered.message_id, "m9");
    assert_eq!(answered.header(headers::NEGATIVE_ACK).map(|v| v.as_ref()), Some(headers::REASON_TIMEOUT));
}
