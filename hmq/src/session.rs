//! Per-connection session.
//!
//! After the magic exchange the first frame must be a Server/Hello carrying
//! a method+path line and `Name: Value` header lines in its content; the
//! broker answers with Accepted and registers the client. From then on one
//! select loop owns the socket: inbound frames are dispatched to broker
//! operations, outbound frames arrive over the session's command channel
//! (queue deliveries are pumped into it by per-subscription tasks).

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use hmq_codec::types::{content_types, headers};
use hmq_codec::{Frame, MessageType};
use hmq_net::HmqStream;

use crate::context::ServerContext;
use crate::tracker::{DeliverOutcome, DeliveryRecord, FollowKind};
use crate::types::*;

/// Hello properties parsed from the handshake frame content.
pub(crate) struct Hello {
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub client_type: Option<String>,
}

/// Parses `METHOD path\r\nName: Value\r\n...` hello content.
pub(crate) fn parse_hello(content: &str) -> Hello {
    let mut hello = Hello { client_id: None, client_name: None, client_type: None };
    for line in content.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        if name.eq_ignore_ascii_case(headers::CLIENT_ID) {
            hello.client_id = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(headers::CLIENT_NAME) {
            hello.client_name = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(headers::CLIENT_TYPE) {
            hello.client_type = Some(value.to_string());
        }
    }
    hello
}

pub async fn process<Io>(scx: ServerContext, mut stream: HmqStream<Io>) -> Result<()>
where
    Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let hello = match stream.recv(stream.cfg.handshake_timeout).await? {
        Some(frame)
            if frame.typ == MessageType::Server && frame.content_type == content_types::HELLO =>
        {
            parse_hello(frame.content_as_str().unwrap_or_default())
        }
        _ => return Err(anyhow!("expected Hello frame")),
    };

    let client_id = ClientId::from(
        hello.client_id.unwrap_or_else(|| Uuid::new_v4().as_simple().to_string()),
    );
    let client_name =
        hello.client_name.map(ClientName::from).unwrap_or_else(|| client_id.clone());
    let client_type = hello.client_type.map(ClientType::from).unwrap_or_default();
    let id = Id::new(client_id.clone(), client_name, client_type, Some(stream.remote_addr));

    // register before Accepted goes out; the client may act on it at once
    let (tx, rx) = mpsc::unbounded();
    if let Some(old) = scx.clients.add(id.clone(), tx.clone()) {
        log::info!("{} replaced by a new connection", old.info);
        let _ = old.tx.unbounded_send(SessionCommand::Close(Reason::from_static("session taken over")));
    }

    let mut accepted = Frame::new(MessageType::Server);
    accepted.content_type = content_types::ACCEPTED;
    accepted.set_message_id(client_id.clone());
    stream.send(accepted).await?;
    scx.connections.inc();
    scx.sessions.inc();
    log::info!("{} connected", id);

    let mut state = SessionState { scx: scx.clone(), id, tx, joined: HashSet::new() };
    let reason = state.run_loop(&mut stream, rx).await;

    log::info!("{} disconnected, reason: {:?}", state.id, reason);
    scx.connections.dec();
    scx.sessions.dec();
    state.clean().await;
    let _ = stream.close().await;
    Ok(())
}

pub struct SessionState {
    scx: ServerContext,
    pub id: Id,
    tx: Tx,
    joined: HashSet<QueueName>,
}

impl SessionState {
    async fn run_loop<Io>(&mut self, stream: &mut HmqStream<Io>, mut rx: Rx) -> Reason
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let idle_timeout = if stream.cfg.idle_timeout.is_zero() {
            Duration::from_secs(3600 * 24)
        } else {
            stream.cfg.idle_timeout
        };

        loop {
            let keepalive = tokio::time::sleep(idle_timeout);
            tokio::pin!(keepalive);

            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            if let Err(e) = self.handle_frame(stream, frame).await {
                                return Reason::from(e.to_string());
                            }
                        }
                        Some(Err(e)) => return Reason::from(format!("read error: {e}")),
                        None => return Reason::from_static("closed by peer"),
                    }
                }
                cmd = rx.next() => {
                    match cmd {
                        Some(SessionCommand::Forward(frame)) => {
                            if let Err(e) = stream.send(frame).await {
                                return Reason::from(format!("write error: {e}"));
                            }
                        }
                        Some(SessionCommand::Close(reason)) => return reason,
                        None => return Reason::from_static("command channel closed"),
                    }
                }
                _ = &mut keepalive => return Reason::from_static("keepalive timeout"),
            }
        }
    }

    async fn handle_frame<Io>(&mut self, stream: &mut HmqStream<Io>, frame: Frame) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match frame.typ {
            MessageType::Ping => stream.send(Frame::pong()).await,
            MessageType::Pong => Ok(()),
            MessageType::Terminate => Err(anyhow!("terminated by client")),
            MessageType::QueueMessage => {
                self.on_queue_message(frame).await;
                Ok(())
            }
            MessageType::QueuePullRequest => {
                self.on_pull_request(frame).await;
                Ok(())
            }
            MessageType::DirectMessage => {
                self.on_direct_message(frame);
                Ok(())
            }
            MessageType::Response => {
                self.on_response(frame);
                Ok(())
            }
            MessageType::Acknowledge => {
                self.on_acknowledge(frame);
                Ok(())
            }
            MessageType::Router => {
                self.on_router_message(frame);
                Ok(())
            }
            MessageType::Event => {
                self.on_event_toggle(frame);
                Ok(())
            }
            MessageType::Server => self.on_server_frame(frame).await,
        }
    }

    /// Sends a frame back to this session's own client through the writer.
    #[inline]
    fn reply(&self, frame: Frame) {
        let _ = self.tx.unbounded_send(SessionCommand::Forward(frame));
    }

    /// Answers an introspection request with a JSON payload.
    fn reply_json<T: serde::Serialize>(&self, request: &Frame, content_type: u16, v: &T) -> Result<()> {
        let mut f = Frame::new(MessageType::Server);
        f.content_type = content_type;
        f.set_message_id(request.message_id.clone());
        f.set_target(self.id.client_id.clone());
        f.set_content_json(v)?;
        self.reply(f);
        Ok(())
    }

    async fn on_queue_message(&mut self, mut frame: Frame) {
        frame.set_source(self.id.client_id.clone());
        let queue = match self.scx.resolve_queue(&frame.target).await {
            Ok(Some(queue)) => queue,
            Ok(None) => {
                if frame.pending_acknowledge() {
                    self.reply(frame.create_acknowledge(Some("NotFound")));
                }
                return;
            }
            Err(e) => {
                log::warn!("{} queue resolve failed, {:?}", self.id, e);
                if frame.pending_acknowledge() {
                    self.reply(frame.create_acknowledge(Some("NotFound")));
                }
                return;
            }
        };

        if frame.pending_acknowledge() {
            // resolution may wait on a consumer ack; never block the reader
            let request = frame.clone();
            let producer = self.id.clone();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let outcome = match queue.push_await(frame, producer).await {
                    Ok(outcome) => outcome,
                    Err(_) => DeliverOutcome::Nacked(Reason::from_static("queue removed")),
                };
                let ack = match outcome {
                    DeliverOutcome::Acked => request.create_acknowledge(None),
                    DeliverOutcome::Nacked(reason) => request.create_acknowledge(Some(&reason)),
                    DeliverOutcome::Timeout => request.create_acknowledge(Some(headers::REASON_TIMEOUT)),
                    DeliverOutcome::Response(_) => request.create_acknowledge(None),
                };
                let _ = tx.unbounded_send(SessionCommand::Forward(ack));
            });
        } else if let Err(e) = queue.push(frame, self.id.clone()) {
            log::warn!("{} push failed, {:?}", self.id, e);
        }
    }

    async fn on_pull_request(&mut self, frame: Frame) {
        let Some(queue) = self.scx.get_queue(&frame.target) else {
            self.reply(frame.create_acknowledge(Some("NotFound")));
            return;
        };
        match queue.pull(self.id.clone()).await {
            Ok(Ok(Some(mut pulled))) => {
                pulled.set_target(self.id.client_id.clone());
                self.reply(pulled);
            }
            Ok(Ok(None)) => {
                self.reply(frame.create_acknowledge(Some(headers::REASON_EMPTY)));
            }
            Ok(Err(reason)) => {
                self.reply(frame.create_acknowledge(Some(&reason)));
            }
            Err(e) => {
                log::warn!("{} pull failed, {:?}", self.id, e);
                self.reply(frame.create_acknowledge(Some("NotFound")));
            }
        }
    }

    fn on_direct_message(&mut self, mut frame: Frame) {
        if !frame.hop() {
            return;
        }
        frame.set_source(self.id.client_id.clone());

        let receivers = self.scx.clients.resolve_target(&frame.target);
        if receivers.is_empty() {
            self.reply(frame.create_acknowledge(Some("NotFound")));
            return;
        }
        let receivers =
            if frame.first_acquirer_only() { receivers.into_iter().take(1).collect() } else { receivers };

        let mut sent = 0usize;
        for entry in &receivers {
            let mut f = frame.clone();
            f.set_target(entry.info.client_id.clone());
            if entry.tx.unbounded_send(SessionCommand::Forward(f)).is_ok() {
                sent += 1;
            }
        }
        if sent == 0 {
            self.reply(frame.create_acknowledge(Some("SendError")));
            return;
        }

        if frame.wait_response() {
            // S2: the requester's frame completes with the Response carrying
            // the same id, or with Timeout
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            let record = DeliveryRecord::new(
                frame.message_id.clone(),
                None,
                receivers[0].info.client_id.clone(),
                Some(self.id.clone()),
                frame.clone(),
                FollowKind::Response,
            )
            .with_reply(reply_tx);
            self.scx.tracker.follow(record, self.scx.response_timeout);

            let tx = self.tx.clone();
            let requester = self.id.client_id.clone();
            tokio::spawn(async move {
                let outcome = reply_rx.await.unwrap_or(DeliverOutcome::Timeout);
                let out = match outcome {
                    DeliverOutcome::Response(mut response) => {
                        response.set_target(requester);
                        response
                    }
                    DeliverOutcome::Acked => frame.create_acknowledge(None),
                    DeliverOutcome::Nacked(reason) => frame.create_acknowledge(Some(&reason)),
                    DeliverOutcome::Timeout => frame.create_acknowledge(Some(headers::REASON_TIMEOUT)),
                };
                let _ = tx.unbounded_send(SessionCommand::Forward(out));
            });
        } else if frame.pending_acknowledge() {
            self.reply(frame.create_acknowledge(None));
        }
    }

    fn on_response(&mut self, mut frame: Frame) {
        frame.set_source(self.id.client_id.clone());
        if let Some(mut record) = self.scx.tracker.resolve_response(&frame.message_id) {
            record.complete(DeliverOutcome::Response(frame));
            return;
        }
        // no correlation record; forward to the addressed client if any
        if !frame.hop() {
            return;
        }
        for entry in self.scx.clients.resolve_target(&frame.target) {
            let mut f = frame.clone();
            f.set_target(entry.info.client_id.clone());
            let _ = entry.tx.unbounded_send(SessionCommand::Forward(f));
        }
    }

    fn on_acknowledge(&mut self, frame: Frame) {
        // queue deliveries resolve inside their queue's event stream so the
        // handler pipeline sees the ack
        if let Some(queue_name) = self.scx.tracker.queue_of(&frame.message_id) {
            if let Some(queue) = self.scx.get_queue(&queue_name) {
                queue.ack(frame);
                return;
            }
        }
        if let Some(mut record) = self.scx.tracker.resolve_ack(&frame.message_id) {
            let outcome = match frame.negative_ack_reason() {
                Some(reason) => DeliverOutcome::Nacked(reason),
                None => DeliverOutcome::Acked,
            };
            record.complete(outcome);
            return;
        }
        // client-to-client acknowledge
        for entry in self.scx.clients.resolve_target(&frame.target) {
            let mut f = frame.clone();
            f.set_target(entry.info.client_id.clone());
            let _ = entry.tx.unbounded_send(SessionCommand::Forward(f));
        }
    }

    fn on_router_message(&mut self, mut frame: Frame) {
        frame.set_source(self.id.client_id.clone());
        let Some(router) = self.scx.routers.get(&frame.target).map(|r| r.value().clone()) else {
            if frame.pending_acknowledge() || frame.wait_response() {
                self.reply(frame.create_acknowledge(Some("NotFound")));
            }
            return;
        };

        let scx = self.scx.clone();
        let producer = self.id.clone();
        let tx = self.tx.clone();
        let wants_reply = frame.pending_acknowledge() || frame.wait_response();
        let request = frame.clone();
        let requester = self.id.client_id.clone();
        tokio::spawn(async move {
            let outcome = router.route(&scx, frame, producer).await;
            if !wants_reply {
                return;
            }
            let out = match outcome {
                DeliverOutcome::Acked => request.create_acknowledge(None),
                DeliverOutcome::Nacked(reason) => request.create_acknowledge(Some(&reason)),
                DeliverOutcome::Timeout => request.create_acknowledge(Some(headers::REASON_TIMEOUT)),
                DeliverOutcome::Response(mut response) => {
                    response.set_target(requester);
                    response
                }
            };
            let _ = tx.unbounded_send(SessionCommand::Forward(out));
        });
    }

    fn on_event_toggle(&mut self, frame: Frame) {
        let event = frame.header(headers::EVENT_NAME).cloned().unwrap_or_default();
        let queue = frame
            .header(headers::QUEUE_NAME)
            .cloned()
            .unwrap_or_else(|| frame.target.clone());
        let subscribe =
            frame.header(headers::SUBSCRIBE).map(|v| AsRef::<str>::as_ref(v) == "1").unwrap_or(true);
        if event.is_empty() {
            self.reply(frame.create_acknowledge(Some("Unacceptable")));
            return;
        }
        self.scx.events.toggle(&event, &queue, &self.id.client_id, subscribe);
        if frame.pending_acknowledge() {
            self.reply(frame.create_acknowledge(None));
        }
    }

    async fn on_server_frame(&mut self, frame: Frame) -> Result<()> {
        match frame.content_type {
            content_types::CREATE_QUEUE | content_types::CREATE_CHANNEL => {
                let opts = if frame.content.is_empty() {
                    self.scx.queue_defaults.clone()
                } else {
                    match frame.content_as_json::<QueueOptions>() {
                        Ok(opts) => opts,
                        Err(_) => {
                            self.reply(frame.create_acknowledge(Some("Unacceptable")));
                            return Ok(());
                        }
                    }
                };
                match self.scx.create_queue(frame.target.clone(), opts).await {
                    Ok(_) => self.reply(frame.create_acknowledge(None)),
                    Err(e) => {
                        log::warn!("{} create queue failed, {:?}", self.id, e);
                        self.reply(frame.create_acknowledge(Some("Failed")));
                    }
                }
            }
            content_types::REMOVE_QUEUE => {
                let removed = self.scx.remove_queue(&frame.target).await.unwrap_or(false);
                let reason = if removed { None } else { Some("NotFound") };
                self.reply(frame.create_acknowledge(reason));
            }
            content_types::UPDATE_QUEUE => {
                match (self.scx.get_queue(&frame.target), frame.content_as_json::<QueueOptions>()) {
                    (Some(queue), Ok(opts)) => {
                        let _ = queue.update_options(opts);
                        self.reply(frame.create_acknowledge(None));
                    }
                    (None, _) => self.reply(frame.create_acknowledge(Some("NotFound"))),
                    (_, Err(_)) => self.reply(frame.create_acknowledge(Some("Unacceptable"))),
                }
            }
            content_types::JOIN => {
                self.on_join(frame).await;
            }
            content_types::LEAVE => {
                let left = match self.scx.get_queue(&frame.target) {
                    Some(queue) => {
                        self.joined.remove(&crate::context::queue_key(&frame.target));
                        queue.unsubscribe(self.id.client_id.clone()).await.unwrap_or(false)
                    }
                    None => false,
                };
                let reason = if left { None } else { Some("NotFound") };
                self.reply(frame.create_acknowledge(reason));
            }
            content_types::QUEUE_LIST => {
                let mut list = Vec::new();
                for name in self.scx.queue_names() {
                    if let Some(queue) = self.scx.get_queue(&name) {
                        if let Ok(info) = queue.info().await {
                            list.push(info);
                        }
                    }
                }
                self.reply_json(&frame, content_types::QUEUE_LIST, &list)?;
            }
            content_types::CLIENT_LIST => {
                let list = self.scx.clients.iter_infos();
                self.reply_json(&frame, content_types::CLIENT_LIST, &list)?;
            }
            content_types::INSTANCE_LIST => {
                let nodes = vec![self.scx.node.to_json()];
                self.reply_json(&frame, content_types::INSTANCE_LIST, &nodes)?;
            }
            _ => {
                self.reply(frame.create_acknowledge(Some("Unacceptable")));
            }
        }
        Ok(())
    }

    async fn on_join(&mut self, frame: Frame) {
        let queue = match self.scx.resolve_queue(&frame.target).await {
            Ok(Some(queue)) => queue,
            _ => {
                self.reply(frame.create_acknowledge(Some("NotFound")));
                return;
            }
        };

        match queue.subscribe(self.id.clone()).await {
            Ok(rx) => {
                self.joined.insert(crate::context::queue_key(&frame.target));
                self.spawn_deliver_pump(rx);
                self.reply(frame.create_acknowledge(None));
            }
            Err(e) => {
                log::warn!("{} join failed, {:?}", self.id, e);
                self.reply(frame.create_acknowledge(Some("Unauthorized")));
            }
        }
    }

    /// Drains a subscription's deliver channel into the session writer; the
    /// task ends when the queue drops the subscription.
    fn spawn_deliver_pump(&self, mut rx: crate::deliver::Receiver<Frame>) {
        let tx = self.tx.clone();
        let client_id = self.id.client_id.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.next().await {
                if let Some(mut frame) = item {
                    frame.set_target(client_id.clone());
                    if tx.unbounded_send(SessionCommand::Forward(frame)).is_err() {
                        break;
                    }
                }
            }
        });
    }

    async fn clean(&mut self) {
        // the registry may already hold a replacement session under this id
        if let Some(current) = self.scx.clients.find_by_id(&self.id.client_id) {
            if current.tx.same_receiver(&self.tx) {
                self.scx.clients.remove_by_id(&self.id.client_id);
            }
        }
        for queue_name in self.joined.clone() {
            if let Some(queue) = self.scx.get_queue(&queue_name) {
                if let Err(e) = queue.unsubscribe(self.id.client_id.clone()).await {
                    log::debug!("{} unsubscribe {:?} failed, {:?}", self.id, queue_name, e);
                }
            }
        }
        self.scx.client_disconnected(&self.id.client_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_content_parses_headers() {
        let hello = parse_hello("CONNECT /\r\nClient-Id: c-9\r\nClient-Name: worker\r\nClient-Type: consumer\r\n");
        assert_eq!(hello.client_id.as_deref(), Some("c-9"));
        assert_eq!(hello.client_name.as_deref(), Some("worker"));
        assert_eq!(hello.client_type.as_deref(), Some("consumer"));
    }

    #[test]
    fn hello_tolerates_missing_fields() {
        let hello = parse_hello("CONNECT /\r\n");
        assert!(hello.client_id.is_none());
        assert!(hello.client_name.is_none());

        let hello = parse_hello("");
        assert!(hello.client_id.is_none());
    }
}
