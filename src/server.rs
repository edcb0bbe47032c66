//! The per-connection drive loop.
//!
//! A pre-accepted socket enters here; bytes flow into the receive
//! buffer, the active codec parses, handlers populate responses, the
//! pipeline serializes into the send buffer, and the connection writes
//! it out. TLS connections run the same loops with the record engine
//! wrapped around both buffers.

use std::io;
use std::sync::Arc;

use http::{HeaderValue, StatusCode, header};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;

use torii_core::conn::CloseKind;
use torii_core::listener::AcceptPool;
use torii_core::{Connection, CoreError, RuntimeContext};
use torii_http::pipeline::to_h2_response;
use torii_http::{FileCache, H1Serializer, HttpRequest, Response, StaticFileService};
use torii_http_core::MessageDispatcher;
use torii_http_core::h2::proto::{self, Http2Connection, PeerMessage};
use torii_http_core::h2::Reason;
use torii_http_core::proto::h1::{self, ParsedRequest, UpgradeIntent};
use torii_tls::{AlpnProtocol, TlsContext, TlsEngine, TlsError};
use torii_ws as ws;

/// What a routed handler receives: request target plus headers.
type RoutedRequest = (String, http::HeaderMap);

/// The assembled server: context, routing, content service, optional
/// TLS.
pub struct Server {
    ctx: Arc<RuntimeContext>,
    service: Arc<StaticFileService>,
    dispatcher: MessageDispatcher<RoutedRequest, Response>,
    tls: Option<Arc<TlsContext>>,
}

impl Server {
    /// Builds the shared state from the runtime context.
    pub fn new(ctx: Arc<RuntimeContext>) -> Result<Self, io::Error> {
        let config = ctx.config();
        let cache = Arc::new(FileCache::new(
            config.buffer_size,
            config.temp_file_path.clone(),
        ));
        let service = Arc::new(StaticFileService::new(
            config.root_path.clone(),
            config.index_file_name.clone(),
            config.server_name.clone(),
            cache,
        ));

        let mut dispatcher = MessageDispatcher::new();
        for method in [http::Method::GET, http::Method::HEAD] {
            let service = service.clone();
            let bound = method.clone();
            dispatcher.add_handler(method, move |(path, headers): RoutedRequest| {
                service.handle(&bound, &path, &headers)
            });
        }

        let tls = if config.enable_ssl {
            let (Some(cert), Some(key)) =
                (&config.certificate_path, &config.private_key_path)
            else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "enableSSL requires certificatePath and privateKeyPath",
                ));
            };
            let context = TlsContext::new(cert, key, config.enable_http2)
                .map_err(|err| io::Error::other(err.to_string()))?;
            Some(Arc::new(context))
        } else {
            None
        };

        Ok(Self {
            ctx,
            service,
            dispatcher,
            tls,
        })
    }

    /// Routes one request through the method-keyed dispatcher; a
    /// method without a handler answers 405.
    fn respond(
        &self,
        method: &http::Method,
        path: &str,
        headers: &http::HeaderMap,
    ) -> Response {
        self.dispatcher
            .dispatch(method, (path.to_owned(), headers.clone()))
            .unwrap_or_else(|| {
                let mut response =
                    Response::status_page(StatusCode::METHOD_NOT_ALLOWED, self.server_name());
                response
                    .headers
                    .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
                response
            })
    }

    /// Binds the accept pool and serves until the guard cancels.
    pub async fn serve(
        self: Arc<Self>,
        guard: torii_core::graceful::ShutdownGuard,
    ) -> io::Result<()> {
        let pool = AcceptPool::bind(self.ctx.config())?;
        self.serve_on(pool, guard).await
    }

    /// Serves on an already-bound accept pool.
    pub async fn serve_on(
        self: Arc<Self>,
        pool: AcceptPool,
        guard: torii_core::graceful::ShutdownGuard,
    ) -> io::Result<()> {
        tracing::info!(addr = %pool.local_addr(), "torii listening");

        let _wheel_driver = self.ctx.reuse_wheel().start();

        loop {
            let accepted = tokio::select! {
                accepted = pool.accept() => accepted,
                _ = guard.cancelled() => {
                    tracing::info!("accept loop stopping");
                    return Ok(());
                }
            };
            let (stream, peer, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    continue;
                }
            };

            let server = self.clone();
            guard.spawn_task(async move {
                if let Err(err) = server.drive(stream, permit).await {
                    tracing::debug!(%peer, %err, "connection ended with error");
                }
            });
        }
    }

    /// Runs one connection to completion.
    async fn drive(
        self: Arc<Self>,
        stream: TcpStream,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), CoreError> {
        let headroom = 16;
        let mut conn = Connection::new(stream, self.ctx.buffers(), headroom)?;
        conn.set_permit(permit);

        let outcome = match &self.tls {
            Some(context) => self.drive_tls(&mut conn, context).await,
            None => self.drive_h1(&mut conn, None).await,
        };

        let kind = match &outcome {
            Ok(()) if conn.is_peer_shutdown() => CloseKind::Graceful,
            Ok(()) => CloseKind::Active,
            Err(_) => CloseKind::Active,
        };
        conn.close(
            kind,
            self.ctx.reuse_wheel(),
            self.ctx.config().time_wait_seconds,
        )
        .await;
        outcome
    }

    /// TLS front: handshake, then pick the codec from ALPN.
    async fn drive_tls(
        &self,
        conn: &mut Connection,
        context: &TlsContext,
    ) -> Result<(), CoreError> {
        let mut engine = TlsEngine::new(context.config()).map_err(tls_error)?;

        // Handshake: ciphertext in, produced records out, until done.
        loop {
            let n = conn.receive_some().await?;
            let done = {
                let (recv, send) = conn.buffers();
                engine.handshake(recv, send).map_err(tls_error)?
            };
            conn.send_async().await?;
            if done {
                break;
            }
            if n == 0 {
                // Peer vanished mid-handshake.
                return Err(CoreError::Io(
                    io::ErrorKind::UnexpectedEof,
                    Some("eof during tls handshake".into()),
                ));
            }
        }

        match engine.alpn() {
            AlpnProtocol::H2 => {
                let mut h2 = self.new_h2();
                h2.write_settings(conn.send_buf()).map_err(h2_io)?;
                self.flush(conn, Some(&mut engine)).await?;
                self.drive_h2(conn, h2, Some(&mut engine)).await
            }
            AlpnProtocol::Http11 => self.drive_h1(conn, Some(&mut engine)).await,
        }
    }

    /// HTTP/1.x loop; exits into h2c or WebSocket on upgrade.
    async fn drive_h1(
        &self,
        conn: &mut Connection,
        mut engine: Option<&mut TlsEngine>,
    ) -> Result<(), CoreError> {
        let max_headers = h1::DEFAULT_MAX_HEADERS;

        loop {
            let parsed = match h1::parse_request(conn.recv_buf(), max_headers) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => {
                    if self.receive(conn, engine.as_deref_mut()).await? == 0 {
                        // Graceful path: peer finished sending.
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => {
                    // Malformed head: a 400 page, drained, then close.
                    tracing::info!(%err, "rejecting malformed request");
                    let response =
                        Response::status_page(StatusCode::BAD_REQUEST, self.server_name());
                    self.send_h1_response(conn, engine.as_deref_mut(), response)
                        .await?;
                    return Ok(());
                }
            };

            match parsed.upgrade {
                UpgradeIntent::H2c { ref settings } if self.ctx.config().enable_http2 => {
                    let settings = settings.clone();
                    return self
                        .upgrade_h2c(conn, engine.as_deref_mut(), parsed, settings)
                        .await;
                }
                UpgradeIntent::WebSocket => {
                    if let Some(key) = ws::validate_upgrade(&parsed.headers) {
                        let key = key.to_owned();
                        return self.upgrade_websocket(conn, engine.as_deref_mut(), &key).await;
                    }
                    // Fall through: incomplete handshake gets a 400.
                    let response =
                        Response::status_page(StatusCode::BAD_REQUEST, self.server_name());
                    self.send_h1_response(conn, engine.as_deref_mut(), response)
                        .await?;
                    return Ok(());
                }
                _ => {}
            }

            let keep_alive = parsed.keep_alive;
            self.read_h1_body(conn, engine.as_deref_mut(), &parsed).await?;

            let mut response = self.respond(&parsed.method, parsed.uri.path(), &parsed.headers);
            response.keep_alive &= keep_alive;
            let closing = !response.keep_alive;

            self.send_h1_response(conn, engine.as_deref_mut(), response)
                .await?;
            if closing {
                return Ok(());
            }
        }
    }

    /// Drains a request body into the request's temp file.
    async fn read_h1_body(
        &self,
        conn: &mut Connection,
        mut engine: Option<&mut TlsEngine>,
        parsed: &ParsedRequest,
    ) -> Result<(), CoreError> {
        if parsed.content_length == 0 {
            return Ok(());
        }
        let temp_dir = self.ctx.config().temp_file_path.clone();
        let mut request = HttpRequest::from_parsed(parsed);

        while !request.body_complete() {
            if conn.recv_buf().is_empty()
                && self.receive(conn, engine.as_deref_mut()).await? == 0
            {
                return Err(CoreError::Io(
                    io::ErrorKind::UnexpectedEof,
                    Some("eof inside request body".into()),
                ));
            }
            let chunk = conn.recv_buf().read_all();
            request.append_body(&temp_dir, &chunk)?;
        }
        tracing::debug!(
            len = parsed.content_length,
            multipart = request.multipart().is_some(),
            "request body spilled"
        );
        Ok(())
    }

    async fn send_h1_response(
        &self,
        conn: &mut Connection,
        mut engine: Option<&mut TlsEngine>,
        response: Response,
    ) -> Result<(), CoreError> {
        let chunk = self.chunk_size();
        let mut serializer = H1Serializer::new(response, chunk);
        loop {
            let done = serializer.write_content(conn.send_buf())?;
            self.flush(conn, engine.as_deref_mut()).await?;
            if done {
                return Ok(());
            }
        }
    }

    /// `101 Switching Protocols` then the h2 loop, with the upgraded
    /// request served as stream 1.
    async fn upgrade_h2c(
        &self,
        conn: &mut Connection,
        mut engine: Option<&mut TlsEngine>,
        parsed: ParsedRequest,
        settings: Vec<u8>,
    ) -> Result<(), CoreError> {
        let mut headers = http::HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        h1::encode_response_head(StatusCode::SWITCHING_PROTOCOLS, &headers, conn.send_buf())?;
        self.flush(conn, engine.as_deref_mut()).await?;
        tracing::debug!("switched to h2c");

        let mut h2 = self.new_h2();
        h2.apply_h2c_settings(&settings).map_err(h2_io)?;
        h2.write_settings(conn.send_buf()).map_err(h2_io)?;

        // The request that rode the upgrade becomes stream 1.
        let stream_id = h2.upgrade_request().map_err(h2_io)?;
        let response = self.respond(&parsed.method, parsed.uri.path(), &parsed.headers);
        self.queue_h2_response(&mut h2, stream_id, response)?;
        while h2.serialize_pass(conn.send_buf()).map_err(h2_io)? {}
        self.flush(conn, engine.as_deref_mut()).await?;

        self.drive_h2(conn, h2, engine).await
    }

    /// The HTTP/2 frame loop.
    async fn drive_h2(
        &self,
        conn: &mut Connection,
        mut h2: Http2Connection,
        mut engine: Option<&mut TlsEngine>,
    ) -> Result<(), CoreError> {
        loop {
            let n = self.receive(conn, engine.as_deref_mut()).await?;

            let messages = {
                let (recv, send) = conn.buffers();
                match h2.recv(recv, send) {
                    Ok(messages) => messages,
                    Err(err) => {
                        self.h2_teardown(conn, &mut h2, engine.as_deref_mut(), &err)
                            .await?;
                        return Ok(());
                    }
                }
            };

            for message in messages {
                match message {
                    PeerMessage::Request(head) => {
                        let stream_id = head.stream_id;
                        match head.into_http() {
                            Ok(request) => {
                                let response = self.respond(
                                    request.method(),
                                    request.uri().path(),
                                    request.headers(),
                                );
                                self.queue_h2_response(&mut h2, stream_id, response)?;
                            }
                            Err(err) => {
                                tracing::debug!(%err, "unroutable h2 request");
                                self.h2_teardown(conn, &mut h2, engine.as_deref_mut(), &err)
                                    .await?;
                            }
                        }
                    }
                    PeerMessage::Body {
                        stream_id,
                        data,
                        end_stream,
                    } => {
                        // Static content has no use for request bodies;
                        // they drain into the void.
                        tracing::trace!(
                            stream_id = u32::from(stream_id),
                            len = data.len(),
                            end_stream,
                            "discarding h2 request body chunk"
                        );
                    }
                    PeerMessage::GoAway { reason, .. } => {
                        tracing::debug!(%reason, "peer going away");
                    }
                }
            }

            // Weighted serialization passes until the queue drains.
            while h2.serialize_pass(conn.send_buf()).map_err(h2_io)? {
                self.flush(conn, engine.as_deref_mut()).await?;
            }
            self.flush(conn, engine.as_deref_mut()).await?;

            if n == 0 {
                return Ok(());
            }
            if h2.is_going_away() && !h2.has_pending_responses() {
                return Ok(());
            }
        }
    }

    /// Answers an h2 error: RST_STREAM for stream errors (connection
    /// stays open), GOAWAY + active close for connection errors.
    async fn h2_teardown(
        &self,
        conn: &mut Connection,
        h2: &mut Http2Connection,
        engine: Option<&mut TlsEngine>,
        err: &proto::Error,
    ) -> Result<(), CoreError> {
        let reason = err.reason().unwrap_or(Reason::INTERNAL_ERROR);
        match err {
            proto::Error::Reset(stream_id, ..) => {
                tracing::debug!(%err, "h2 stream error");
                h2.send_reset(conn.send_buf(), *stream_id, reason)
                    .map_err(h2_io)?;
            }
            _ => {
                tracing::info!(%err, "h2 connection error");
                h2.go_away(conn.send_buf(), reason).map_err(h2_io)?;
            }
        }
        self.flush(conn, engine).await
    }

    fn queue_h2_response(
        &self,
        h2: &mut Http2Connection,
        stream_id: torii_http_core::h2::frame::StreamId,
        response: Response,
    ) -> Result<(), CoreError> {
        let head = to_h2_response(&response);
        let body = response
            .body
            .unwrap_or_else(|| Box::new(torii_http_core::body::InMemoryBody::new(Vec::new())));
        if let Err(err) = h2.queue_response(stream_id, head, body) {
            tracing::debug!(%err, "response dropped for dead stream");
        }
        Ok(())
    }

    /// `101` with the accept key, then the WebSocket echo loop.
    async fn upgrade_websocket(
        &self,
        conn: &mut Connection,
        mut engine: Option<&mut TlsEngine>,
        client_key: &str,
    ) -> Result<(), CoreError> {
        let headers = ws::handshake_headers(client_key);
        h1::encode_response_head(StatusCode::SWITCHING_PROTOCOLS, &headers, conn.send_buf())?;
        self.flush(conn, engine.as_deref_mut()).await?;
        tracing::debug!("switched to websocket");

        let mut reader = ws::FrameReader::new();
        let mut assembler = ws::MessageAssembler::new();

        loop {
            let frame = match reader.read_frame(conn.recv_buf()) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if self.receive(conn, engine.as_deref_mut()).await? == 0 {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => {
                    tracing::info!(%err, "closing on malformed websocket frame");
                    ws::protocol::write_message(
                        conn.send_buf(),
                        &ws::Message::Close(Some((1002, "protocol error".into()))),
                    )?;
                    self.flush(conn, engine.as_deref_mut()).await?;
                    return Ok(());
                }
            };

            let message = match assembler.push(frame) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(err) => {
                    tracing::info!(%err, "closing on websocket fragment violation");
                    ws::protocol::write_message(
                        conn.send_buf(),
                        &ws::Message::Close(Some((1002, "protocol error".into()))),
                    )?;
                    self.flush(conn, engine.as_deref_mut()).await?;
                    return Ok(());
                }
            };

            let reply = match message {
                ws::Message::Ping(payload) => Some(ws::Message::Pong(payload)),
                ws::Message::Pong(_) => None,
                ws::Message::Close(reason) => {
                    ws::protocol::write_message(conn.send_buf(), &ws::Message::Close(reason))?;
                    self.flush(conn, engine.as_deref_mut()).await?;
                    return Ok(());
                }
                // Data messages echo back; the service seam for real
                // applications hangs off this match.
                other => Some(other),
            };

            if let Some(reply) = reply {
                ws::protocol::write_message(conn.send_buf(), &reply)?;
                self.flush(conn, engine.as_deref_mut()).await?;
            }
        }
    }

    /// Receives bytes, running them through the record layer when TLS
    /// is active. Returns the plaintext-visible byte count (zero on
    /// peer shutdown).
    async fn receive(
        &self,
        conn: &mut Connection,
        engine: Option<&mut TlsEngine>,
    ) -> Result<usize, CoreError> {
        let before = conn.recv_buf().readable();
        let n = conn.receive_some().await?;
        if n == 0 {
            return Ok(0);
        }
        if let Some(engine) = engine {
            let closed = engine.decrypt(conn.recv_buf()).map_err(tls_error)?;
            if closed {
                return Ok(0);
            }
        }
        Ok(conn.recv_buf().readable().saturating_sub(before).max(1))
    }

    /// Encrypts (when TLS) and drains the send buffer.
    async fn flush(
        &self,
        conn: &mut Connection,
        engine: Option<&mut TlsEngine>,
    ) -> Result<(), CoreError> {
        if let Some(engine) = engine {
            engine.encrypt(conn.send_buf()).map_err(tls_error)?;
        }
        conn.send_async().await
    }

    fn new_h2(&self) -> Http2Connection {
        Http2Connection::new(self.chunk_size())
    }

    fn chunk_size(&self) -> usize {
        (self.ctx.config().buffer_size / 2).max(4096)
    }

    fn server_name(&self) -> &str {
        &self.ctx.config().server_name
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("tls", &self.tls.is_some())
            .field("service", &self.service)
            .finish()
    }
}

fn tls_error(err: TlsError) -> CoreError {
    CoreError::Io(io::ErrorKind::InvalidData, Some(err.to_string()))
}

fn h2_io(err: proto::Error) -> CoreError {
    CoreError::Io(io::ErrorKind::InvalidData, Some(err.to_string()))
}
