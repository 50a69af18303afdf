#[cfg(test)]
mod tests {
    use crate::auth::{derive_keys, hmac, salted_password, SCRAM_SHA_256};
    use crate::{
        connect, ConnectConfig, Connecting, Connection, ConnectionState, Handshake,
        TransactionOptions, TransactionState,
    };
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use sha2::{Digest, Sha256};
    use std::sync::{Arc, Mutex};
    use strata_codec::ids;
    use strata_core::{ServerError, Severity, StrataError, TypeId, Value};
    use strata_protocol::backend::{
        Authentication, CommandDataDescription, LogMessage, ServerMessage,
    };
    use strata_protocol::descriptor::DescriptorWriter;
    use strata_protocol::frame::MessageCodec;
    use strata_protocol::frontend::ClientMessage;
    use strata_protocol::messages::{
        Capabilities, Cardinality, CommandParams, OutputFormat, ProtocolVersion,
        TransactionStatus,
    };
    use tokio::io::{duplex, DuplexStream};
    use tokio_util::codec::Framed;

    struct MockServer {
        framed: Framed<DuplexStream, MessageCodec>,
        status: TransactionStatus,
    }

    impl MockServer {
        async fn send(&mut self, msg: ServerMessage) {
            self.framed.send(msg.encode()).await.expect("server send");
        }

        async fn recv_opt(&mut self) -> Option<ClientMessage> {
            let msg = self.framed.next().await?.expect("client frame");
            Some(ClientMessage::decode(msg).expect("client message"))
        }

        async fn recv(&mut self) -> ClientMessage {
            self.recv_opt().await.expect("client message")
        }

        async fn expect_sync(&mut self) {
            assert_eq!(self.recv().await, ClientMessage::Sync);
        }

        async fn ready(&mut self) {
            let status = self.status;
            self.send(ServerMessage::ReadyForCommand {
                annotations: Vec::new(),
                status,
            })
            .await;
        }

        async fn accept(&mut self) {
            match self.recv().await {
                ClientMessage::ClientHandshake { version, params } => {
                    assert_eq!(version.major, 1);
                    assert!(params.contains(&("user".to_string(), "strata".to_string())));
                }
                other => panic!("expected handshake, got {other:?}"),
            }
            self.send(ServerMessage::Authentication(Authentication::Ok))
                .await;
            self.session_setup().await;
        }

        async fn session_setup(&mut self) {
            self.send(ServerMessage::ServerKeyData { data: [7; 32] })
                .await;
            self.send(ServerMessage::ParameterStatus {
                name: Bytes::from_static(b"suggested_pool_concurrency"),
                value: Bytes::from_static(b"8"),
            })
            .await;
            self.ready().await;
        }

        async fn expect_parse(&mut self) -> CommandParams {
            let params = match self.recv().await {
                ClientMessage::Parse(params) => params,
                other => panic!("expected Parse, got {other:?}"),
            };
            self.expect_sync().await;
            params
        }

        async fn expect_execute(&mut self) -> (CommandParams, Bytes) {
            let (params, arguments) = match self.recv().await {
                ClientMessage::Execute {
                    params, arguments, ..
                } => (params, arguments),
                other => panic!("expected Execute, got {other:?}"),
            };
            self.expect_sync().await;
            (params, arguments)
        }

        async fn description(
            &mut self,
            input_type: TypeId,
            input_descriptors: Bytes,
            output_type: TypeId,
            output_descriptors: Bytes,
        ) {
            self.send(ServerMessage::CommandDataDescription(CommandDataDescription {
                annotations: Vec::new(),
                capabilities: Capabilities::NONE,
                result_cardinality: Cardinality::Many,
                input_type,
                input_descriptors,
                output_type,
                output_descriptors,
            }))
            .await;
        }

        /// Parse answered with no input and an int64 output.
        async fn describe_int64(&mut self) {
            self.description(TypeId::EMPTY_TUPLE, Bytes::new(), ids::INT64, int64_output())
                .await;
            self.ready().await;
        }

        async fn complete(&mut self, status: &str) {
            self.send(ServerMessage::CommandComplete {
                annotations: Vec::new(),
                capabilities: Capabilities::NONE,
                status: status.to_string(),
            })
            .await;
            self.ready().await;
        }

        async fn error(&mut self, severity: Severity, code: u32, message: &str) {
            self.send(ServerMessage::ErrorResponse(ServerError {
                severity,
                code,
                message: message.to_string(),
                attributes: Vec::new(),
            }))
            .await;
        }
    }

    const SYNTAX_ERROR: u32 = 0x0401_0000;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn pair() -> (DuplexStream, MockServer) {
        init_tracing();
        let (client, server) = duplex(64 * 1024);
        let server = MockServer {
            framed: Framed::new(server, MessageCodec::new()),
            status: TransactionStatus::Idle,
        };
        (client, server)
    }

    async fn connected() -> (Connection<DuplexStream>, MockServer) {
        let (client, mut server) = pair();
        let config = ConnectConfig::default();
        let (conn, ()) = tokio::join!(connect(client, &config), server.accept());
        (conn.expect("connect"), server)
    }

    fn int64_output() -> Bytes {
        let mut writer = DescriptorWriter::new();
        writer.base_scalar(ids::INT64);
        writer.finish()
    }

    fn int64_row(n: i64) -> ServerMessage {
        ServerMessage::Data {
            payload: Bytes::copy_from_slice(&n.to_be_bytes()),
        }
    }

    #[tokio::test]
    async fn trust_handshake_reaches_ready() {
        let (conn, _server) = connected().await;
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.settings().suggested_pool_concurrency(), Some(8));
        assert_eq!(conn.settings().key_data(), Some(&[7u8; 32]));
        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
        assert!(!conn.is_in_transaction());
    }

    #[tokio::test]
    async fn handshake_moves_through_typed_phases() {
        let (client, mut server) = pair();
        let config = ConnectConfig::default();
        let client_side = async {
            let handshake = Handshake::<_, Connecting>::new(client, &config).expect("config");
            assert_eq!(handshake.state(), ConnectionState::Connecting);
            let handshake = handshake.start().await.expect("start");
            assert_eq!(handshake.state(), ConnectionState::Handshaking);
            let handshake = handshake.authenticate().await.expect("authenticate");
            assert_eq!(handshake.state(), ConnectionState::Authenticating);
            handshake.finish().await.expect("finish")
        };
        let (conn, ()) = tokio::join!(client_side, server.accept());
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn invalid_config_is_refused_before_io() {
        let (client, _server) = pair();
        let config = ConnectConfig {
            database: String::new(),
            ..ConnectConfig::default()
        };
        let err = Handshake::<_, Connecting>::new(client, &config)
            .err()
            .expect("empty database");
        assert!(matches!(err, StrataError::Config(_)));
    }

    async fn scram_server(server: &mut MockServer, password: &str) {
        assert!(matches!(
            server.recv().await,
            ClientMessage::ClientHandshake { .. }
        ));
        server
            .send(ServerMessage::Authentication(Authentication::Sasl {
                methods: vec![SCRAM_SHA_256.to_string()],
            }))
            .await;

        let ClientMessage::SaslInitialResponse { method, data } = server.recv().await else {
            panic!("expected SASL initial response");
        };
        assert_eq!(method, SCRAM_SHA_256);
        let client_first = String::from_utf8(data.to_vec()).expect("utf8");
        let bare = client_first.strip_prefix("n,,").expect("gs2 header").to_string();
        let client_nonce = bare
            .split(',')
            .find_map(|attr| attr.strip_prefix("r="))
            .expect("client nonce");
        let salt = b"strata-salt";
        let server_first = format!("r={client_nonce}srv,s={},i=64", STANDARD.encode(salt));
        server
            .send(ServerMessage::Authentication(Authentication::SaslContinue {
                data: Bytes::from(server_first.clone()),
            }))
            .await;

        let ClientMessage::SaslResponse { data } = server.recv().await else {
            panic!("expected SASL response");
        };
        let client_final = String::from_utf8(data.to_vec()).expect("utf8");
        let (without_proof, proof) = client_final.rsplit_once(",p=").expect("proof");
        let auth_message = format!("{bare},{server_first},{without_proof}");
        let keys = derive_keys(&salted_password(password.as_bytes(), salt, 64))
            .expect("keys");
        let signature = hmac(&keys.stored_key, auth_message.as_bytes()).expect("signature");
        let client_key: Vec<u8> = STANDARD
            .decode(proof)
            .expect("proof base64")
            .iter()
            .zip(signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        let stored: [u8; 32] = Sha256::digest(&client_key).into();
        if stored != keys.stored_key {
            server
                .error(Severity::ERROR, 0x0701_0000, "authentication failed")
                .await;
            return;
        }
        let verifier = hmac(&keys.server_key, auth_message.as_bytes()).expect("verifier");
        server
            .send(ServerMessage::Authentication(Authentication::SaslFinal {
                data: Bytes::from(format!("v={}", STANDARD.encode(verifier))),
            }))
            .await;
        server
            .send(ServerMessage::Authentication(Authentication::Ok))
            .await;
        server.session_setup().await;
    }

    #[tokio::test]
    async fn scram_handshake_authenticates() {
        let (client, mut server) = pair();
        let config = ConnectConfig {
            password: Some("pencil".into()),
            ..ConnectConfig::default()
        };
        let (conn, ()) = tokio::join!(connect(client, &config), scram_server(&mut server, "pencil"));
        let conn = conn.expect("connect");
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn scram_with_wrong_password_fails() {
        let (client, mut server) = pair();
        let config = ConnectConfig {
            password: Some("wrong".into()),
            ..ConnectConfig::default()
        };
        let (conn, ()) = tokio::join!(connect(client, &config), scram_server(&mut server, "pencil"));
        assert!(matches!(conn, Err(StrataError::Authentication(_))));
    }

    #[tokio::test]
    async fn sasl_without_password_fails() {
        let (client, mut server) = pair();
        let script = async {
            server.recv().await;
            server
                .send(ServerMessage::Authentication(Authentication::Sasl {
                    methods: vec![SCRAM_SHA_256.to_string()],
                }))
                .await;
        };
        let config = ConnectConfig::default();
        let (conn, ()) = tokio::join!(connect(client, &config), script);
        assert!(matches!(conn, Err(StrataError::Authentication(_))));
    }

    #[tokio::test]
    async fn unsupported_protocol_version_is_rejected() {
        let (client, mut server) = pair();
        let script = async {
            server.recv().await;
            server
                .send(ServerMessage::ServerHandshake {
                    version: ProtocolVersion { major: 2, minor: 0 },
                    extensions: Vec::new(),
                })
                .await;
        };
        let config = ConnectConfig::default();
        let (conn, ()) = tokio::join!(connect(client, &config), script);
        assert!(matches!(conn, Err(StrataError::Framing(_))));
    }

    #[tokio::test]
    async fn execute_yields_each_row_then_ends() {
        let (mut conn, mut server) = connected().await;
        let client = async {
            let mut rows = conn
                .execute("select {1, 2, 3}", &Value::Nothing)
                .await
                .expect("execute");
            let mut seen = Vec::new();
            while let Some(row) = rows.next().await.expect("row") {
                seen.push(row);
            }
            assert_eq!(rows.rows_read(), 3);
            assert!(matches!(
                rows.next().await,
                Err(StrataError::ProtocolState(_))
            ));
            seen
        };
        let script = async {
            let params = server.expect_parse().await;
            assert_eq!(params.command_text, "select {1, 2, 3}");
            assert_eq!(params.output_format, OutputFormat::Binary);
            server.describe_int64().await;
            server.expect_execute().await;
            for n in 1..=3 {
                server.send(int64_row(n)).await;
            }
            server.complete("SELECT").await;
        };
        let (seen, ()) = tokio::join!(client, script);
        assert_eq!(seen, vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)]);
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.last_status(), Some("SELECT"));
    }

    #[tokio::test]
    async fn second_execute_while_streaming_fails_without_io() {
        let (mut conn, mut server) = connected().await;
        let client = async {
            let mut rows = conn
                .execute("select 1", &Value::Nothing)
                .await
                .expect("execute");
            assert_eq!(rows.next().await.expect("row"), Some(Value::Int64(1)));
            drop(rows);

            let err = conn
                .execute("select 2", &Value::Nothing)
                .await
                .err()
                .expect("busy connection");
            assert!(matches!(err, StrataError::ProtocolState(_)));
            assert_eq!(conn.state(), ConnectionState::Executing);

            conn.discard_pending_results().await.expect("discard");
            assert_eq!(conn.state(), ConnectionState::Ready);
        };
        let script = async {
            server.expect_parse().await;
            server.describe_int64().await;
            server.expect_execute().await;
            server.send(int64_row(1)).await;
            server.send(int64_row(2)).await;
            server.complete("SELECT").await;
        };
        tokio::join!(client, script);

        let (closed, next) = tokio::join!(conn.close(), server.recv());
        closed.expect("close");
        assert_eq!(next, ClientMessage::Terminate);
    }

    #[tokio::test]
    async fn query_cache_skips_parse() {
        let (mut conn, mut server) = connected().await;
        let client = async {
            for _ in 0..2 {
                let rows = conn.query("select 1", &Value::Nothing).await.expect("query");
                assert_eq!(rows, vec![Value::Int64(1)]);
            }
            assert_eq!(conn.query_cache().len(), 1);
        };
        let script = async {
            server.expect_parse().await;
            server.describe_int64().await;
            server.expect_execute().await;
            server.send(int64_row(1)).await;
            server.complete("SELECT").await;

            let (params, _) = server.expect_execute().await;
            assert_eq!(params.command_text, "select 1");
            server.send(int64_row(1)).await;
            server.complete("SELECT").await;
        };
        tokio::join!(client, script);
    }

    #[tokio::test]
    async fn stale_descriptor_error_invalidates_caches() {
        let (mut conn, mut server) = connected().await;
        let client = async {
            conn.query("select 1", &Value::Nothing).await.expect("first");
            let err = conn
                .query("select 1", &Value::Nothing)
                .await
                .expect_err("stale");
            match err {
                StrataError::Server(err) => assert!(err.invalidates_type_cache()),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(conn.state(), ConnectionState::Ready);
            assert!(conn.query_cache().is_empty());
            assert!(conn.registry().is_empty());
            conn.query("select 1", &Value::Nothing).await.expect("third")
        };
        let script = async {
            server.expect_parse().await;
            server.describe_int64().await;
            server.expect_execute().await;
            server.send(int64_row(1)).await;
            server.complete("SELECT").await;

            server.expect_execute().await;
            server
                .error(
                    Severity::ERROR,
                    ServerError::STALE_TYPE_DESCRIPTORS,
                    "type descriptors changed",
                )
                .await;
            server.ready().await;

            server.expect_parse().await;
            server.describe_int64().await;
            server.expect_execute().await;
            server.send(int64_row(1)).await;
            server.complete("SELECT").await;
        };
        let (third, ()) = tokio::join!(client, script);
        assert_eq!(third, vec![Value::Int64(1)]);
        assert_eq!(conn.registry().epoch(), 1);
    }

    #[tokio::test]
    async fn non_fatal_error_returns_to_ready() {
        let (mut conn, mut server) = connected().await;
        let client = async {
            let err = conn
                .query("selec 1", &Value::Nothing)
                .await
                .expect_err("syntax");
            assert!(matches!(err, StrataError::Server(_)));
            assert_eq!(conn.state(), ConnectionState::Ready);
            conn.query("select 1", &Value::Nothing).await.expect("retry")
        };
        let script = async {
            server.expect_parse().await;
            server.error(Severity::ERROR, SYNTAX_ERROR, "unexpected 'selec'").await;
            server.ready().await;

            server.expect_parse().await;
            server.describe_int64().await;
            server.expect_execute().await;
            server.send(int64_row(1)).await;
            server.complete("SELECT").await;
        };
        let (rows, ()) = tokio::join!(client, script);
        assert_eq!(rows, vec![Value::Int64(1)]);
    }

    #[tokio::test]
    async fn fatal_error_fails_the_connection() {
        let (mut conn, mut server) = connected().await;
        let script = async {
            server.expect_parse().await;
            server.error(Severity::FATAL, 0x0100_0000, "shutting down").await;
        };
        let (result, ()) = tokio::join!(conn.query("select 1", &Value::Nothing), script);
        assert!(matches!(result, Err(StrataError::Server(_))));
        assert_eq!(conn.state(), ConnectionState::Failed);

        let err = conn
            .query("select 1", &Value::Nothing)
            .await
            .expect_err("failed connection");
        assert!(matches!(err, StrataError::ProtocolState(_)));
    }

    #[tokio::test]
    async fn mid_stream_decode_error_fails_the_connection() {
        let (mut conn, mut server) = connected().await;
        let client = async {
            let mut rows = conn
                .execute("select 1", &Value::Nothing)
                .await
                .expect("execute");
            assert!(matches!(rows.next().await, Err(StrataError::Codec(_))));
            assert!(matches!(
                rows.next().await,
                Err(StrataError::ProtocolState(_))
            ));
        };
        let script = async {
            server.expect_parse().await;
            server.describe_int64().await;
            server.expect_execute().await;
            server
                .send(ServerMessage::Data {
                    payload: Bytes::from_static(&[1, 2, 3]),
                })
                .await;
        };
        tokio::join!(client, script);
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn cancellation_fails_the_connection() {
        let (mut conn, mut server) = connected().await;
        let token = conn.cancellation_token();
        let script = async {
            server.expect_parse().await;
            token.cancel();
        };
        let (result, ()) = tokio::join!(conn.query("select sleep(60)", &Value::Nothing), script);
        assert!(matches!(result, Err(StrataError::Cancelled)));
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn peer_close_fails_the_connection() {
        let (mut conn, mut server) = connected().await;
        let script = async move {
            server.expect_parse().await;
            drop(server);
        };
        let (result, ()) = tokio::join!(conn.query("select 1", &Value::Nothing), script);
        assert!(matches!(result, Err(StrataError::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn log_messages_reach_listeners() {
        let (mut conn, mut server) = connected().await;
        let logs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&logs);
        conn.add_log_listener(move |log| sink.lock().expect("lock").push(log.text.clone()));
        let removed = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&removed);
        let id = conn.add_log_listener(move |_| *counter.lock().expect("lock") += 1);
        assert!(conn.remove_log_listener(id));
        assert!(!conn.remove_log_listener(id));

        let script = async {
            server.expect_parse().await;
            server
                .send(ServerMessage::LogMessage(LogMessage {
                    severity: Severity::WARNING,
                    code: 0xF0_00_00_00,
                    text: "function is deprecated".into(),
                    annotations: Vec::new(),
                }))
                .await;
            server
                .send(ServerMessage::ParameterStatus {
                    name: Bytes::from_static(b"suggested_pool_concurrency"),
                    value: Bytes::from_static(b"4"),
                })
                .await;
            server.describe_int64().await;
            server.expect_execute().await;
            server.complete("SELECT").await;
        };
        let (rows, ()) = tokio::join!(conn.query("select old()", &Value::Nothing), script);
        assert!(rows.expect("query").is_empty());
        assert_eq!(*logs.lock().expect("lock"), vec!["function is deprecated".to_string()]);
        assert_eq!(*removed.lock().expect("lock"), 0);
        assert_eq!(conn.settings().suggested_pool_concurrency(), Some(4));
    }

    #[tokio::test]
    async fn redescription_during_execute_rebuilds_output_codec() {
        let (mut conn, mut server) = connected().await;
        let script = async {
            server.expect_parse().await;
            server.describe_int64().await;
            server.expect_execute().await;

            let mut writer = DescriptorWriter::new();
            writer.base_scalar(ids::STR);
            server
                .description(TypeId::EMPTY_TUPLE, Bytes::new(), ids::STR, writer.finish())
                .await;
            server
                .send(ServerMessage::Data {
                    payload: Bytes::from_static(b"hi"),
                })
                .await;
            server.complete("SELECT").await;
        };
        let (rows, ()) = tokio::join!(conn.query("select x", &Value::Nothing), script);
        assert_eq!(rows.expect("query"), vec![Value::Str("hi".into())]);
        assert!(conn.query_cache().is_empty());
        assert_eq!(conn.registry().epoch(), 1);
    }

    #[tokio::test]
    async fn argument_encoding_error_sends_nothing() {
        let (mut conn, mut server) = connected().await;
        let input_id = TypeId::from_u128(0x5EED_0001);
        let client = async {
            let err = conn
                .execute("select <int64>$0", &Value::Tuple(vec![Value::Str("x".into())]))
                .await
                .err()
                .expect("bad argument");
            assert!(matches!(err, StrataError::Codec(_)));
            assert_eq!(conn.state(), ConnectionState::Ready);
        };
        let script = async {
            server.expect_parse().await;
            let mut writer = DescriptorWriter::new();
            let int64 = writer.base_scalar(ids::INT64);
            writer.tuple(input_id, &[int64]);
            server
                .description(input_id, writer.finish(), ids::INT64, int64_output())
                .await;
            server.ready().await;
        };
        tokio::join!(client, script);

        let (closed, next) = tokio::join!(conn.close(), server.recv());
        closed.expect("close");
        assert_eq!(next, ClientMessage::Terminate);
    }

    #[tokio::test]
    async fn oversized_arguments_are_refused_before_sending() {
        let (client, mut server) = pair();
        let config = ConnectConfig {
            max_message_size: 1024,
            ..ConnectConfig::default()
        };
        let (conn, ()) = tokio::join!(connect(client, &config), server.accept());
        let mut conn = conn.expect("connect");
        let input_id = TypeId::from_u128(0x5EED_0002);
        let client = async {
            let big = Value::Tuple(vec![Value::Str("x".repeat(4096))]);
            let err = conn
                .execute("select <str>$0", &big)
                .await
                .err()
                .expect("too large");
            assert!(matches!(err, StrataError::Codec(_)));
            assert!(!err.is_fatal());
            assert_eq!(conn.state(), ConnectionState::Ready);
        };
        let script = async {
            server.expect_parse().await;
            let mut writer = DescriptorWriter::new();
            let text = writer.base_scalar(ids::STR);
            writer.tuple(input_id, &[text]);
            server
                .description(input_id, writer.finish(), ids::INT64, int64_output())
                .await;
            server.ready().await;
        };
        tokio::join!(client, script);

        let (closed, next) = tokio::join!(conn.close(), server.recv());
        closed.expect("close");
        assert_eq!(next, ClientMessage::Terminate);
    }

    #[tokio::test]
    async fn single_row_helpers_check_cardinality() {
        let (mut conn, mut server) = connected().await;
        let client = async {
            let one = conn
                .query_single("select 1 limit 1", &Value::Nothing)
                .await
                .expect("single");
            assert_eq!(one, Some(Value::Int64(1)));
            let err = conn
                .query_required_single("select {}", &Value::Nothing)
                .await
                .expect_err("no rows");
            assert!(matches!(err, StrataError::ProtocolState(_)));
            assert_eq!(conn.state(), ConnectionState::Ready);
            conn.execute_script("create type Item").await.expect("script");
        };
        let script = async {
            let params = server.expect_parse().await;
            assert_eq!(params.expected_cardinality, Cardinality::AtMostOne);
            server.describe_int64().await;
            server.expect_execute().await;
            server.send(int64_row(1)).await;
            server.complete("SELECT").await;

            let params = server.expect_parse().await;
            assert_eq!(params.expected_cardinality, Cardinality::One);
            server.describe_int64().await;
            server.expect_execute().await;
            server.complete("SELECT").await;

            let params = server.expect_parse().await;
            assert_eq!(params.output_format, OutputFormat::None);
            assert_eq!(params.expected_cardinality, Cardinality::NoResult);
            server
                .description(TypeId::EMPTY_TUPLE, Bytes::new(), TypeId::NULL, Bytes::new())
                .await;
            server.ready().await;
            server.expect_execute().await;
            server.complete("CREATE TYPE").await;
        };
        tokio::join!(client, script);
        assert_eq!(conn.last_status(), Some("CREATE TYPE"));
    }

    /// Answers every command with no data, tracking transaction status from
    /// the command text, until the client terminates.
    async fn serve_commands(mut server: MockServer) -> Vec<String> {
        let mut executed = Vec::new();
        loop {
            match server.recv_opt().await {
                Some(ClientMessage::Parse(_)) => {
                    server.expect_sync().await;
                    server
                        .description(TypeId::EMPTY_TUPLE, Bytes::new(), TypeId::NULL, Bytes::new())
                        .await;
                    server.ready().await;
                }
                Some(ClientMessage::Execute { params, .. }) => {
                    server.expect_sync().await;
                    let text = params.command_text;
                    if text.starts_with("START TRANSACTION") {
                        server.status = TransactionStatus::InTransaction;
                    } else if text == "COMMIT;" || text == "ROLLBACK;" {
                        server.status = TransactionStatus::Idle;
                    }
                    executed.push(text);
                    server.complete("OK").await;
                }
                Some(ClientMessage::Terminate) | None => return executed,
                Some(other) => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn transactions_and_savepoints_send_expected_text() {
        let (mut conn, server) = connected().await;
        let served = tokio::spawn(serve_commands(server));

        let mut tx = conn
            .transaction(TransactionOptions::serializable())
            .await
            .expect("start");
        assert_eq!(tx.state(), TransactionState::Started);
        assert!(tx.connection().is_in_transaction());
        {
            let mut savepoint = tx
                .nested(TransactionOptions::default())
                .await
                .expect("savepoint");
            assert_eq!(savepoint.block().savepoint(), Some("sp_1"));
            savepoint
                .connection()
                .execute_script("insert Item")
                .await
                .expect("insert");
            savepoint.rollback().await.expect("rollback to savepoint");
        }
        let err = tx
            .nested(TransactionOptions::default().readonly(true))
            .await
            .err()
            .expect("mismatched options");
        assert!(matches!(err, StrataError::ProtocolState(_)));
        tx.commit().await.expect("commit");
        assert!(!conn.is_in_transaction());

        let tx = conn
            .transaction(TransactionOptions::default())
            .await
            .expect("second start");
        tx.rollback().await.expect("rollback");

        conn.close().await.expect("close");
        let executed = served.await.expect("server task");
        assert_eq!(
            executed,
            vec![
                "START TRANSACTION ISOLATION SERIALIZABLE;",
                "DECLARE SAVEPOINT sp_1;",
                "insert Item",
                "ROLLBACK TO SAVEPOINT sp_1;",
                "COMMIT;",
                "START TRANSACTION;",
                "ROLLBACK;",
            ]
        );
    }
}
