//! End-to-end flows across the transaction core, driving the analysers the
//! way an event loop would.

use relais::buffer::Buffer;
use relais::config::{BackendConfig, FrontendConfig, ServerRef};
use relais::protocol::http::{
    forward_body, forward_headers, write_answer, AnalyserStatus, ConnMode, ResyncOutcome,
    Transaction, TxFlags,
};
use relais::protocol::http::chunk::ChunkStatus;
use relais::protocol::http::parser::MsgState;
use relais::protocol::proxy_protocol::{consume_v1_header, ProtocolV1};
use relais::rules::sample::ConnInfo;
use relais::stats::{apply_admin, build_admin_redirect, parse_admin_form, AdminOutcome};

fn buffer_with(raw: &[u8]) -> Buffer {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut buf = Buffer::with_capacity_and_margin(4096, 512);
    assert_eq!(buf.write(raw), raw.len());
    buf
}

#[test]
fn proxy_v1_handshake_before_http() {
    // the announced addresses replace the connection's before any HTTP
    // processing happens
    let mut buf = buffer_with(b"PROXY TCP4 1.2.3.4 5.6.7.8 1111 2222\r\nGET / HTTP/1.0\r\n\r\n");

    let header = consume_v1_header(&mut buf)
        .expect("valid header")
        .expect("complete header");
    assert_eq!(header.protocol, ProtocolV1::Tcp4);
    let conn = ConnInfo {
        src: header.addr_src,
        dst: header.addr_dst,
    };
    assert_eq!(conn.src, "1.2.3.4:1111".parse().unwrap());
    assert_eq!(conn.dst, "5.6.7.8:2222".parse().unwrap());

    let fe = FrontendConfig {
        mode: ConnMode::Close,
        ..FrontendConfig::default()
    };
    let mut txn = Transaction::new();
    let status = txn.process_request_headers(&mut buf, &fe, &BackendConfig::default(), 0);
    assert_eq!(status, AnalyserStatus::Complete);
    assert_eq!(txn.conn_mode, ConnMode::Close);
}

#[test]
fn split_proxy_header_waits_without_consuming() {
    let mut buf = buffer_with(b"PROXY TCP4 1.2.3.4 5.");
    assert_eq!(consume_v1_header(&mut buf), Ok(None));
    buf.write(b"6.7.8 1111 2222\r\nGET / HTTP/1.0\r\n\r\n");
    let header = consume_v1_header(&mut buf).unwrap().unwrap();
    assert_eq!(header.addr_dst.port(), 2222);
    assert_eq!(&buf.linearize_input()[..3], b"GET");
}

#[test]
fn stats_admin_post_with_expect_continue() {
    let fe = FrontendConfig::default();
    let be = BackendConfig {
        servers: vec![ServerRef {
            id: "web1".into(),
            cookie: None,
            up: true,
            maintenance: false,
        }],
        ..BackendConfig::default()
    };

    let body = b"b=app&action=disable&s=web1";
    let head = format!(
        "POST /admin HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut req_buf = buffer_with(head.as_bytes());
    let mut rsp_buf = Buffer::with_capacity_and_margin(4096, 0);

    let mut txn = Transaction::new();
    assert_eq!(
        txn.process_request_headers(&mut req_buf, &fe, &be, 0),
        AnalyserStatus::Complete
    );
    assert!(txn.flags.has(TxFlags::EXPECT_100));

    // the admin handler needs the body: answer the interim 100 first
    txn.emit_100_continue(&mut rsp_buf);
    assert_eq!(rsp_buf.output_slice(), b"HTTP/1.1 100 Continue\r\n\r\n");
    let n = rsp_buf.output_len();
    rsp_buf.consume_output(n);

    // the client now sends the body
    req_buf.write(body);
    forward_headers(&mut req_buf, &mut txn.req);
    assert_eq!(forward_body(&mut req_buf, &mut txn.req), ChunkStatus::Advanced);
    assert_eq!(txn.req.state, MsgState::Done);

    // the body went through the output side; the admin layer reads it
    let mut wire = Vec::new();
    while req_buf.output_len() > 0 {
        let part = req_buf.output_slice().to_vec();
        wire.extend_from_slice(&part);
        req_buf.consume_output(part.len());
    }
    let form_start = wire.len() - body.len();
    let form = parse_admin_form(&wire[form_start..]);
    assert_eq!(form.servers, vec!["web1".to_string()]);

    let mut servers = be.servers.clone();
    let outcome = apply_admin(&form, Some("app"), &mut servers, true);
    assert_eq!(outcome, AdminOutcome::Done);
    assert!(servers[0].maintenance);

    // the 303 goes back with the outcome in the location
    let answer = build_admin_redirect("/admin", outcome, true);
    write_answer(&mut rsp_buf, &answer);
    let text = String::from_utf8_lossy(rsp_buf.output_slice()).into_owned();
    assert!(text.contains("Location: /admin;st=DONE\r\n"), "{text}");
}

#[test]
fn http10_close_transaction_lifecycle() {
    // scenario: HTTP/1.0, keep-alive off: Connection: close on the
    // response, both sides closed at the end
    let fe = FrontendConfig {
        mode: ConnMode::Close,
        ..FrontendConfig::default()
    };
    let be = BackendConfig::default();

    let mut req_buf = buffer_with(b"GET / HTTP/1.0\r\n\r\n");
    let mut txn = Transaction::new();
    assert_eq!(
        txn.process_request_headers(&mut req_buf, &fe, &be, 0),
        AnalyserStatus::Complete
    );
    assert_eq!(txn.conn_mode, ConnMode::Close);
    forward_headers(&mut req_buf, &mut txn.req);
    assert_eq!(forward_body(&mut req_buf, &mut txn.req), ChunkStatus::Advanced);

    let mut rsp_buf = buffer_with(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    assert_eq!(
        txn.process_response_headers(&mut rsp_buf, &fe, &be, 0),
        AnalyserStatus::Complete
    );
    let text = rsp_buf.linearize_input();
    let text = String::from_utf8_lossy(&text);
    assert!(text.contains("Connection: close\r\n"), "{text}");

    forward_headers(&mut rsp_buf, &mut txn.rsp);
    assert_eq!(forward_body(&mut rsp_buf, &mut txn.rsp), ChunkStatus::Advanced);

    // drain both outputs, then the resync tears the connection down
    let n = req_buf.output_len();
    req_buf.consume_output(n);
    let n = rsp_buf.output_len();
    rsp_buf.consume_output(n);
    assert_eq!(
        txn.resync(&req_buf, &rsp_buf),
        ResyncOutcome::End {
            close_backend: true,
            close_client: true,
        }
    );
}
