use anyhow::Result;
use bytes::BytesMut;
use serde_json::{Value, json};

use tunnel_codec::{
    ControlMessage, Payload, decode, encode,
    message::{
        ClientRecord, DataConnection, Heartbeat, ProxyRequest, Response, ServiceKind,
        ServiceRecord, UnregisterService,
    },
    read_message, write_message,
};

fn auth_message() -> ControlMessage {
    ControlMessage::new(Payload::Auth(ClientRecord {
        tenant_id: "tenant-1".to_string(),
        client_id: "client-1".to_string(),
        client_name: "edge".to_string(),
        server_address: "127.0.0.1".to_string(),
        server_port: 7000,
        auth_token: "T".to_string(),
        use_tls: false,
        reconnect: Default::default(),
        heartbeat_interval: 30,
        heartbeat_timeout: 90,
    }))
}

#[test]
fn frame_shape_matches_contract() -> Result<()> {
    let value: Value = serde_json::to_value(auth_message())?;

    assert_eq!(value["type"], "auth");
    assert_eq!(value["data"]["clientId"], "client-1");
    assert_eq!(value["data"]["serverPort"], 7000);
    assert!(value.get("sessionId").is_some());
    assert!(value.get("timestamp").is_some());
    Ok(())
}

#[test]
fn response_payload_field_names() -> Result<()> {
    let mut response = Response::success("registered");
    response.service_id = Some("service-1".to_string());
    response.remote_port = Some(20000);

    let value: Value =
        serde_json::to_value(ControlMessage::with_session("s-1", Payload::Response(response)))?;

    assert_eq!(value["type"], "response");
    assert_eq!(value["sessionId"], "s-1");
    assert_eq!(value["data"]["success"], true);
    assert_eq!(value["data"]["serviceId"], "service-1");
    assert_eq!(value["data"]["remotePort"], 20000);

    // Unset optional payload fields stay off the wire entirely.
    assert!(value["data"].get("clientId").is_none());
    Ok(())
}

#[test]
fn round_trips() -> Result<()> {
    let messages = vec![
        auth_message(),
        ControlMessage::with_session(
            "s-1",
            Payload::Heartbeat(Heartbeat {
                client_id: "client-1".to_string(),
                timestamp: 42,
            }),
        ),
        ControlMessage::with_session(
            "s-1",
            Payload::RegisterService(ServiceRecord {
                tenant_id: "tenant-1".to_string(),
                service_id: String::new(),
                client_id: "client-1".to_string(),
                service_name: "ssh".to_string(),
                service_type: ServiceKind::Tcp,
                local_address: "127.0.0.1".to_string(),
                local_port: 22,
                remote_port: None,
                custom_domains: vec![],
                subdomain: None,
                headers: Default::default(),
                use_encryption: false,
                use_compression: false,
                health_check_type: None,
                health_check_url: None,
                max_connections: 0,
            }),
        ),
        ControlMessage::with_session(
            "s-1",
            Payload::UnregisterService(UnregisterService {
                service_id: "service-1".to_string(),
                service_name: "ssh".to_string(),
            }),
        ),
        ControlMessage::with_session(
            "s-1",
            Payload::ProxyRequest(ProxyRequest {
                connection_id: "c-1".to_string(),
                service_id: "service-1".to_string(),
                service_name: "ssh".to_string(),
                remote_address: "203.0.113.9".to_string(),
                remote_port: 51234,
            }),
        ),
        ControlMessage::new(Payload::DataConnection(DataConnection {
            connection_id: "c-1".to_string(),
            client_id: "client-1".to_string(),
            service_id: Some("service-1".to_string()),
        })),
    ];

    for message in messages {
        let bytes = serde_json::to_vec(&message)?;
        let parsed: ControlMessage = serde_json::from_slice(&bytes)?;
        assert_eq!(parsed, message);
    }

    Ok(())
}

#[test]
fn unknown_type_is_discardable() -> Result<()> {
    let frame = json!({
        "type": "telemetry_burst",
        "sessionId": "s-1",
        "data": {"anything": true},
        "timestamp": 1,
    });

    let parsed: ControlMessage = serde_json::from_value(frame)?;
    assert_eq!(parsed.payload, Payload::Unknown);
    Ok(())
}

#[test]
fn server_issued_frames_parse_strictly() {
    let frame = json!({
        "type": "proxy_request",
        "sessionId": "s-1",
        "data": {
            "connectionId": "c-1",
            "serviceId": "service-1",
            "serviceName": "ssh",
            "remoteAddress": "203.0.113.9",
            "remotePort": 51234,
            "surprise": 1,
        },
        "timestamp": 1,
    });

    assert!(serde_json::from_value::<ControlMessage>(frame).is_err());
}

#[test]
fn client_issued_frames_parse_leniently() -> Result<()> {
    let frame = json!({
        "type": "auth",
        "sessionId": "",
        "data": {
            "clientId": "client-1",
            "futureField": {"nested": true},
        },
        "timestamp": 1,
    });

    let parsed: ControlMessage = serde_json::from_value(frame)?;
    match parsed.payload {
        Payload::Auth(record) => assert_eq!(record.client_id, "client-1"),
        other => panic!("unexpected payload: {:?}", other),
    }

    Ok(())
}

#[test]
fn decode_waits_for_a_whole_frame() -> Result<()> {
    let mut framed = BytesMut::new();
    encode(&auth_message(), &mut framed)?;

    let mut buf = BytesMut::new();
    for chunk in framed.chunks(7) {
        assert!(decode(&mut buf, 1024 * 1024)?.is_none());
        buf.extend_from_slice(chunk);
    }

    assert!(decode(&mut buf, 1024 * 1024)?.is_some());
    assert!(buf.is_empty());
    Ok(())
}

#[test]
fn oversized_frames_are_rejected() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&(64u32 * 1024 * 1024).to_be_bytes());
    buf.extend_from_slice(b"{}");

    assert!(decode(&mut buf, 1024 * 1024).is_err());
}

#[tokio::test]
async fn stream_round_trip() -> Result<()> {
    let (mut near, mut far) = tokio::io::duplex(4096);

    let message = auth_message();
    write_message(&mut near, &message).await?;

    let parsed = read_message(&mut far, 1024 * 1024).await?;
    assert_eq!(parsed, message);
    Ok(())
}
