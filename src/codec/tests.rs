use std::io::{Cursor, Read};

use super::*;
use crate::message::{EchoRequest, EchoResponse, ExecuteOperationRequest, SimpleBasicMessage};
use crate::utils::error::DecodeError;

fn codec() -> Codec {
    Codec::default()
}

#[test]
fn encode_uses_short_type_name() {
    let text = Codec::encode(&EchoRequest::new("hi")).unwrap();
    assert_eq!(text, r#"EchoRequest={"echoMessage":"hi"}"#);
}

#[test]
fn decode_round_trips_with_equal_fields() {
    let original = ExecuteOperationRequest {
        feed_id: "feed-1".to_string(),
        resource_path: Some("/r;1".to_string()),
        operation_name: "Reload".to_string(),
        parameters: Some([("a".to_string(), "1".to_string())].into_iter().collect()),
        sender_request_id: Some("req-7".to_string()),
        sender_session_id: None,
        authentication: None,
    };
    let text = Codec::encode(&original).unwrap();
    let decoded: ExecuteOperationRequest = codec().decode_typed(&text).unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn decode_accepts_qualified_names() {
    let message = codec()
        .decode(r#"cmdbus.api.EchoResponse={"reply":"r"}"#)
        .unwrap();
    assert_eq!(message.type_name(), "EchoResponse");
}

#[test]
fn decode_splits_on_first_separator() {
    let message: SimpleBasicMessage = codec()
        .decode_typed(r#"SimpleBasicMessage={"message":"a=b=c"}"#)
        .unwrap();
    assert_eq!(message.message, "a=b=c");
}

#[test]
fn decode_without_separator_fails() {
    let err = codec().decode("this is not valid").unwrap_err();
    assert!(matches!(err, DecodeError::MissingSeparator(_)));
}

#[test]
fn decode_unknown_type_fails() {
    let err = codec().decode("NoSuchThing={}").unwrap_err();
    match err {
        DecodeError::UnknownType(name) => assert_eq!(name, "cmdbus.api.NoSuchThing"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn decode_rejects_unknown_fields() {
    let err = codec()
        .decode(r#"EchoRequest={"echoMessage":"hi","boo":"yaa"}"#)
        .unwrap_err();
    assert!(matches!(err, DecodeError::InvalidJson { .. }));
}

#[test]
fn decode_typed_reports_mismatch() {
    let err = codec()
        .decode_typed::<EchoRequest>(r#"EchoResponse={"reply":"r"}"#)
        .unwrap_err();
    match err {
        DecodeError::UnexpectedType { expected, actual } => {
            assert_eq!(expected, "EchoRequest");
            assert_eq!(actual, "EchoResponse");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn custom_namespace_registration() {
    let mut registry = TypeRegistry::new("org.example");
    registry
        .register::<EchoRequest>()
        .register_in::<EchoResponse>("other.ns");
    assert!(registry.contains("EchoRequest"));
    assert!(registry.contains("other.ns.EchoResponse"));
    assert!(!registry.contains("EchoResponse"));
    assert_eq!(registry.len(), 2);
}

#[test]
fn attachment_with_every_byte_value_survives() {
    let mut expected = Vec::new();
    for _ in 0..40 {
        expected.extend(0u8..=255);
    }
    let bytes =
        Codec::encode_with_attachment(&EchoRequest::new("hi"), Cursor::new(expected.clone()))
            .unwrap();

    let (message, mut attachment) = codec().decode_stream(Cursor::new(bytes)).unwrap();
    assert_eq!(message.type_name(), "EchoRequest");

    // Pull the attachment through a buffer smaller than its length.
    let mut received = Vec::new();
    let mut buffer = [0u8; 1000];
    loop {
        let n = attachment.read(&mut buffer).unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buffer[..n]);
    }
    assert_eq!(received, expected);
}

#[test]
fn decode_stream_does_not_consume_past_the_object() {
    let mut bytes = Codec::encode(&EchoRequest::new("hi")).unwrap().into_bytes();
    bytes.extend_from_slice(b"deadbeef");
    let mut cursor = Cursor::new(bytes);

    let (_, attachment) = codec().decode_stream(&mut cursor).unwrap();
    drop(attachment);

    let mut rest = String::new();
    cursor.read_to_string(&mut rest).unwrap();
    assert_eq!(rest, "deadbeef");
}

#[test]
fn envelope_reader_matches_eager_encoding() {
    let message = SimpleBasicMessage::new("stream me");
    let eager =
        Codec::encode_with_attachment(&message, Cursor::new(b"payload".to_vec())).unwrap();

    let mut streamed = Vec::new();
    Codec::envelope_reader(&message, Cursor::new(b"payload".to_vec()))
        .unwrap()
        .read_to_end(&mut streamed)
        .unwrap();
    assert_eq!(streamed, eager);
}

#[test]
fn decode_stream_typed_returns_attachment() {
    let bytes =
        Codec::encode_with_attachment(&EchoRequest::new("x"), Cursor::new(b"tail".to_vec()))
            .unwrap();
    let (request, attachment) = codec()
        .decode_stream_typed::<EchoRequest, _>(Cursor::new(bytes))
        .unwrap();
    assert_eq!(request.echo_message, "x");
    assert_eq!(attachment.read_to_vec().unwrap(), b"tail");
}

#[test]
fn stream_ending_before_separator_fails() {
    let err = codec()
        .decode_stream(Cursor::new(b"EchoRequest".to_vec()))
        .unwrap_err();
    assert!(matches!(err, DecodeError::UnexpectedEof));
}

#[test]
fn oversized_type_name_is_rejected() {
    let bytes = vec![b'a'; MAX_TYPE_NAME_LEN + 10];
    let err = codec().decode_stream(Cursor::new(bytes)).unwrap_err();
    assert!(matches!(err, DecodeError::TypeNameTooLong(MAX_TYPE_NAME_LEN)));
}

#[test]
fn garbage_json_in_stream_fails() {
    let err = codec()
        .decode_stream(Cursor::new(b"EchoRequest=not json".to_vec()))
        .unwrap_err();
    assert!(matches!(err, DecodeError::InvalidJson { .. }));
}
