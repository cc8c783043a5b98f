use corsgate::http::response::{Response, ResponseBuilder, StatusCode};
use corsgate::http::writer::serialize_response;

#[test]
fn test_status_code_range() {
    assert_eq!(StatusCode::from_u16(200), Some(StatusCode::OK));
    assert_eq!(StatusCode::from_u16(529).unwrap().as_u16(), 529);
    assert_eq!(StatusCode::from_u16(99), None);
    assert_eq!(StatusCode::from_u16(1000), None);
}

#[test]
fn test_status_code_reason_phrase() {
    assert_eq!(StatusCode::OK.reason_phrase(), "OK");
    assert_eq!(StatusCode::FORBIDDEN.reason_phrase(), "Forbidden");
    assert_eq!(StatusCode::BAD_GATEWAY.reason_phrase(), "Bad Gateway");
    assert_eq!(StatusCode::from_u16(299).unwrap().reason_phrase(), "");
}

#[test]
fn test_bodyless_statuses() {
    assert!(StatusCode::NO_CONTENT.is_bodyless());
    assert!(StatusCode::from_u16(304).unwrap().is_bodyless());
    assert!(StatusCode::from_u16(101).unwrap().is_bodyless());
    assert!(!StatusCode::OK.is_bodyless());
}

#[test]
fn test_response_builder_sets_content_length() {
    let response = ResponseBuilder::new(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(b"Hello, World!".to_vec())
        .build();

    assert_eq!(response.headers.get("content-length"), Some("13"));
    assert_eq!(response.headers.get("Content-Type"), Some("text/plain"));
}

#[test]
fn test_response_builder_keeps_explicit_content_length() {
    let response = ResponseBuilder::new(StatusCode::OK)
        .header("Content-Length", "42")
        .build();

    assert_eq!(response.headers.get("content-length"), Some("42"));
    assert_eq!(response.headers.len(), 1);
}

#[test]
fn test_json_response() {
    let response = Response::json(
        StatusCode::BAD_REQUEST,
        &serde_json::json!({"error": "Missing url query parameter"}),
    );

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.headers.get("Content-Type"), Some("application/json"));
    assert_eq!(response.body, br#"{"error":"Missing url query parameter"}"#);
}

#[test]
fn test_serialize_response() {
    let response = ResponseBuilder::new(StatusCode::OK)
        .header("X-A", "1")
        .body(b"hi".to_vec())
        .build();

    let bytes = serialize_response(&response, true);
    assert_eq!(bytes, b"HTTP/1.1 200 OK\r\nX-A: 1\r\nContent-Length: 2\r\n\r\nhi");

    let head_only = serialize_response(&response, false);
    assert!(head_only.ends_with(b"Content-Length: 2\r\n\r\n"));
}
