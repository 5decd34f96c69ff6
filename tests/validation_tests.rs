use bulkretry::bulk::DocWriteRequest;
use bulkretry::validation::{validate_request, IndexNameValidator, InvalidRequest};
use serde_json::json;

#[test]
fn test_valid_index_names() {
    let validator = IndexNameValidator::new();

    assert!(validator.is_valid("logs"));
    assert!(validator.is_valid("logs-2024.01.01"));
    assert!(validator.is_valid(".internal"));
    assert!(validator.is_valid("a"));
}

#[test]
fn test_invalid_index_names() {
    let validator = IndexNameValidator::new();

    // Empty and dot-only names
    assert!(!validator.is_valid(""));
    assert!(!validator.is_valid("."));
    assert!(!validator.is_valid(".."));

    // Uppercase
    assert!(!validator.is_valid("Logs"));

    // Forbidden leading characters
    assert!(!validator.is_valid("_logs"));
    assert!(!validator.is_valid("-logs"));
    assert!(!validator.is_valid("+logs"));

    // Forbidden characters
    assert!(!validator.is_valid("logs/2024"));
    assert!(!validator.is_valid("logs*"));
    assert!(!validator.is_valid("my logs"));
    assert!(!validator.is_valid("logs#1"));

    // Too long
    assert!(!validator.is_valid(&"a".repeat(256)));
    assert!(validator.is_valid(&"a".repeat(255)));
}

#[test]
fn test_validate_request() {
    assert!(validate_request(&DocWriteRequest::index("logs", json!({}))).is_ok());
    assert!(validate_request(&DocWriteRequest::delete("logs", "1")).is_ok());

    match validate_request(&DocWriteRequest::index("Logs", json!({}))) {
        Err(InvalidRequest::IndexName { name, reason }) => {
            assert_eq!(name, "Logs");
            assert_eq!(reason, "must be lowercase");
        }
        other => panic!("Expected index name error, got {:?}", other),
    }

    assert_eq!(
        validate_request(&DocWriteRequest::update("logs", "", json!({}))),
        Err(InvalidRequest::EmptyId)
    );
    assert_eq!(
        validate_request(&DocWriteRequest::delete("logs", "x".repeat(513))),
        Err(InvalidRequest::IdTooLong(513))
    );
}
