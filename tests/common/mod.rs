//! Shared test-only wire schema for the integration suites, mirroring the
//! corpus's own `TestMessage`/`TestResponse` convention: a generic
//! `{parameter: String}` pair used purely to exercise the framing and
//! message-passing layers without pulling in a real service's schema.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestMessage {
    pub parameter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResponse {
    pub parameter: String,
}
