//! Marker-protocol log classification
//!
//! The sandbox entrypoint talks to the engine through sentinel prefixes on
//! stdout lines. The boundary is line-oriented on purpose: it works from
//! any language the entrypoint happens to be written in. Unknown markers
//! are treated as opaque agent output.

pub const STATUS_PREFIX: &str = "###TELECODER_STATUS###";
pub const ERROR_PREFIX: &str = "###TELECODER_ERROR###";
pub const DONE_PREFIX: &str = "###TELECODER_DONE###";
pub const RESULT_PREFIX: &str = "###TELECODER_RESULT###";

/// Classification of a single sandbox log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker<'a> {
    /// Progress update
    Status(&'a str),
    /// Error message (non-fatal signaling)
    Error(&'a str),
    /// Terminal success, code changes pushed to the named branch
    Done(&'a str),
    /// Terminal success without code changes; payload is JSON
    Result(&'a str),
    /// Opaque agent output
    Output(&'a str),
}

pub fn classify(line: &str) -> Marker<'_> {
    if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
        return Marker::Status(rest.trim());
    }
    if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
        return Marker::Error(rest.trim());
    }
    if let Some(rest) = line.strip_prefix(DONE_PREFIX) {
        return Marker::Done(rest.trim());
    }
    if let Some(rest) = line.strip_prefix(RESULT_PREFIX) {
        return Marker::Result(rest.trim());
    }
    Marker::Output(line)
}

/// Payload of a RESULT marker
#[derive(Debug, serde::Deserialize)]
pub struct ResultPayload {
    #[serde(rename = "type")]
    pub result_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classify_markers() {
        assert_eq!(
            classify("###TELECODER_STATUS### Cloning repository"),
            Marker::Status("Cloning repository")
        );
        assert_eq!(
            classify("###TELECODER_ERROR### npm install failed"),
            Marker::Error("npm install failed")
        );
        assert_eq!(
            classify("###TELECODER_DONE### telecoder/abc123"),
            Marker::Done("telecoder/abc123")
        );
        assert_eq!(
            classify(r#"###TELECODER_RESULT### {"type":"text"}"#),
            Marker::Result(r#"{"type":"text"}"#)
        );
    }

    #[test]
    fn test_unknown_markers_are_opaque_output() {
        let line = "###TELECODER_SOMETHING### hm";
        assert_eq!(classify(line), Marker::Output(line));

        let plain = "Compiling telecoder v0.3.0";
        assert_eq!(classify(plain), Marker::Output(plain));
    }

    #[test]
    fn test_marker_mid_line_is_not_a_marker() {
        let line = "echo ###TELECODER_DONE### main";
        assert_eq!(classify(line), Marker::Output(line));
    }

    #[test]
    fn test_result_payload_parses() {
        let payload: ResultPayload = serde_json::from_str(r#"{"type":"text"}"#).unwrap();
        assert_eq!(payload.result_type, "text");
    }

    proptest! {
        // Any line that doesn't begin with one of the four sentinels must
        // come back as opaque output, byte for byte.
        #[test]
        fn prop_non_marker_lines_round_trip(line in "[^#\n][^\n]{0,120}") {
            prop_assert_eq!(classify(&line), Marker::Output(line.as_str()));
        }

        #[test]
        fn prop_status_payload_preserved(payload in "[a-zA-Z0-9 ._-]{0,80}") {
            let line = format!("{STATUS_PREFIX} {payload}");
            match classify(&line) {
                Marker::Status(text) => prop_assert_eq!(text, payload.trim()),
                other => prop_assert!(false, "expected status, got {:?}", other),
            }
        }
    }
}
