use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::FramingError;

/// Object keys longer than this can never match a wrapper key, so their text
/// is not retained while scanning.
const MAX_KEY_CAPTURE: usize = 64;

/// Wrapper keys under which the document event list may live.
const WRAPPER_KEYS: &[&str] = &["epcisBody", "queryResults", "resultsBody"];

/// The object key that opens the document event list.
const EVENT_LIST_KEY: &str = "eventList";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerKind {
    Object,
    Array,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ContainerKey {
    Root,
    Unknown,
    Named(String),
}

#[derive(Debug)]
struct Container {
    kind: ContainerKind,
    key: ContainerKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SeekRoot,
    Preamble,
    BetweenEvents,
    InEvent,
    Trailer,
    Done,
}

/// A decoder that frames the object form of an EPCIS document into one frame
/// per node: a synthesized document-header object first (every member seen
/// before the event list, with the dangling wrappers closed), then one frame
/// per event object, in input order.
///
/// The scanner is incremental: frames are recognized across arbitrary chunk
/// boundaries without buffering more than the current node. Only the document
/// preamble is held in full until the event list opens.
#[derive(Debug)]
pub struct JsonNodeDecoder {
    phase: Phase,
    scan_pos: usize,
    in_string: bool,
    escape: bool,
    containers: Vec<Container>,
    // Candidate key string, completed but not yet promoted by a `:`.
    pending_key: Option<(Option<String>, usize)>,
    // Promoted key awaiting its value: (text, separator offset).
    last_key: Option<(Option<String>, usize)>,
    // Offset of the most recent structural `{` or `,` outside any string.
    last_sep: usize,
    tok_start: usize,
    event_depth: usize,
    trailer_depth: usize,
}

impl JsonNodeDecoder {
    /// Creates a new `JsonNodeDecoder`.
    pub fn new() -> Self {
        Self {
            phase: Phase::SeekRoot,
            scan_pos: 0,
            in_string: false,
            escape: false,
            containers: Vec::new(),
            pending_key: None,
            last_key: None,
            last_sep: 0,
            tok_start: 0,
            event_depth: 0,
            trailer_depth: 0,
        }
    }

    /// True once the document structure has been fully consumed.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    fn wrapper_path_ok(&self) -> bool {
        self.containers.iter().all(|c| {
            c.kind == ContainerKind::Object
                && match &c.key {
                    ContainerKey::Root => true,
                    ContainerKey::Named(name) => WRAPPER_KEYS.contains(&name.as_str()),
                    ContainerKey::Unknown => false,
                }
        })
    }

    /// Builds the header frame from everything before the event-list key,
    /// closing the wrapper objects left dangling by the cut.
    fn synthesize_header(&self, src: &BytesMut, sep: usize) -> Bytes {
        let end = if src[sep] == b'{' { sep + 1 } else { sep };
        let mut frame = Vec::with_capacity(end + self.containers.len());
        frame.extend_from_slice(&src[..end]);
        frame.extend(std::iter::repeat(b'}').take(self.containers.len()));
        Bytes::from(frame)
    }

    fn scan(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        while self.scan_pos < src.len() {
            let pos = self.scan_pos;
            let byte = src[pos];
            self.scan_pos += 1;

            if self.in_string {
                if self.escape {
                    self.escape = false;
                } else if byte == b'\\' {
                    self.escape = true;
                } else if byte == b'"' {
                    self.in_string = false;
                    if self.phase == Phase::Preamble {
                        let start = self.tok_start;
                        let text = (pos - start <= MAX_KEY_CAPTURE)
                            .then(|| String::from_utf8_lossy(&src[start..pos]).into_owned());
                        self.pending_key = Some((text, self.last_sep));
                    }
                }
                continue;
            }

            match self.phase {
                Phase::SeekRoot => match byte {
                    b' ' | b'\t' | b'\n' | b'\r' => {
                        src.advance(pos + 1);
                        self.scan_pos = 0;
                    }
                    b'{' => {
                        // Drop anything before the root so offsets start at it.
                        src.advance(pos);
                        self.scan_pos = 1;
                        self.last_sep = 0;
                        self.containers.push(Container {
                            kind: ContainerKind::Object,
                            key: ContainerKey::Root,
                        });
                        self.phase = Phase::Preamble;
                    }
                    _ => {
                        return Err(FramingError::malformed(
                            "expected a top-level object document",
                        ))
                    }
                },
                Phase::Preamble => match byte {
                    b'"' => {
                        self.tok_start = pos + 1;
                        self.in_string = true;
                    }
                    b':' => {
                        if let Some(key) = self.pending_key.take() {
                            self.last_key = Some(key);
                        }
                    }
                    b'{' | b'[' => {
                        let (key, sep) = match self.last_key.take() {
                            Some((Some(name), sep)) => (ContainerKey::Named(name), sep),
                            Some((None, sep)) => (ContainerKey::Unknown, sep),
                            None => (ContainerKey::Unknown, self.last_sep),
                        };
                        if byte == b'['
                            && key == ContainerKey::Named(EVENT_LIST_KEY.into())
                            && self.wrapper_path_ok()
                        {
                            let frame = self.synthesize_header(src, sep);
                            src.advance(pos + 1);
                            self.scan_pos = 0;
                            self.trailer_depth = self.containers.len();
                            self.containers.clear();
                            self.pending_key = None;
                            self.phase = Phase::BetweenEvents;
                            return Ok(Some(frame));
                        }
                        if byte == b'{' {
                            self.last_sep = pos;
                        }
                        self.containers.push(Container {
                            kind: if byte == b'{' {
                                ContainerKind::Object
                            } else {
                                ContainerKind::Array
                            },
                            key,
                        });
                    }
                    b'}' | b']' => {
                        self.pending_key = None;
                        self.last_key = None;
                        if self.containers.pop().is_none() {
                            return Err(FramingError::malformed("unbalanced closing delimiter"));
                        }
                        if self.containers.is_empty() {
                            // No event list: the whole document is the header.
                            let frame = src.split_to(pos + 1).freeze();
                            self.scan_pos = 0;
                            self.phase = Phase::Done;
                            return Ok(Some(frame));
                        }
                    }
                    b',' => {
                        self.pending_key = None;
                        self.last_key = None;
                        self.last_sep = pos;
                    }
                    _ => {}
                },
                Phase::BetweenEvents => match byte {
                    b' ' | b'\t' | b'\n' | b'\r' | b',' => {}
                    b'{' => {
                        src.advance(pos);
                        self.scan_pos = 1;
                        self.event_depth = 1;
                        self.phase = Phase::InEvent;
                    }
                    b']' => {
                        src.advance(pos + 1);
                        self.scan_pos = 0;
                        self.phase = if self.trailer_depth == 0 {
                            Phase::Done
                        } else {
                            Phase::Trailer
                        };
                    }
                    _ => {
                        return Err(FramingError::malformed(
                            "expected an event object or the end of the event list",
                        ))
                    }
                },
                Phase::InEvent => match byte {
                    b'"' => self.in_string = true,
                    b'{' | b'[' => self.event_depth += 1,
                    b'}' | b']' => {
                        self.event_depth -= 1;
                        if self.event_depth == 0 {
                            let frame = src.split_to(pos + 1).freeze();
                            self.scan_pos = 0;
                            self.phase = Phase::BetweenEvents;
                            return Ok(Some(frame));
                        }
                    }
                    _ => {}
                },
                Phase::Trailer => match byte {
                    b'"' => self.in_string = true,
                    b'{' | b'[' => self.trailer_depth += 1,
                    b'}' | b']' => {
                        self.trailer_depth -= 1;
                        if self.trailer_depth == 0 {
                            src.advance(pos + 1);
                            self.scan_pos = 0;
                            self.phase = Phase::Done;
                        }
                    }
                    _ => {}
                },
                Phase::Done => match byte {
                    b' ' | b'\t' | b'\n' | b'\r' => {
                        src.advance(pos + 1);
                        self.scan_pos = 0;
                    }
                    _ => return Err(FramingError::malformed("content after document end")),
                },
            }
        }
        Ok(None)
    }
}

impl Default for JsonNodeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonNodeDecoder {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.scan(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.scan(src)? {
            Some(frame) => Ok(Some(frame)),
            None => match self.phase {
                Phase::Done => Ok(None),
                Phase::SeekRoot if src.is_empty() => Ok(None),
                _ => Err(FramingError::UnterminatedDocument),
            },
        }
    }
}

/// Outcome of feeding bytes to a [`ContextScanner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextScanOutcome {
    /// The scanner needs more input.
    NeedMore,
    /// The top-level `@context` member was captured; the payload is the raw
    /// JSON text of the member value.
    Found(Bytes),
    /// The document ended without a top-level `@context` member.
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtxPhase {
    SeekRoot,
    Scan,
    AwaitValue,
    CaptureContainer,
    CaptureString,
    CaptureScalar,
    Finished,
}

/// Scans a restarted byte sequence for the document-level `@context` member,
/// skipping over the event list and everything else. Memory use is bounded by
/// the size of the `@context` value.
#[derive(Debug)]
pub struct ContextScanner {
    phase: CtxPhase,
    depth: usize,
    in_string: bool,
    escape: bool,
    key_buf: Vec<u8>,
    in_key: bool,
    key_matches: bool,
    capture: Vec<u8>,
    capture_depth: usize,
}

impl ContextScanner {
    /// Creates a new `ContextScanner`.
    pub fn new() -> Self {
        Self {
            phase: CtxPhase::SeekRoot,
            depth: 0,
            in_string: false,
            escape: false,
            key_buf: Vec::new(),
            in_key: false,
            key_matches: false,
            capture: Vec::new(),
            capture_depth: 0,
        }
    }

    /// Feeds one chunk; returns as soon as the member has been captured.
    pub fn push(&mut self, chunk: &[u8]) -> ContextScanOutcome {
        for &byte in chunk {
            if self.in_string {
                let mut closed = false;
                if self.escape {
                    self.escape = false;
                } else if byte == b'\\' {
                    self.escape = true;
                } else if byte == b'"' {
                    self.in_string = false;
                    closed = true;
                }
                match self.phase {
                    CtxPhase::CaptureString | CtxPhase::CaptureContainer => {
                        self.capture.push(byte);
                        if closed && self.phase == CtxPhase::CaptureString {
                            self.phase = CtxPhase::Finished;
                            return ContextScanOutcome::Found(Bytes::from(std::mem::take(
                                &mut self.capture,
                            )));
                        }
                    }
                    _ => {
                        if self.in_key && !closed {
                            self.key_buf.push(byte);
                        }
                        if closed && self.in_key {
                            self.in_key = false;
                            self.key_matches = self.depth == 1 && self.key_buf == b"@context";
                        }
                    }
                }
                continue;
            }

            match self.phase {
                CtxPhase::SeekRoot => match byte {
                    b' ' | b'\t' | b'\n' | b'\r' => {}
                    b'{' => {
                        self.depth = 1;
                        self.phase = CtxPhase::Scan;
                    }
                    _ => return ContextScanOutcome::NotFound,
                },
                CtxPhase::Scan => match byte {
                    b'"' => {
                        self.in_string = true;
                        self.in_key = self.depth == 1 && !self.key_matches;
                        self.key_buf.clear();
                    }
                    b':' => {
                        if self.key_matches {
                            self.phase = CtxPhase::AwaitValue;
                        }
                    }
                    b'{' | b'[' => self.depth += 1,
                    b'}' | b']' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            self.phase = CtxPhase::Finished;
                            return ContextScanOutcome::NotFound;
                        }
                    }
                    b',' => self.key_matches = false,
                    _ => {}
                },
                CtxPhase::AwaitValue => match byte {
                    b' ' | b'\t' | b'\n' | b'\r' => {}
                    b'{' | b'[' => {
                        self.capture.push(byte);
                        self.capture_depth = 1;
                        self.phase = CtxPhase::CaptureContainer;
                    }
                    b'"' => {
                        self.capture.push(byte);
                        self.in_string = true;
                        self.phase = CtxPhase::CaptureString;
                    }
                    _ => {
                        self.capture.push(byte);
                        self.phase = CtxPhase::CaptureScalar;
                    }
                },
                CtxPhase::CaptureContainer => {
                    self.capture.push(byte);
                    match byte {
                        b'"' => self.in_string = true,
                        b'{' | b'[' => self.capture_depth += 1,
                        b'}' | b']' => {
                            self.capture_depth -= 1;
                            if self.capture_depth == 0 {
                                self.phase = CtxPhase::Finished;
                                return ContextScanOutcome::Found(Bytes::from(std::mem::take(
                                    &mut self.capture,
                                )));
                            }
                        }
                        _ => {}
                    }
                }
                // A string capture is driven entirely by the string branch
                // above; nothing to do outside it.
                CtxPhase::CaptureString => {}
                CtxPhase::CaptureScalar => match byte {
                    b',' | b'}' | b']' => {
                        self.phase = CtxPhase::Finished;
                        return ContextScanOutcome::Found(Bytes::from(std::mem::take(
                            &mut self.capture,
                        )));
                    }
                    _ => self.capture.push(byte),
                },
                CtxPhase::Finished => return ContextScanOutcome::NotFound,
            }
        }
        ContextScanOutcome::NeedMore
    }
}

impl Default for ContextScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn frames_of(input: &str, step: usize) -> Vec<String> {
        let mut decoder = JsonNodeDecoder::new();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for piece in input.as_bytes().chunks(step) {
            buf.extend_from_slice(piece);
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                frames.push(String::from_utf8(frame.to_vec()).unwrap());
            }
        }
        while let Some(frame) = decoder.decode_eof(&mut buf).unwrap() {
            frames.push(String::from_utf8(frame.to_vec()).unwrap());
        }
        frames
    }

    const REGULAR: &str = indoc! {r#"
        {"@context":["https://ref.gs1.org/standards/epcis/epcis-context.jsonld"],
         "type":"EPCISDocument","schemaVersion":"2.0",
         "creationDate":"2023-01-01T00:00:00Z",
         "epcisBody":{"eventList":[
            {"type":"ObjectEvent","action":"OBSERVE"},
            {"type":"AggregationEvent","action":"ADD"}
         ]}}
    "#};

    #[test]
    fn frames_header_then_events() {
        for step in [1, 3, 7, 4096] {
            let frames = frames_of(REGULAR, step);
            assert_eq!(frames.len(), 3, "step {step}");

            let header: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
            assert_eq!(header["type"], "EPCISDocument");
            assert_eq!(header["schemaVersion"], "2.0");
            assert!(header["epcisBody"].is_object());

            let first: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
            assert_eq!(first["type"], "ObjectEvent");
            let second: serde_json::Value = serde_json::from_str(&frames[2]).unwrap();
            assert_eq!(second["type"], "AggregationEvent");
        }
    }

    #[test]
    fn frames_query_document_wrappers() {
        let input = r#"{"type":"EPCISQueryDocument","epcisBody":{"queryResults":{
            "subscriptionID":"sub-1","queryName":"SimpleEventQuery",
            "resultsBody":{"eventList":[{"type":"ObjectEvent"}]}}}}"#;
        let frames = frames_of(input, 5);
        assert_eq!(frames.len(), 2);

        let header: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(
            header["epcisBody"]["queryResults"]["subscriptionID"],
            "sub-1"
        );
        assert_eq!(
            header["epcisBody"]["queryResults"]["queryName"],
            "SimpleEventQuery"
        );
    }

    #[test]
    fn document_without_event_list_is_one_header() {
        let input = r#"{"type":"EPCISDocument","schemaVersion":"2.0"}"#;
        let frames = frames_of(input, 4);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("EPCISDocument"));
    }

    #[test]
    fn event_list_token_inside_string_is_ignored() {
        let input = r#"{"note":"the eventList field","epcisBody":{"eventList":[{"type":"ObjectEvent"}]}}"#;
        let frames = frames_of(input, 9);
        assert_eq!(frames.len(), 2);
        let header: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(header["note"], "the eventList field");
    }

    #[test]
    fn nested_event_list_key_outside_wrappers_is_ignored() {
        let input = r#"{"other":{"eventList":[1,2]},"epcisBody":{"eventList":[{"type":"ObjectEvent"}]}}"#;
        let frames = frames_of(input, 11);
        assert_eq!(frames.len(), 2);
        let header: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(header["other"]["eventList"][1], 2);
    }

    #[test]
    fn events_with_nested_structure_frame_cleanly() {
        let input = r#"{"epcisBody":{"eventList":[
            {"type":"ObjectEvent","ext":{"a":[1,2,{"b":"}"}]}},
            {"type":"TransformationEvent","ilmd":{"x:y":"z"}}
        ]}}"#;
        let frames = frames_of(input, 6);
        assert_eq!(frames.len(), 3);
        let first: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(first["ext"]["a"][2]["b"], "}");
    }

    #[test]
    fn unterminated_document_errors_at_eof() {
        let mut decoder = JsonNodeDecoder::new();
        let mut buf = BytesMut::from(&br#"{"epcisBody":{"eventList":[{"type":"Obj"#[..]);
        // Header frame comes out, then the truncated event fails at EOF.
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(matches!(
            decoder.decode_eof(&mut buf),
            Err(FramingError::UnterminatedDocument)
        ));
    }

    #[test]
    fn non_object_root_is_rejected() {
        let mut decoder = JsonNodeDecoder::new();
        let mut buf = BytesMut::from(&b"[1,2,3]"[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FramingError::Malformed { .. })
        ));
    }

    #[test]
    fn context_scanner_finds_trailing_context() {
        let input = br#"{"epcisBody":{"eventList":[{"type":"ObjectEvent","x":"}]"}]},
            "@context":["https://example.com/ctx",{"ex":"https://ex.com/"}]}"#;
        let mut scanner = ContextScanner::new();
        let mut found = None;
        for piece in input.chunks(7) {
            match scanner.push(piece) {
                ContextScanOutcome::Found(bytes) => {
                    found = Some(bytes);
                    break;
                }
                ContextScanOutcome::NeedMore => {}
                ContextScanOutcome::NotFound => panic!("should find @context"),
            }
        }
        let value: serde_json::Value = serde_json::from_slice(&found.unwrap()).unwrap();
        assert_eq!(value[0], "https://example.com/ctx");
        assert_eq!(value[1]["ex"], "https://ex.com/");
    }

    #[test]
    fn context_scanner_reports_absence() {
        let input = br#"{"type":"EPCISDocument","epcisBody":{"eventList":[]}}"#;
        let mut scanner = ContextScanner::new();
        assert_eq!(scanner.push(input), ContextScanOutcome::NotFound);
    }
}
