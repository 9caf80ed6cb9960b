//! The decode-and-log pipeline run for every inbound request.
//!
//! Every step returns a `Result` that is written to the [`Trace`] and then
//! dropped; nothing here can fail the request.

use axum::body::{self, Body};
use axum::http::{header, HeaderMap, HeaderName, Method, Uri};
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::io::AsyncReadExt;

use crate::config::{Config, FormTrace};
use crate::decode::{self, FileStrategy, Registry, ValueStrategy, DATA_KEY};
use crate::form::{self, parse_form};
use crate::multipart::{self, parse_multipart, FilePart, Limits, MultipartForm};
use crate::trace::Trace;

/// Body sent back for every request.
pub const ACK_BODY: &str = r#"{"success":"true"}"#;

const RULE: &str = "######";

/// One request, body still unread.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Body,
}

fn header_value(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    let values: Vec<_> = headers
        .get_all(name)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

fn prefixed(prefix: &str, data: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(prefix.len() + data.len());
    line.extend_from_slice(prefix.as_bytes());
    line.extend_from_slice(data);
    line
}

#[derive(Clone, Debug)]
pub struct Inspector {
    registry: Registry,
    max_output_bytes: usize,
    multipart_memory_bytes: u64,
    max_body_bytes: usize,
    form_trace: FormTrace,
}

impl Inspector {
    pub fn new(config: &Config) -> Self {
        Self {
            registry: config.registry(),
            max_output_bytes: config.max_output_bytes,
            multipart_memory_bytes: config.multipart_memory_bytes,
            max_body_bytes: config.max_body_bytes,
            form_trace: config.form_trace,
        }
    }

    async fn read_body(&self, raw: Body) -> (Bytes, Option<String>) {
        match body::to_bytes(raw, self.max_body_bytes).await {
            Ok(bytes) => (bytes, None),
            Err(err) => (Bytes::new(), Some(err.to_string())),
        }
    }

    pub async fn inspect(&self, request: InboundRequest) -> Trace {
        let InboundRequest {
            method,
            uri,
            headers,
            body,
        } = request;

        let mut trace = Trace::new();
        trace.line(RULE);
        trace.line(format!("# {method} request to {uri}"));
        trace.line(trace.stamp());

        if let Some(agent) = header_value(&headers, header::USER_AGENT) {
            trace.line(format!("# from {agent}"));
        }
        let content_type = header_value(&headers, header::CONTENT_TYPE);
        if let Some(content_type) = &content_type {
            trace.line(format!("# {content_type}"));
        }
        if let Some(length) = header_value(&headers, header::CONTENT_LENGTH) {
            trace.line(format!("# {length} bytes"));
        }

        // the body is read once, by whichever step claims it first
        let mut body = Some(body);
        let mut body_error = None;

        let form_input = match body.take() {
            Some(raw) if form::reads_body(&method, content_type.as_deref()) => {
                let (bytes, err) = self.read_body(raw).await;
                body_error = err;
                bytes
            }
            unread => {
                body = unread;
                Bytes::new()
            }
        };
        let form = parse_form(&method, uri.query(), content_type.as_deref(), &form_input);
        if let Some(err) = &form.error {
            trace.error(format!("# form error: {err}"));
        }
        if self.form_trace.should_log(form.error.is_some()) {
            trace.line(format!("# form: {}", form.form));
        }

        let parsed = match multipart::boundary(content_type.as_deref()) {
            Ok(boundary) => {
                let raw = body.take().unwrap_or_default();
                let limits = Limits {
                    memory: self.multipart_memory_bytes,
                    body: self.max_body_bytes as u64,
                };
                parse_multipart(boundary, raw.into_data_stream(), limits).await
            }
            Err(err) => Err(err),
        };
        let (mut files, mut values) = (0, 0);
        match parsed {
            Ok(multipart) => {
                files = multipart.file_count();
                values = multipart.value_count();
                self.trace_multipart(&mut trace, &multipart).await;
            }
            Err(err) => trace.error(format!("# multipart error: {err}")),
        }

        if let Some(raw) = body.take() {
            let (rest, err) = self.read_body(raw).await;
            body_error = err;
            if !rest.is_empty() {
                trace.line(prefixed("# body: ", &rest));
            }
        }

        trace.line(RULE);
        trace.line("");
        trace.line("");

        if let Some(err) = &body_error {
            trace.error(format!("Error reading body: {err}"));
        }

        tracing::debug!(
            request_id = %trace.id(),
            method = %method,
            uri = %uri,
            files,
            values,
            errors = trace.error_count(),
            "Request inspected"
        );
        trace
    }

    async fn trace_multipart(&self, trace: &mut Trace, form: &MultipartForm) {
        if !form.files.is_empty() {
            trace.line("# multipart files:");
        }
        for (field, parts) in &form.files {
            for part in parts {
                self.trace_file(trace, field, part).await;
            }
        }

        if !form.values.is_empty() {
            trace.line("# multipart values:");
        }
        for (field, entries) in &form.values {
            self.trace_values(trace, field, entries);
        }
    }

    async fn trace_file(&self, trace: &mut Trace, field: &str, part: &FilePart) {
        trace.line(format!("# {}: {} bytes", part.filename(), part.size()));

        let data = {
            let mut reader = match part.open().await {
                Ok(reader) => reader,
                Err(err) => {
                    trace.error(format!("# Error opening file: {err}"));
                    return;
                }
            };
            let mut data = Vec::new();
            if let Err(err) = reader.read_to_end(&mut data).await {
                trace.error(format!("# Error reading file: {err}"));
                return;
            }
            data
        };

        let strategy = self.registry.file(field);
        if let Some(data) = apply_file_strategy(trace, strategy, data, self.max_output_bytes) {
            trace.line(format!("#\t{field}:"));
            trace.line(data);
        }
    }

    fn trace_values(&self, trace: &mut Trace, field: &str, entries: &[Bytes]) {
        let strategy = self.registry.value(field);
        if strategy == ValueStrategy::Raw {
            trace.line(format!("#\t{field}:"));
            for entry in entries {
                trace.line(prefixed("#\t\t", entry));
            }
            return;
        }

        let mut listed: Vec<BTreeMap<String, Vec<u8>>> = Vec::with_capacity(entries.len());
        for entry in entries {
            let map = match decode::json_map(entry) {
                Ok(map) => map,
                Err(err) => {
                    trace.error(format!("# Error decoding json: {err}"));
                    continue;
                }
            };
            let mut shown: BTreeMap<String, Vec<u8>> =
                map.into_iter().map(|(k, v)| (k, v.into_bytes())).collect();
            if strategy == ValueStrategy::JsonBase64 {
                if let Some(encoded) = shown.get_mut(DATA_KEY) {
                    match decode_data(trace, encoded, self.max_output_bytes) {
                        Some(decoded) => *encoded = decoded,
                        None => continue,
                    }
                }
            }
            listed.push(shown);
        }

        trace.line(format!("#\t{field}:"));
        for map in &listed {
            for (key, value) in map {
                trace.line(prefixed(&format!("#\t\t{key}: "), value));
            }
        }
    }
}

/// Run one file strategy over `data`, tracing each step.
///
/// Returns the bytes to show, or `None` when decoding failed and the part
/// should be left out.
pub fn apply_file_strategy(
    trace: &mut Trace,
    strategy: FileStrategy,
    data: Vec<u8>,
    max_output_bytes: usize,
) -> Option<Vec<u8>> {
    match strategy {
        FileStrategy::Raw => Some(data),
        FileStrategy::Gzip => match decode::gunzip(&data) {
            Ok(mut inflated) => {
                trace.line("# Decoded gzip data");
                cut(trace, &mut inflated, max_output_bytes);
                Some(inflated)
            }
            Err(err) if err.is_gzip_open() => {
                trace.error(format!("# Error opening gzipped data: {err}"));
                None
            }
            Err(err) => {
                trace.error(format!("# Error reading gzipped data: {err}"));
                None
            }
        },
        FileStrategy::JsonBase64 => {
            let mut map = match decode::json_map(&data) {
                Ok(map) => map,
                Err(err) => {
                    trace.error(format!("# Error decoding json: {err}"));
                    return None;
                }
            };
            // JSON strings must be UTF-8, so the re-encoded payload is lossy
            if let Some(encoded) = map.get_mut(DATA_KEY) {
                let decoded = decode_data(trace, encoded.as_bytes(), max_output_bytes)?;
                *encoded = String::from_utf8_lossy(&decoded).into_owned();
            }
            match serde_json::to_vec(&map) {
                Ok(encoded) => Some(encoded),
                Err(err) => {
                    trace.error(format!("# Error encoding json: {err}"));
                    None
                }
            }
        }
    }
}

/// Base64-decode a `data` entry and cut it. `None` if decoding failed.
fn decode_data(trace: &mut Trace, encoded: &[u8], max_output_bytes: usize) -> Option<Vec<u8>> {
    match decode::base64_decode(encoded) {
        Ok(mut decoded) => {
            trace.line("# Decoded base64 data");
            cut(trace, &mut decoded, max_output_bytes);
            Some(decoded)
        }
        Err(err) => {
            trace.error(format!("# Error decoding base64 data: {err}"));
            None
        }
    }
}

fn cut(trace: &mut Trace, data: &mut Vec<u8>, max: usize) {
    if decode::truncate(data, max) {
        trace.line(format!("# Note: cut output to {max} bytes"));
    }
}
