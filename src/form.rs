//! Tolerant `application/x-www-form-urlencoded` parsing.
//!
//! Malformed pairs are reported but never stop the parse: every well-formed
//! pair still lands in the resulting [`Form`].

use axum::http::Method;
use mime::Mime;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use url::form_urlencoded;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("invalid URL escape {0:?}")]
    InvalidEscape(String),
    #[error("invalid semicolon separator in query")]
    Semicolon,
    #[error("invalid Content-Type {0:?}")]
    ContentType(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Form {
    fields: BTreeMap<String, Vec<String>>,
}

impl Form {
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.fields.get(key).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    fn push(&mut self, key: String, value: String) {
        self.fields.entry(key).or_default().push(value);
    }
}

impl fmt::Display for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, values)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}=[{}]", key, values.join(", "))?;
        }
        Ok(())
    }
}

/// Outcome of a form parse: the populated form, plus the first error seen.
#[derive(Debug, Default)]
pub struct FormParse {
    pub form: Form,
    pub error: Option<FormError>,
}

fn carries_form_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

fn is_urlencoded(m: &Mime) -> bool {
    m.type_() == mime::APPLICATION && m.subtype() == mime::WWW_FORM_URLENCODED
}

/// Whether [`parse_form`] will read the request body for this request.
pub fn reads_body(method: &Method, content_type: Option<&str>) -> bool {
    carries_form_body(method)
        && content_type
            .and_then(|ct| ct.parse::<Mime>().ok())
            .is_some_and(|m| is_urlencoded(&m))
}

/// Parse the URL query and, for POST/PUT/PATCH urlencoded requests, the body.
pub fn parse_form(
    method: &Method,
    query: Option<&str>,
    content_type: Option<&str>,
    body: &[u8],
) -> FormParse {
    let mut parsed = FormParse::default();

    if carries_form_body(method) {
        match content_type.map(str::parse::<Mime>) {
            Some(Ok(m)) if is_urlencoded(&m) => {
                let text = String::from_utf8_lossy(body);
                parsed.error = parse_pairs(&mut parsed.form, &text);
            }
            Some(Err(_)) => {
                parsed.error = content_type.map(|ct| FormError::ContentType(ct.to_owned()));
            }
            _ => {}
        }
    }

    if let Some(query) = query {
        let error = parse_pairs(&mut parsed.form, query);
        if parsed.error.is_none() {
            parsed.error = error;
        }
    }

    parsed
}

fn parse_pairs(form: &mut Form, input: &str) -> Option<FormError> {
    let mut first = None;
    for pair in input.split('&') {
        if pair.is_empty() {
            continue;
        }
        if pair.contains(';') {
            first.get_or_insert(FormError::Semicolon);
            continue;
        }
        if let Some(bad) = bad_escape(pair) {
            first.get_or_insert(FormError::InvalidEscape(bad));
            continue;
        }
        for (key, value) in form_urlencoded::parse(pair.as_bytes()) {
            form.push(key.into_owned(), value.into_owned());
        }
    }
    first
}

/// First `%` not followed by two hex digits, with whatever follows it (up to 3 chars).
fn bad_escape(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let ok = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !ok {
                let end = (i + 3).min(bytes.len());
                return Some(String::from_utf8_lossy(&bytes[i..end]).into_owned());
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    None
}
