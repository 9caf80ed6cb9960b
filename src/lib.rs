//! Diagnostic capture endpoint for datastore uploads.
//!
//! Every request is decoded as far as possible (urlencoded form, multipart
//! parts, then per-field JSON / base64 / gzip) and written out as a
//! human-readable trace. The caller always gets `{"success":"true"}`.

pub mod config;
pub mod decode;
pub mod form;
pub mod inspector;
pub mod multipart;
pub mod server;
pub mod trace;

pub use config::{Config, FormTrace};
pub use decode::{FileStrategy, Profile, Registry, ValueStrategy};
pub use inspector::{apply_file_strategy, InboundRequest, Inspector, ACK_BODY};
pub use trace::{Trace, TraceSink};
