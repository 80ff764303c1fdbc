//! A streaming bencode codec: a byte-position-tracking pull parser plus a
//! canonical serde serializer, used for `.torrent` manifests, tracker
//! announce/scrape responses, resume files and LTEP extension payloads.

mod decode;
mod encode;
mod error;
mod span;
mod value;

pub use decode::{decode_bytes, decode_bytes_with_config, decode_str, DecoderConfig};
pub use encode::{encode_to_raw, encode_to_string};
pub use error::{Error, Result};
pub use span::dict_entry_span;
pub use value::Value;

/// Maximum container nesting depth the decoder accepts unless configured
/// otherwise. Matches the "configurable (default 32)" requirement for
/// untrusted bencode input.
pub const DEFAULT_MAX_DEPTH: usize = 32;
