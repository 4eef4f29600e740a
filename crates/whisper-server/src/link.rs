//! Secret identifiers and shareable links.
//!
//! A link looks like `https://host/view/<id>#<key>`. Browsers and HTTP clients
//! never send the fragment, so the server only learns the id.

use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use url::Url;

/// Random bytes per identifier (128 bits).
pub const ID_BYTES: usize = 16;
pub const ID_LEN: usize = ID_BYTES * 2;

const VIEW_PATH: &str = "/view/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("link is not a valid URL")]
    InvalidUrl,
    #[error("link has no key fragment")]
    MissingFragment,
    #[error("link does not contain a valid secret id")]
    InvalidId,
}

/// Fresh unguessable identifier: 16 CSPRNG bytes as lower-case hex.
pub fn new_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// True only for ids shaped exactly like [`new_id`] output.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

pub fn build_link(origin: &str, id: &str, exported_key: &str) -> String {
    format!(
        "{}{VIEW_PATH}{id}#{exported_key}",
        origin.trim_end_matches('/')
    )
}

/// The pieces of a link, recovered on the recipient side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLink {
    pub origin: String,
    pub id: String,
    pub key: String,
}

pub fn parse_link(link: &str) -> Result<ParsedLink, LinkError> {
    let url = Url::parse(link.trim()).map_err(|_| LinkError::InvalidUrl)?;

    let key = url
        .fragment()
        .filter(|f| !f.is_empty())
        .ok_or(LinkError::MissingFragment)?
        .to_owned();

    let id = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|id| is_valid_id(id))
        .ok_or(LinkError::InvalidId)?
        .to_owned();

    let path = url.path();
    let prefix = &path[..path.len() - id.len()];
    let base = prefix.strip_suffix(VIEW_PATH).ok_or(LinkError::InvalidId)?;
    let origin = format!("{}{}", url.origin().ascii_serialization(), base);

    Ok(ParsedLink { origin, id, key })
}
