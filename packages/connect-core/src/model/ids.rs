//! Spotify identifier types: [`SpotifyId`], [`FileId`], and [`AudioKey`].
//!
//! `SpotifyId` round-trips through four representations (base62, hex, raw
//! bytes, URI); the base62 alphabet is digits, then lowercase, then
//! uppercase, matching the wire format used by `open.spotify.com` links and
//! `spotify:` URIs.

use std::fmt;

use thiserror::Error;

const BASE62_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const BASE62_LEN: usize = 22;
const BASE16_LEN: usize = 32;

/// The kind of entity a [`SpotifyId`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpotifyItemType {
    Track,
    Album,
    Artist,
    Playlist,
    Episode,
    Show,
    User,
    Local,
    Unknown,
}

impl SpotifyItemType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Track => "track",
            Self::Album => "album",
            Self::Artist => "artist",
            Self::Playlist => "playlist",
            Self::Episode => "episode",
            Self::Show => "show",
            Self::User => "user",
            Self::Local => "local",
            Self::Unknown => "unknown",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "track" => Self::Track,
            "album" => Self::Album,
            "artist" => Self::Artist,
            "playlist" => Self::Playlist,
            "episode" => Self::Episode,
            "show" => Self::Show,
            "user" => Self::User,
            "local" => Self::Local,
            _ => Self::Unknown,
        }
    }
}

/// Errors parsing a [`SpotifyId`] from any of its textual representations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpotifyIdError {
    #[error("invalid base62 id: {0}")]
    InvalidBase62(String),

    #[error("invalid hex id: {0}")]
    InvalidHex(String),

    #[error("invalid spotify uri: {0}")]
    InvalidUri(String),

    #[error("invalid spotify open.spotify.com url: {0}")]
    InvalidUrl(String),
}

/// 128-bit Spotify identifier with a type tag.
///
/// Equality is over the 128-bit value and the type tag only; it carries no
/// other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpotifyId {
    value: u128,
    item_type: SpotifyItemType,
}

impl SpotifyId {
    /// Builds an id directly from its 128-bit value and type.
    pub fn new(value: u128, item_type: SpotifyItemType) -> Self {
        Self { value, item_type }
    }

    pub fn item_type(&self) -> SpotifyItemType {
        self.item_type
    }

    /// Raw 16-byte big-endian representation.
    pub fn to_raw(&self) -> [u8; 16] {
        self.value.to_be_bytes()
    }

    /// Builds an id from 16 raw big-endian bytes.
    pub fn from_raw(bytes: [u8; 16], item_type: SpotifyItemType) -> Self {
        Self {
            value: u128::from_be_bytes(bytes),
            item_type,
        }
    }

    /// 22-character base62 encoding using the alphabet `0-9a-zA-Z`.
    pub fn to_base62(&self) -> String {
        let mut digits = [0u8; BASE62_LEN];
        let mut value = self.value;
        for slot in digits.iter_mut().rev() {
            *slot = BASE62_ALPHABET[(value % 62) as usize];
            value /= 62;
        }
        // SAFETY: every byte comes from BASE62_ALPHABET, which is ASCII.
        String::from_utf8(digits.to_vec()).expect("base62 alphabet is ascii")
    }

    /// Parses a 22-character base62 string produced by [`Self::to_base62`].
    pub fn from_base62(s: &str, item_type: SpotifyItemType) -> Result<Self, SpotifyIdError> {
        if s.len() != BASE62_LEN {
            return Err(SpotifyIdError::InvalidBase62(s.to_string()));
        }
        let mut value: u128 = 0;
        for c in s.bytes() {
            let digit = BASE62_ALPHABET
                .iter()
                .position(|&b| b == c)
                .ok_or_else(|| SpotifyIdError::InvalidBase62(s.to_string()))?;
            value = value
                .checked_mul(62)
                .and_then(|v| v.checked_add(digit as u128))
                .ok_or_else(|| SpotifyIdError::InvalidBase62(s.to_string()))?;
        }
        Ok(Self { value, item_type })
    }

    /// 32-character lowercase hex encoding.
    pub fn to_base16(&self) -> String {
        hex_encode(&self.to_raw())
    }

    /// Parses a 32-character lowercase hex string.
    pub fn from_base16(s: &str, item_type: SpotifyItemType) -> Result<Self, SpotifyIdError> {
        if s.len() != BASE16_LEN {
            return Err(SpotifyIdError::InvalidHex(s.to_string()));
        }
        let bytes = hex_decode(s).ok_or_else(|| SpotifyIdError::InvalidHex(s.to_string()))?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&bytes);
        Ok(Self::from_raw(raw, item_type))
    }

    /// `spotify:<type>:<base62>` URI form.
    pub fn to_uri(&self) -> String {
        format!("spotify:{}:{}", self.item_type.as_str(), self.to_base62())
    }

    /// Parses a `spotify:<type>:<base62>` URI.
    pub fn from_uri(uri: &str) -> Result<Self, SpotifyIdError> {
        let mut parts = uri.splitn(3, ':');
        let scheme = parts.next().unwrap_or_default();
        let type_str = parts.next().unwrap_or_default();
        let id_str = parts.next().unwrap_or_default();
        if scheme != "spotify" || id_str.is_empty() {
            return Err(SpotifyIdError::InvalidUri(uri.to_string()));
        }
        Self::from_base62(id_str, SpotifyItemType::from_str(type_str))
    }

    /// Parses an `https://open.spotify.com/<type>/<base62>` URL, equivalent
    /// to the corresponding `spotify:<type>:<base62>` URI.
    pub fn from_url(url: &str) -> Result<Self, SpotifyIdError> {
        let path = url
            .split("open.spotify.com/")
            .nth(1)
            .ok_or_else(|| SpotifyIdError::InvalidUrl(url.to_string()))?;
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let mut segments = path.trim_matches('/').split('/');
        let type_str = segments
            .next()
            .ok_or_else(|| SpotifyIdError::InvalidUrl(url.to_string()))?;
        let id_str = segments
            .next()
            .ok_or_else(|| SpotifyIdError::InvalidUrl(url.to_string()))?;
        Self::from_base62(id_str, SpotifyItemType::from_str(type_str))
    }
}

impl fmt::Display for SpotifyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

/// 20-byte content hash identifying a specific encoding of an audio file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileId([u8; 20]);

impl FileId {
    pub fn from_raw(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 40 {
            return None;
        }
        let bytes = hex_decode(s)?;
        let mut raw = [0u8; 20];
        raw.copy_from_slice(&bytes);
        Some(Self(raw))
    }

    /// A zero-valued FileId is distinguishable from any file actually
    /// returned by Spotify's metadata (a real content hash never hashes to
    /// all-zero in practice), and is used as an explicit "no file" marker.
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A 16-byte AES key obtained per (track, file) pair. Never cached across
/// sessions; see `crate::session::audio_key::AudioKeyManager`.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioKey([u8; 16]);

impl AudioKey {
    pub fn from_raw(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AudioKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AudioKey(..)")
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").expect("writing to a String never fails");
    }
    s
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base62_round_trips() {
        let id = SpotifyId::new(0x1234_5678_9abc_def0_1122_3344_5566_7788, SpotifyItemType::Track);
        let encoded = id.to_base62();
        assert_eq!(encoded.len(), 22);
        let decoded = SpotifyId::from_base62(&encoded, SpotifyItemType::Track).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn base16_round_trips() {
        let id = SpotifyId::new(u128::MAX, SpotifyItemType::Album);
        let hex = id.to_base16();
        assert_eq!(hex.len(), 32);
        let decoded = SpotifyId::from_base16(&hex, SpotifyItemType::Album).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn uri_round_trips() {
        let id = SpotifyId::new(42, SpotifyItemType::Playlist);
        let uri = id.to_uri();
        let decoded = SpotifyId::from_uri(&uri).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn base62_alphabet_order() {
        let zero = SpotifyId::new(0, SpotifyItemType::Track);
        assert_eq!(zero.to_base62(), "0".repeat(22));

        let one = SpotifyId::new(1, SpotifyItemType::Track);
        assert_eq!(one.to_base62(), format!("{}1", "0".repeat(21)));
    }

    #[test]
    fn url_matches_equivalent_uri() {
        let from_url =
            SpotifyId::from_url("https://open.spotify.com/track/4iV5W9uYEdYUVa79Axb7Rh").unwrap();
        let from_uri = SpotifyId::from_uri("spotify:track:4iV5W9uYEdYUVa79Axb7Rh").unwrap();
        assert_eq!(from_url, from_uri);
    }

    #[test]
    fn file_id_hex_round_trips() {
        let raw = [7u8; 20];
        let id = FileId::from_raw(raw);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(FileId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn empty_file_id_is_distinguishable() {
        assert!(FileId::default().is_empty());
        assert!(!FileId::from_raw([1u8; 20]).is_empty());
    }
}
