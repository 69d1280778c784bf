//! Opaque pagination cursors.
//!
//! Token layout: `c1.<body>.<check>` where `body` is base64url JSON
//! `{"s": <rfc3339 sort value>, "i": <tiebreak id>}` and `check` is the
//! base64url of the first 8 bytes of SHA-256 over the JSON. Tokens are capped
//! at [`CURSOR_MAX_LEN`] characters in both directions.

use crate::CursorError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Longest token accepted or produced.
pub const CURSOR_MAX_LEN: usize = 512;

const CURSOR_VERSION: &str = "c1";
const CHECKSUM_BYTES: usize = 8;
const MAX_TIEBREAK_LEN: usize = 128;

/// Position of the last row of a page, sorted by `(sort_value, tiebreak_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationCursor {
    pub sort_value: DateTime<Utc>,
    pub tiebreak_id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CursorBody {
    s: String,
    i: String,
}

/// Encode a cursor into an opaque token.
pub fn encode_cursor(cursor: &PaginationCursor) -> Result<String, CursorError> {
    validate_tiebreak_id(&cursor.tiebreak_id)?;

    let body = CursorBody {
        s: cursor.sort_value.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        i: cursor.tiebreak_id.clone(),
    };
    let json = serde_json::to_vec(&body).map_err(|e| CursorError::Malformed(e.to_string()))?;
    let token = format!(
        "{CURSOR_VERSION}.{}.{}",
        URL_SAFE_NO_PAD.encode(&json),
        URL_SAFE_NO_PAD.encode(checksum(&json)),
    );

    if token.len() > CURSOR_MAX_LEN {
        return Err(CursorError::TooLong {
            len: token.len(),
            max: CURSOR_MAX_LEN,
        });
    }
    Ok(token)
}

/// Decode a token produced by [`encode_cursor`].
///
/// Never fails: anything unusable yields `None` and a warning, and the caller
/// starts from the first page.
pub fn decode_cursor(token: &str) -> Option<PaginationCursor> {
    match try_decode_cursor(token) {
        Ok(cursor) => Some(cursor),
        Err(error) => {
            warn!(%error, token_len = token.len(), "Ignoring invalid pagination cursor");
            None
        }
    }
}

/// Decode a token, reporting why it was rejected.
pub fn try_decode_cursor(token: &str) -> Result<PaginationCursor, CursorError> {
    if token.len() > CURSOR_MAX_LEN {
        return Err(CursorError::TooLong {
            len: token.len(),
            max: CURSOR_MAX_LEN,
        });
    }

    let mut parts = token.split('.');
    let (Some(version), Some(body), Some(check), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CursorError::Malformed("expected three segments".to_string()));
    };
    if version != CURSOR_VERSION {
        return Err(CursorError::UnsupportedVersion(version.to_string()));
    }

    let json = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|e| CursorError::Malformed(format!("body: {e}")))?;
    let check = URL_SAFE_NO_PAD
        .decode(check)
        .map_err(|e| CursorError::Malformed(format!("checksum: {e}")))?;
    if check != checksum(&json) {
        return Err(CursorError::ChecksumMismatch);
    }

    let body: CursorBody =
        serde_json::from_slice(&json).map_err(|e| CursorError::Malformed(e.to_string()))?;
    let sort_value = DateTime::parse_from_rfc3339(&body.s)
        .map_err(|e| CursorError::InvalidSortValue(format!("{:?}: {e}", body.s)))?
        .with_timezone(&Utc);
    validate_tiebreak_id(&body.i)?;

    Ok(PaginationCursor {
        sort_value,
        tiebreak_id: body.i,
    })
}

fn checksum(json: &[u8]) -> [u8; CHECKSUM_BYTES] {
    let digest = Sha256::digest(json);
    let mut out = [0u8; CHECKSUM_BYTES];
    out.copy_from_slice(&digest[..CHECKSUM_BYTES]);
    out
}

/// UUID-shaped ids must parse as UUIDs; anything else must be a short
/// `[A-Za-z0-9_-]` token. Enqueue applies the same rule to caller-chosen ids.
pub(crate) fn validate_tiebreak_id(id: &str) -> Result<(), CursorError> {
    let looks_like_uuid = id.len() == 36 && id.matches('-').count() == 4;
    if looks_like_uuid {
        return uuid::Uuid::parse_str(id)
            .map(|_| ())
            .map_err(|e| CursorError::InvalidTiebreakId(format!("{id:?}: {e}")));
    }

    let well_formed = !id.is_empty()
        && id.len() <= MAX_TIEBREAK_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if well_formed {
        Ok(())
    } else {
        Err(CursorError::InvalidTiebreakId(format!("{id:?}")))
    }
}
