use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// A public key lifted out of authorized-keys text form.
///
/// The `blob` is the key's binary wire encoding; it doubles as the key's
/// fingerprint throughout strand, since two distinct keys never share a blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub algorithm: String,
    pub blob: Vec<u8>,
}

impl PublicKey {
    #[must_use]
    pub fn fingerprint(&self) -> &[u8] {
        &self.blob
    }
}

/// Parse one line of authorized-keys text form: `<algorithm> <base64 blob>
/// [comment]`, optionally preceded by an options field.
///
/// Returns `None` for blank lines, comments, and anything that does not
/// decode to a blob whose embedded algorithm name matches the text field.
#[must_use]
pub fn parse_authorized_key(line: &str) -> Option<PublicKey> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let fields: Vec<&str> = line.split_whitespace().collect();

    for pair in fields.windows(2) {
        let (algorithm, encoded) = (pair[0], pair[1]);

        let Ok(blob) = BASE64.decode(encoded) else {
            continue;
        };

        if blob_algorithm(&blob).is_some_and(|name| name == algorithm.as_bytes()) {
            return Some(PublicKey {
                algorithm: algorithm.to_owned(),
                blob,
            });
        }
    }

    None
}

/// The algorithm name embedded at the head of a key blob:
/// `[len:4 big-endian][name:len]...`.
fn blob_algorithm(blob: &[u8]) -> Option<&[u8]> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    blob.get(4..4_usize.checked_add(len)?)
}

#[cfg(test)]
pub(crate) fn test_key(seed: u8) -> (String, PublicKey) {
    // A syntactically valid ed25519-shaped key: the blob embeds the
    // algorithm name followed by 32 bytes of key material.
    let algorithm = "ssh-ed25519";
    let mut blob = Vec::new();

    #[allow(clippy::cast_possible_truncation, reason = "algorithm name is short")]
    blob.extend_from_slice(&(algorithm.len() as u32).to_be_bytes());
    blob.extend_from_slice(algorithm.as_bytes());
    blob.extend_from_slice(&32_u32.to_be_bytes());
    blob.extend_from_slice(&[seed; 32]);

    let line = format!("{algorithm} {}", BASE64.encode(&blob));
    (
        line,
        PublicKey {
            algorithm: algorithm.to_owned(),
            blob,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_line_parses() {
        let (line, expected) = test_key(1);
        assert_eq!(parse_authorized_key(&line), Some(expected));
    }

    #[test]
    fn comment_after_blob_is_ignored() {
        let (line, expected) = test_key(2);
        let line = format!("{line} someone@somewhere");
        assert_eq!(parse_authorized_key(&line), Some(expected));
    }

    #[test]
    fn options_field_before_key_is_skipped() {
        let (line, expected) = test_key(3);
        let line = format!("no-agent-forwarding,no-pty {line}");
        assert_eq!(parse_authorized_key(&line), Some(expected));
    }

    #[test]
    fn garbage_lines_yield_none() {
        assert_eq!(parse_authorized_key(""), None);
        assert_eq!(parse_authorized_key("# a comment"), None);
        assert_eq!(parse_authorized_key("ssh-ed25519 not!base64"), None);
        // Valid base64 that decodes to a blob for a different algorithm.
        assert_eq!(parse_authorized_key("ssh-rsa AAAAC3NzaC1lZDI1NTE5"), None);
    }

    #[test]
    fn fingerprint_is_the_blob() {
        let (_, key) = test_key(4);
        assert_eq!(key.fingerprint(), key.blob.as_slice());
    }
}
