// Text encoding detection for uploaded files
//
// A byte-order mark wins outright. Otherwise each configured candidate is
// tried in order with strict decoding and the first clean decode is used.

use encoding_rs::Encoding;

use super::ValidationError;

/// Share of control characters above which decoded text is treated as binary
const MAX_CONTROL_CHAR_RATIO: f64 = 0.01;

#[derive(Debug)]
pub struct DecodedText {
    pub text: String,
    pub encoding: &'static Encoding,
}

/// Resolve configured labels into encodings, skipping unknown labels
pub fn resolve_labels(labels: &[String]) -> Vec<&'static Encoding> {
    labels
        .iter()
        .filter_map(|label| {
            let encoding = Encoding::for_label(label.as_bytes());
            if encoding.is_none() {
                tracing::warn!("Ignoring unknown encoding label: {}", label);
            }
            encoding
        })
        .collect()
}

pub fn decode(bytes: &[u8], candidates: &[&'static Encoding]) -> Result<DecodedText, ValidationError> {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, had_errors) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        if had_errors {
            return Err(ValidationError::Encoding(format!(
                "File starts with a {} byte-order mark but is not valid {}",
                encoding.name(),
                encoding.name()
            )));
        }
        let text = text.into_owned();
        ensure_textual(&text)?;
        return Ok(DecodedText { text, encoding });
    }

    for encoding in candidates {
        let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
        if had_errors {
            tracing::debug!("Upload is not valid {}", encoding.name());
            continue;
        }
        let text = text.into_owned();
        ensure_textual(&text)?;
        return Ok(DecodedText {
            text,
            encoding,
        });
    }

    let tried: Vec<&str> = candidates.iter().map(|e| e.name()).collect();
    Err(ValidationError::Encoding(format!(
        "File could not be decoded as any of: {}",
        tried.join(", ")
    )))
}

/// Reject decoded content that looks like binary data rather than text
fn ensure_textual(text: &str) -> Result<(), ValidationError> {
    let mut total = 0usize;
    let mut control = 0usize;
    for ch in text.chars() {
        if ch == '\0' {
            return Err(ValidationError::Encoding(
                "File contains NUL bytes and does not look like text".to_string(),
            ));
        }
        total += 1;
        if ch.is_control() && !matches!(ch, '\t' | '\n' | '\r') {
            control += 1;
        }
    }
    if total > 0 && control as f64 / total as f64 > MAX_CONTROL_CHAR_RATIO {
        return Err(ValidationError::Encoding(
            "File contains too many control characters to be text".to_string(),
        ));
    }
    Ok(())
}
