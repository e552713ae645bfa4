use csv::ReaderBuilder;

use super::ValidationError;

/// Delimiters tried, in tie-break order
pub const CANDIDATES: [u8; 4] = [b',', b'\t', b';', b'|'];

/// Minimum share of sampled rows (per mille) that must agree on the field count
const MIN_CONSISTENCY_PERMILLE: usize = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CandidateScore {
    delimiter: u8,
    modal_fields: usize,
    consistency_permille: usize,
}

/// Delimiter suggested by a declared filename
pub fn hint_from_filename(filename: Option<&str>) -> Option<u8> {
    let extension = filename?.rsplit_once('.')?.1.to_ascii_lowercase();
    match extension.as_str() {
        "tsv" | "tab" => Some(b'\t'),
        "csv" => Some(b','),
        _ => None,
    }
}

/// Pick the candidate delimiter giving the most consistent field count over
/// the first `sample_rows` records.
pub fn detect(text: &str, sample_rows: usize, hint: Option<u8>) -> Result<u8, ValidationError> {
    let scores: Vec<CandidateScore> = CANDIDATES
        .iter()
        .filter_map(|&delimiter| score(text, delimiter, sample_rows))
        .collect();

    if scores.is_empty() {
        return Err(ValidationError::EmptyFile);
    }

    let best = scores
        .iter()
        .filter(|s| s.modal_fields > 1)
        .max_by_key(|s| {
            let hinted = hint == Some(s.delimiter);
            let order = CANDIDATES.len() - candidate_index(s.delimiter);
            (s.consistency_permille, s.modal_fields, hinted, order)
        });

    match best {
        Some(best) if best.consistency_permille >= MIN_CONSISTENCY_PERMILLE => {
            tracing::debug!(
                delimiter = %(best.delimiter as char).escape_default(),
                fields = best.modal_fields,
                consistency = best.consistency_permille,
                "Detected delimiter"
            );
            Ok(best.delimiter)
        }
        Some(_) => Err(ValidationError::Format(
            "Could not detect a consistent delimiter (tried comma, tab, semicolon, pipe)".to_string(),
        )),
        None => {
            // No candidate splits rows into several fields: a one-column file.
            // Use the delimiter that splits the fewest rows.
            let single = scores
                .iter()
                .max_by_key(|s| (s.consistency_permille, CANDIDATES.len() - candidate_index(s.delimiter)))
                .map(|s| s.delimiter)
                .unwrap_or(b',');
            tracing::debug!("No delimiter found; treating upload as a single column");
            Ok(single)
        }
    }
}

fn candidate_index(delimiter: u8) -> usize {
    CANDIDATES
        .iter()
        .position(|&c| c == delimiter)
        .unwrap_or(CANDIDATES.len())
}

fn score(text: &str, delimiter: u8, sample_rows: usize) -> Option<CandidateScore> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let counts: Vec<usize> = reader
        .records()
        .take(sample_rows)
        .map_while(Result::ok)
        .map(|record| record.len())
        .collect();

    if counts.is_empty() {
        return None;
    }

    let mut tally: Vec<(usize, usize)> = Vec::new();
    for &count in &counts {
        match tally.iter_mut().find(|(fields, _)| *fields == count) {
            Some((_, seen)) => *seen += 1,
            None => tally.push((count, 1)),
        }
    }
    // Most frequent count; ties go to the wider layout
    let (modal_fields, modal_rows) = tally
        .into_iter()
        .max_by_key(|&(fields, seen)| (seen, fields))?;

    Some(CandidateScore {
        delimiter,
        modal_fields,
        consistency_permille: modal_rows * 1000 / counts.len(),
    })
}
