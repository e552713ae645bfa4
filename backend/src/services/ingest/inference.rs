use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};
use encoding_rs::Encoding;

use super::{delimiter, encoding, headers, ValidationError};
use crate::models::{ColumnSchema, ColumnType, TableSchema};

/// Limits and probes used while inferring a schema
#[derive(Debug, Clone)]
pub struct InferenceOptions {
    pub max_upload_bytes: usize,
    pub inference_sample_size: usize,
    pub delimiter_sample_rows: usize,
    pub sample_values: usize,
    pub encodings: Vec<&'static Encoding>,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            max_upload_bytes: 50 * 1024 * 1024,
            inference_sample_size: 1000,
            delimiter_sample_rows: 50,
            sample_values: 5,
            encodings: vec![encoding_rs::UTF_8, encoding_rs::WINDOWS_1252],
        }
    }
}

/// Decoded upload plus the layout needed to re-read its records
#[derive(Debug)]
pub struct RecordSource {
    text: String,
    delimiter: u8,
}

impl RecordSource {
    fn reader(&self) -> csv::Reader<&[u8]> {
        ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_reader(self.text.as_bytes())
    }

    /// Stream the data records (header excluded) without collecting them
    pub fn records(&self) -> StringRecordsIntoIter<&[u8]> {
        self.reader().into_records()
    }
}

#[derive(Debug)]
pub struct InferredTable {
    /// Schema with `row_count` still unset; conversion finalizes it
    pub schema: TableSchema,
    pub encoding: &'static Encoding,
    pub delimiter: u8,
    pub source: RecordSource,
}

impl InferredTable {
    pub fn column_types(&self) -> Vec<ColumnType> {
        self.schema.columns.iter().map(|c| c.data_type).collect()
    }
}

/// Running facts about one column over the inference sample
#[derive(Debug, Clone)]
struct ColumnProfile {
    non_empty: usize,
    all_integer: bool,
    all_real: bool,
    saw_null: bool,
    samples: Vec<String>,
}

impl ColumnProfile {
    fn new() -> Self {
        Self {
            non_empty: 0,
            all_integer: true,
            all_real: true,
            saw_null: false,
            samples: Vec::new(),
        }
    }

    fn observe(&mut self, raw: Option<&str>, sample_limit: usize, max_samples: usize) {
        let value = raw.map(str::trim).unwrap_or("");
        if value.is_empty() {
            self.saw_null = true;
            return;
        }
        if self.non_empty >= sample_limit {
            return;
        }
        self.non_empty += 1;
        if self.all_integer && parse_integer(value).is_none() {
            self.all_integer = false;
        }
        if self.all_real && parse_real(value).is_none() {
            self.all_real = false;
        }
        if self.samples.len() < max_samples && !self.samples.iter().any(|s| s == value) {
            self.samples.push(value.to_string());
        }
    }

    fn column_type(&self) -> ColumnType {
        if self.non_empty == 0 {
            ColumnType::Text
        } else if self.all_integer {
            ColumnType::Integer
        } else if self.all_real {
            ColumnType::Real
        } else {
            ColumnType::Text
        }
    }
}

/// Reject uploads that fail the size and file type gates
pub fn check_upload(bytes: &[u8], filename: Option<&str>, max_upload_bytes: usize) -> Result<(), ValidationError> {
    if let Some(extension) = filename.and_then(|f| f.rsplit_once('.')).map(|(_, ext)| ext.to_ascii_lowercase()) {
        if !matches!(extension.as_str(), "csv" | "tsv" | "txt" | "tab") {
            return Err(ValidationError::UnsupportedFileType(extension));
        }
    }
    if bytes.is_empty() {
        return Err(ValidationError::EmptyFile);
    }
    if bytes.len() > max_upload_bytes {
        return Err(ValidationError::FileTooLarge {
            size: bytes.len(),
            max: max_upload_bytes,
        });
    }
    Ok(())
}

/// Decode the upload, detect its delimiter, sanitize the header and infer
/// column types from a bounded sample.
pub fn infer_schema(
    bytes: &[u8],
    filename: Option<&str>,
    table_name: &str,
    options: &InferenceOptions,
) -> Result<InferredTable, ValidationError> {
    check_upload(bytes, filename, options.max_upload_bytes)?;

    let decoded = encoding::decode(bytes, &options.encodings)?;
    let hint = delimiter::hint_from_filename(filename);
    let delimiter = delimiter::detect(&decoded.text, options.delimiter_sample_rows, hint)?;
    let source = RecordSource {
        text: decoded.text,
        delimiter,
    };

    let mut reader = source.reader();
    let header: StringRecord = reader
        .headers()
        .map_err(|e| ValidationError::Format(format!("Could not read header row: {}", e)))?
        .clone();
    if header.iter().all(|cell| cell.trim().is_empty()) {
        return Err(ValidationError::EmptyHeader);
    }

    let names = headers::sanitize_all(header.iter());
    let mut profiles = vec![ColumnProfile::new(); names.len()];
    let sample_limit = options.inference_sample_size;

    let mut data_rows = 0usize;
    for record in reader.records() {
        let record = record.map_err(|e| ValidationError::Format(format!("Malformed record: {}", e)))?;
        data_rows += 1;
        for (idx, profile) in profiles.iter_mut().enumerate() {
            profile.observe(record.get(idx), sample_limit, options.sample_values);
        }
        if profiles.iter().all(|p| p.non_empty >= sample_limit) {
            break;
        }
    }

    if data_rows == 0 {
        return Err(ValidationError::NoDataRows);
    }

    let columns: Vec<ColumnSchema> = names
        .into_iter()
        .zip(header.iter())
        .zip(profiles)
        .map(|((name, original), profile)| ColumnSchema {
            name,
            original_name: original.trim().to_string(),
            data_type: profile.column_type(),
            nullable: profile.saw_null,
            sample_values: profile.samples,
        })
        .collect();

    tracing::debug!(
        encoding = decoded.encoding.name(),
        delimiter = %(delimiter as char).escape_default(),
        columns = columns.len(),
        sampled_rows = data_rows,
        "Inferred schema"
    );

    Ok(InferredTable {
        schema: TableSchema {
            table_name: table_name.to_string(),
            columns,
            row_count: 0,
        },
        encoding: decoded.encoding,
        delimiter,
        source,
    })
}

/// Integer literal: optional sign and digits, without redundant leading
/// zeros so values such as postal codes stay text
pub fn parse_integer(value: &str) -> Option<i64> {
    let digits = value.strip_prefix(['+', '-']).unwrap_or(value);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    value.parse::<i64>().ok()
}

/// Finite decimal literal: sign, digits, optional fraction and exponent.
/// `inf`, `nan` and thousands separators are not numbers here.
pub fn parse_real(value: &str) -> Option<f64> {
    let unsigned = value.strip_prefix(['+', '-']).unwrap_or(value);
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(pos) => (&unsigned[..pos], Some(&unsigned[pos + 1..])),
        None => (unsigned, None),
    };

    let (whole, fraction) = match mantissa.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (mantissa, None),
    };
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(whole) || !fraction.is_none_or(all_digits) {
        return None;
    }
    if whole.is_empty() && fraction.is_none_or(str::is_empty) {
        return None;
    }
    if whole.len() > 1 && whole.starts_with('0') {
        return None;
    }
    if let Some(exponent) = exponent {
        let exp_digits = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
        if exp_digits.is_empty() || !all_digits(exp_digits) {
            return None;
        }
    }

    value.parse::<f64>().ok().filter(|v| v.is_finite())
}
