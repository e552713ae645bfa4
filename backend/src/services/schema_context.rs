use crate::config::ContextConfig;
use crate::models::{ColumnSchema, ColumnType, TableSchema};

/// Renders a table schema as the text handed to the language model
#[derive(Debug, Clone)]
pub struct SchemaContextBuilder {
    max_chars: usize,
    sample_values: usize,
}

impl SchemaContextBuilder {
    pub fn new(max_chars: usize, sample_values: usize) -> Self {
        Self {
            max_chars,
            sample_values,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.max_chars, config.sample_values)
    }

    /// Build the context for `schema`, fitting it into the character budget.
    ///
    /// Samples go first, least relevant column first; then whole columns,
    /// replaced by a count of what was left out. The table line always stays.
    pub fn build(&self, schema: &TableSchema, prompt: Option<&str>) -> String {
        let order = relevance_order(&schema.columns, prompt);
        let mut with_samples = vec![self.sample_values > 0; schema.columns.len()];
        let mut included = vec![true; schema.columns.len()];

        let mut text = self.render(schema, &with_samples, &included);
        if text.chars().count() <= self.max_chars {
            return text;
        }

        for &idx in order.iter().rev() {
            if !with_samples[idx] {
                continue;
            }
            with_samples[idx] = false;
            text = self.render(schema, &with_samples, &included);
            if text.chars().count() <= self.max_chars {
                tracing::debug!("Schema context trimmed to fit {} chars by dropping samples", self.max_chars);
                return text;
            }
        }

        for &idx in order.iter().rev() {
            included[idx] = false;
            text = self.render(schema, &with_samples, &included);
            if text.chars().count() <= self.max_chars {
                break;
            }
        }

        let omitted = included.iter().filter(|keep| !**keep).count();
        tracing::debug!(
            "Schema context trimmed to fit {} chars, {} columns omitted",
            self.max_chars,
            omitted
        );
        text
    }

    fn render(&self, schema: &TableSchema, with_samples: &[bool], included: &[bool]) -> String {
        let mut out = format!("Table: {} ({} rows)\nColumns:\n", schema.table_name, schema.row_count);
        for (idx, column) in schema.columns.iter().enumerate() {
            if included[idx] {
                out.push_str(&self.column_line(column, with_samples[idx]));
                out.push('\n');
            }
        }
        let omitted = included.iter().filter(|keep| !**keep).count();
        if omitted > 0 {
            out.push_str(&format!("… {} more columns omitted\n", omitted));
        }
        out
    }

    fn column_line(&self, column: &ColumnSchema, with_samples: bool) -> String {
        let nullability = if column.nullable { "NULL" } else { "NOT NULL" };
        let mut line = format!("- {} {} {}", column.name, column.data_type, nullability);

        if with_samples && !column.sample_values.is_empty() {
            let samples: Vec<String> = column
                .sample_values
                .iter()
                .take(self.sample_values)
                .map(|value| format_sample(value, column.data_type))
                .collect();
            line.push_str("  -- e.g. ");
            line.push_str(&samples.join(", "));
        }
        line
    }
}

fn format_sample(value: &str, data_type: ColumnType) -> String {
    const MAX_SAMPLE_CHARS: usize = 40;

    match data_type {
        ColumnType::Integer | ColumnType::Real => value.to_string(),
        ColumnType::Text => {
            let mut shown: String = value.chars().take(MAX_SAMPLE_CHARS).collect();
            if shown.len() < value.len() {
                shown.push('…');
            }
            format!("'{}'", shown.replace('\'', "''"))
        }
    }
}

/// Column indices, most relevant first: columns mentioned in the prompt,
/// then the rest in schema order
fn relevance_order(columns: &[ColumnSchema], prompt: Option<&str>) -> Vec<usize> {
    let words: Vec<String> = prompt
        .map(|p| {
            p.split(|c: char| !c.is_alphanumeric() && c != '_')
                .filter(|w| !w.is_empty())
                .map(str::to_lowercase)
                .collect()
        })
        .unwrap_or_default();
    let prompt_lower = prompt.map(str::to_lowercase).unwrap_or_default();

    let mentioned = |column: &ColumnSchema| {
        if words.is_empty() {
            return false;
        }
        let original = column.original_name.trim().to_lowercase();
        words.iter().any(|w| *w == column.name)
            || (!original.is_empty() && prompt_lower.contains(&original))
    };

    let (mut first, rest): (Vec<usize>, Vec<usize>) =
        (0..columns.len()).partition(|&idx| mentioned(&columns[idx]));
    first.extend(rest);
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: ColumnType, nullable: bool, samples: &[&str]) -> ColumnSchema {
        ColumnSchema {
            name: name.to_string(),
            original_name: name.to_string(),
            data_type,
            nullable,
            sample_values: samples.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn people() -> TableSchema {
        TableSchema {
            table_name: "ds_abc".to_string(),
            columns: vec![
                column("id", ColumnType::Integer, false, &["1", "2", "3"]),
                column("name", ColumnType::Text, true, &["Alice", "Bob", "Carol"]),
            ],
            row_count: 3,
        }
    }

    #[test]
    fn test_full_context_format() {
        let text = SchemaContextBuilder::new(6000, 3).build(&people(), None);
        assert_eq!(
            text,
            "Table: ds_abc (3 rows)\nColumns:\n\
             - id INTEGER NOT NULL  -- e.g. 1, 2, 3\n\
             - name TEXT NULL  -- e.g. 'Alice', 'Bob', 'Carol'\n"
        );
    }

    #[test]
    fn test_sample_count_is_limited() {
        let text = SchemaContextBuilder::new(6000, 1).build(&people(), None);
        assert!(text.contains("-- e.g. 'Alice'\n"));
        assert!(!text.contains("Bob"));
    }

    #[test]
    fn test_text_samples_are_quoted() {
        let mut schema = people();
        schema.columns[1].sample_values = vec!["O'Brien".to_string()];
        let text = SchemaContextBuilder::new(6000, 3).build(&schema, None);
        assert!(text.contains("'O''Brien'"));
    }

    #[test]
    fn test_samples_dropped_before_columns() {
        let full = SchemaContextBuilder::new(6000, 3).build(&people(), None);
        let budget = full.chars().count() - 5;
        let text = SchemaContextBuilder::new(budget, 3).build(&people(), None);

        assert!(text.chars().count() <= budget);
        // The less relevant (later) column loses its samples first
        assert!(text.contains("- id INTEGER NOT NULL  -- e.g. 1, 2, 3"));
        assert!(text.contains("- name TEXT NULL\n"));
    }

    #[test]
    fn test_prompt_mentions_raise_relevance() {
        let full = SchemaContextBuilder::new(6000, 3).build(&people(), None);
        let budget = full.chars().count() - 5;
        let text = SchemaContextBuilder::new(budget, 3).build(&people(), Some("How many rows are there?"));
        assert!(text.contains("- name TEXT NULL\n"));

        let text = SchemaContextBuilder::new(budget, 3).build(&people(), Some("list every name"));
        assert!(text.contains("- id INTEGER NOT NULL\n"));
        assert!(text.contains("'Alice'"));
    }

    #[test]
    fn test_columns_dropped_with_omission_note() {
        let columns = (0..200)
            .map(|i| column(&format!("column_number_{}", i), ColumnType::Real, true, &["1.5"]))
            .collect();
        let schema = TableSchema {
            table_name: "ds_wide".to_string(),
            columns,
            row_count: 10,
        };

        let text = SchemaContextBuilder::new(1000, 3).build(&schema, None);
        assert!(text.chars().count() <= 1000);
        assert!(text.starts_with("Table: ds_wide (10 rows)\n"));
        assert!(text.contains("- column_number_0 REAL NULL\n"));
        assert!(text.contains("more columns omitted"));
        assert!(!text.contains("e.g."));
        // Every remaining column line is whole
        for line in text.lines().skip(2) {
            assert!(line.starts_with("- ") || line.starts_with('…'));
        }
    }

    #[test]
    fn test_table_line_survives_tiny_budget() {
        let text = SchemaContextBuilder::new(10, 3).build(&people(), None);
        assert!(text.starts_with("Table: ds_abc (3 rows)"));
        assert!(text.contains("… 2 more columns omitted"));
    }
}
