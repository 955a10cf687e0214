//! BigQuery identifier normalization.
//!
//! Source database, table, and column names may contain characters that
//! BigQuery rejects. Invalid characters are replaced with underscores and
//! over-long names are truncated, matching what the assessment surface
//! reports to operators.

/// Maximum length of dataset and table names.
const MAX_DATASET_NAME_LENGTH: usize = 1024;
const MAX_TABLE_NAME_LENGTH: usize = 1024;
/// Maximum length of column names.
const MAX_FIELD_NAME_LENGTH: usize = 300;

fn replace_invalid_chars(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn truncate(mut name: String, max_len: usize) -> String {
    if name.len() > max_len {
        name.truncate(max_len);
    }
    name
}

/// Normalize a dataset name derived from a source database name.
///
/// When an explicit dataset name is configured it takes precedence over
/// the source database name; both go through the same normalization.
pub fn normalize_dataset_name(configured: Option<&str>, database: &str) -> String {
    let raw = match configured {
        Some(name) if !name.trim().is_empty() => name,
        _ => database,
    };
    truncate(replace_invalid_chars(raw), MAX_DATASET_NAME_LENGTH)
}

/// Normalize a table name.
pub fn normalize_table_name(table: &str) -> String {
    truncate(replace_invalid_chars(table), MAX_TABLE_NAME_LENGTH)
}

/// Normalize a column name. Column names must not start with a digit.
pub fn normalize_field_name(field: &str) -> String {
    let mut normalized = replace_invalid_chars(field);
    if normalized.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        normalized.insert(0, '_');
    }
    truncate(normalized, MAX_FIELD_NAME_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names_unchanged() {
        assert_eq!(normalize_dataset_name(None, "inventory_db"), "inventory_db");
        assert_eq!(normalize_table_name("users_2024"), "users_2024");
        assert_eq!(normalize_field_name("first_name"), "first_name");
    }

    #[test]
    fn test_invalid_chars_replaced() {
        assert_eq!(normalize_dataset_name(None, "app-db"), "app_db");
        assert_eq!(normalize_table_name("user.events"), "user_events");
        assert_eq!(normalize_field_name("total$amount"), "total_amount");
    }

    #[test]
    fn test_configured_dataset_wins() {
        assert_eq!(
            normalize_dataset_name(Some("warehouse"), "sourcedb"),
            "warehouse"
        );
        // blank override falls back to the source database name
        assert_eq!(normalize_dataset_name(Some("  "), "sourcedb"), "sourcedb");
    }

    #[test]
    fn test_field_starting_with_digit_prefixed() {
        assert_eq!(normalize_field_name("1st_place"), "_1st_place");
    }

    #[test]
    fn test_long_names_truncated() {
        let long = "x".repeat(2000);
        assert_eq!(normalize_dataset_name(None, &long).len(), 1024);
        assert_eq!(normalize_field_name(&long).len(), 300);
    }
}
