//! Common CLI utilities.

use clap::ValueEnum as _;
use serde::Serialize;
use std::fmt;

/// Possible output formats.
#[derive(Copy, Clone, Debug, PartialEq, clap::ValueEnum)]
#[value(rename_all = "lower")]
pub enum OutputFormat {
    Yaml,
    Json,
    PrettyJson,
    Toml,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Yaml
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.to_possible_value()
                .expect("no skipped values")
                .get_name()
        )
    }
}

/// Serialize an object in the specified format.
pub fn format_object<T: Serialize>(
    format: OutputFormat,
    value: &T,
) -> Result<String, Box<dyn std::error::Error>> {
    Ok(match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        OutputFormat::Json => serde_json::to_string(value)?,
        OutputFormat::PrettyJson => serde_json::to_string_pretty(value)?,
        OutputFormat::Toml => toml::to_string(value)?,
    })
}

/// Prints an object in the specified format.
pub fn print_object<T: Serialize>(
    format: OutputFormat,
    value: &T,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", format_object(format, value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{format_object, OutputFormat};

    #[test]
    fn test_format_object() {
        let value = serde_json::json!({ "success": true, "recordPath": "/cache/a.json" });
        assert_eq!(
            format_object(OutputFormat::Json, &value).unwrap(),
            r#"{"recordPath":"/cache/a.json","success":true}"#
        );
        assert!(format_object(OutputFormat::Yaml, &value)
            .unwrap()
            .contains("success: true"));
        assert!(format_object(OutputFormat::Toml, &value)
            .unwrap()
            .contains("success = true"));
    }

    #[test]
    fn test_output_format_display() {
        assert_eq!(OutputFormat::PrettyJson.to_string(), "prettyjson");
        assert_eq!(OutputFormat::default(), OutputFormat::Yaml);
    }
}
