//! Typed Data Values
//!
//! The scalar values that live in the leaves of a channel's data tree, and
//! the contents an input item hands to a task: a single scalar, or a flat
//! array for gathered inputs.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use thiserror::Error;

/// The type carried by a channel.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    File,
    String,
    Integer,
    Float,
    Boolean,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::File => "file",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueError {
    #[error("cannot interpret '{value}' as {data_type}")]
    InvalidValue { data_type: DataType, value: String },

    #[error("expected a scalar {data_type} value but found a mapping")]
    UnexpectedMapping { data_type: DataType },
}

/// One typed value stored in a leaf.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum DataValue {
    File(String),
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl DataValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::File(_) => DataType::File,
            Self::String(_) => DataType::String,
            Self::Integer(_) => DataType::Integer,
            Self::Float(_) => DataType::Float,
            Self::Boolean(_) => DataType::Boolean,
        }
    }

    /// Text used when the value is substituted into a command.
    pub fn substitution_value(&self) -> String {
        match self {
            Self::File(path) => path.clone(),
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Float(x) => x.to_string(),
            Self::Boolean(b) => b.to_string(),
        }
    }

    /// Parses text (a task output stream, a filename) as a value of `data_type`.
    pub fn parse(data_type: DataType, text: &str) -> Result<Self, ValueError> {
        let invalid = || ValueError::InvalidValue {
            data_type,
            value: text.to_string(),
        };

        match data_type {
            DataType::File => Ok(Self::File(text.to_string())),
            DataType::String => Ok(Self::String(text.to_string())),
            DataType::Integer => text.trim().parse().map(Self::Integer).map_err(|_| invalid()),
            DataType::Float => text.trim().parse().map(Self::Float).map_err(|_| invalid()),
            DataType::Boolean => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Self::Boolean(true)),
                "false" | "no" | "0" => Ok(Self::Boolean(false)),
                _ => Err(invalid()),
            },
        }
    }

    /// Converts a YAML scalar into a value of `data_type`.
    pub fn from_yaml(data_type: DataType, value: &YamlValue) -> Result<Self, ValueError> {
        match value {
            YamlValue::String(s) => Self::parse(data_type, s),
            YamlValue::Bool(b) => match data_type {
                DataType::Boolean => Ok(Self::Boolean(*b)),
                _ => Self::parse(data_type, &b.to_string()),
            },
            YamlValue::Number(n) => match data_type {
                DataType::Integer => n.as_i64().map(Self::Integer).ok_or(ValueError::InvalidValue {
                    data_type,
                    value: n.to_string(),
                }),
                DataType::Float => n.as_f64().map(Self::Float).ok_or(ValueError::InvalidValue {
                    data_type,
                    value: n.to_string(),
                }),
                _ => Self::parse(data_type, &n.to_string()),
            },
            YamlValue::Tagged(tagged) => Self::from_yaml(data_type, &tagged.value),
            YamlValue::Mapping(_) => Err(ValueError::UnexpectedMapping { data_type }),
            YamlValue::Null | YamlValue::Sequence(_) => Err(ValueError::InvalidValue {
                data_type,
                value: format!("{:?}", value),
            }),
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.substitution_value())
    }
}

/// What one input item (or one task output) carries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum DataContents {
    Scalar(DataValue),
    Array(Vec<DataValue>),
}

impl DataContents {
    /// All values in order; a scalar yields itself.
    pub fn values(&self) -> Vec<&DataValue> {
        match self {
            Self::Scalar(value) => vec![value],
            Self::Array(values) => values.iter().collect(),
        }
    }

    /// Space-separated substitution text.
    pub fn substitution_value(&self) -> String {
        self.values()
            .iter()
            .map(|v| v.substitution_value())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer() {
        assert_eq!(
            DataValue::parse(DataType::Integer, " 42\n").unwrap(),
            DataValue::Integer(42)
        );
        assert!(DataValue::parse(DataType::Integer, "forty-two").is_err());
    }

    #[test]
    fn test_parse_boolean_variants() {
        assert_eq!(DataValue::parse(DataType::Boolean, "yes").unwrap(), DataValue::Boolean(true));
        assert_eq!(DataValue::parse(DataType::Boolean, "FALSE").unwrap(), DataValue::Boolean(false));
        assert!(DataValue::parse(DataType::Boolean, "maybe").is_err());
    }

    #[test]
    fn test_parse_keeps_string_whitespace() {
        assert_eq!(
            DataValue::parse(DataType::String, " padded ").unwrap(),
            DataValue::String(" padded ".to_string())
        );
    }

    #[test]
    fn test_from_yaml_scalars() {
        let number: YamlValue = serde_yaml::from_str("3").unwrap();
        assert_eq!(DataValue::from_yaml(DataType::Integer, &number).unwrap(), DataValue::Integer(3));
        assert_eq!(DataValue::from_yaml(DataType::Float, &number).unwrap(), DataValue::Float(3.0));
        assert_eq!(
            DataValue::from_yaml(DataType::String, &number).unwrap(),
            DataValue::String("3".to_string())
        );

        let flag: YamlValue = serde_yaml::from_str("true").unwrap();
        assert_eq!(DataValue::from_yaml(DataType::Boolean, &flag).unwrap(), DataValue::Boolean(true));
    }

    #[test]
    fn test_from_yaml_rejects_mapping() {
        let mapping: YamlValue = serde_yaml::from_str("a: 1").unwrap();
        assert!(matches!(
            DataValue::from_yaml(DataType::String, &mapping),
            Err(ValueError::UnexpectedMapping { .. })
        ));
    }

    #[test]
    fn test_contents_substitution_joins_with_spaces() {
        let contents = DataContents::Array(vec![
            DataValue::File("a.txt".to_string()),
            DataValue::File("b.txt".to_string()),
        ]);
        assert_eq!(contents.substitution_value(), "a.txt b.txt");
        assert!(contents.is_array());

        let scalar = DataContents::Scalar(DataValue::Integer(7));
        assert_eq!(scalar.substitution_value(), "7");
    }

    #[test]
    fn test_value_serialization_is_tagged() {
        let json = serde_json::to_string(&DataValue::Integer(5)).unwrap();
        assert_eq!(json, r#"{"type":"integer","value":5}"#);
    }
}
