//! Typed RPC values.
//!
//! Every RPC parameter and return value is one of a small set of types. Method
//! signatures are written as type strings (`"si"` = string, int32) and checked
//! against the values of an incoming call before any handler runs.

use serde::{Deserialize, Serialize};

/// A single typed RPC value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    String(String),
    StringArray(Vec<String>),
    Data(#[serde(with = "serde_bytes")] Vec<u8>),
}

/// Error returned when a value does not have the expected type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("missing value at index {index}")]
    Missing { index: usize },
    #[error("value at index {index} is '{actual}', expected '{expected}'")]
    WrongType {
        index: usize,
        expected: char,
        actual: char,
    },
}

impl Value {
    /// Single-character type code used in method signatures.
    #[must_use]
    pub fn type_code(&self) -> char {
        match self {
            Self::Int32(_) => 'i',
            Self::Int64(_) => 'l',
            Self::String(_) => 's',
            Self::StringArray(_) => 'S',
            Self::Data(_) => 'x',
        }
    }
}

/// Checks that `values` match the signature `types` exactly.
///
/// # Errors
///
/// Returns the first mismatch: a missing value, a wrong type, or an
/// unexpected trailing value (reported with expected type `'-'`).
pub fn check_signature(types: &str, values: &[Value]) -> Result<(), ValueError> {
    let expected: Vec<char> = types.chars().collect();
    if values.len() > expected.len() {
        return Err(ValueError::WrongType {
            index: expected.len(),
            expected: '-',
            actual: values[expected.len()].type_code(),
        });
    }
    for (index, code) in expected.iter().enumerate() {
        let value = values.get(index).ok_or(ValueError::Missing { index })?;
        if value.type_code() != *code {
            return Err(ValueError::WrongType {
                index,
                expected: *code,
                actual: value.type_code(),
            });
        }
    }
    Ok(())
}

/// Typed accessors over a list of values, used by method handlers after the
/// signature has been checked.
pub trait ValuesExt {
    /// # Errors
    /// Fails if the value is missing or not an int32.
    fn int32(&self, index: usize) -> Result<i32, ValueError>;
    /// # Errors
    /// Fails if the value is missing or not an int64.
    fn int64(&self, index: usize) -> Result<i64, ValueError>;
    /// # Errors
    /// Fails if the value is missing or not a string.
    fn string(&self, index: usize) -> Result<&str, ValueError>;
    /// # Errors
    /// Fails if the value is missing or not a string array.
    fn string_array(&self, index: usize) -> Result<&[String], ValueError>;
    /// # Errors
    /// Fails if the value is missing or not a data blob.
    fn data(&self, index: usize) -> Result<&[u8], ValueError>;
}

fn wrong(index: usize, expected: char, actual: &Value) -> ValueError {
    ValueError::WrongType {
        index,
        expected,
        actual: actual.type_code(),
    }
}

impl ValuesExt for [Value] {
    fn int32(&self, index: usize) -> Result<i32, ValueError> {
        match self.get(index) {
            Some(Value::Int32(v)) => Ok(*v),
            Some(other) => Err(wrong(index, 'i', other)),
            None => Err(ValueError::Missing { index }),
        }
    }

    fn int64(&self, index: usize) -> Result<i64, ValueError> {
        match self.get(index) {
            Some(Value::Int64(v)) => Ok(*v),
            Some(other) => Err(wrong(index, 'l', other)),
            None => Err(ValueError::Missing { index }),
        }
    }

    fn string(&self, index: usize) -> Result<&str, ValueError> {
        match self.get(index) {
            Some(Value::String(v)) => Ok(v),
            Some(other) => Err(wrong(index, 's', other)),
            None => Err(ValueError::Missing { index }),
        }
    }

    fn string_array(&self, index: usize) -> Result<&[String], ValueError> {
        match self.get(index) {
            Some(Value::StringArray(v)) => Ok(v),
            Some(other) => Err(wrong(index, 'S', other)),
            None => Err(ValueError::Missing { index }),
        }
    }

    fn data(&self, index: usize) -> Result<&[u8], ValueError> {
        match self.get(index) {
            Some(Value::Data(v)) => Ok(v),
            Some(other) => Err(wrong(index, 'x', other)),
            None => Err(ValueError::Missing { index }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_accepts_exact_match() {
        let values = vec![Value::String("ref".into()), Value::Int32(0)];
        assert!(check_signature("si", &values).is_ok());
        assert!(check_signature("", &[]).is_ok());
    }

    #[test]
    fn signature_rejects_wrong_type() {
        let values = vec![Value::Int32(1), Value::Int32(0)];
        assert_eq!(
            check_signature("si", &values),
            Err(ValueError::WrongType {
                index: 0,
                expected: 's',
                actual: 'i'
            })
        );
    }

    #[test]
    fn signature_rejects_missing_and_extra_values() {
        assert_eq!(
            check_signature("si", &[Value::String("a".into())]),
            Err(ValueError::Missing { index: 1 })
        );
        assert!(check_signature("", &[Value::Int32(1)]).is_err());
    }

    #[test]
    fn typed_accessors() {
        let values = vec![
            Value::Int32(7),
            Value::Int64(-3),
            Value::String("x".into()),
            Value::StringArray(vec!["a".into(), "b".into()]),
            Value::Data(vec![1, 2, 3]),
        ];
        let slice = values.as_slice();
        assert_eq!(slice.int32(0).unwrap(), 7);
        assert_eq!(slice.int64(1).unwrap(), -3);
        assert_eq!(slice.string(2).unwrap(), "x");
        assert_eq!(slice.string_array(3).unwrap().len(), 2);
        assert_eq!(slice.data(4).unwrap(), &[1, 2, 3]);
        assert!(slice.int32(2).is_err());
        assert_eq!(slice.int32(9), Err(ValueError::Missing { index: 9 }));
    }
}
