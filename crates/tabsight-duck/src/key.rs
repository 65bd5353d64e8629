use tabsight_ir::Value;

/// Hashable identity of a value.
///
/// Integral floats collapse onto integers so `1` and `1.0` group, join and
/// count as the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
}

impl From<&Value> for ValueKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => ValueKey::Null,
            Value::Bool(b) => ValueKey::Bool(*b),
            Value::Int(i) => ValueKey::Int(*i),
            Value::Float(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    ValueKey::Int(*f as i64)
                } else {
                    ValueKey::Float(f.to_bits())
                }
            }
            Value::String(s) => ValueKey::Str(s.clone()),
        }
    }
}

impl ValueKey {
    pub fn is_null(&self) -> bool {
        matches!(self, ValueKey::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_floats_match_ints() {
        assert_eq!(ValueKey::from(&Value::Float(3.0)), ValueKey::from(&Value::Int(3)));
        assert_ne!(ValueKey::from(&Value::Float(3.5)), ValueKey::from(&Value::Int(3)));
        assert_ne!(
            ValueKey::from(&Value::from("3")),
            ValueKey::from(&Value::Int(3))
        );
    }
}
