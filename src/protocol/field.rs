use std::fmt;

/// Primitive type of one schema position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Int,
    Double,
    Bool,
    Str,
}

impl FieldKind {
    /// Encoded width in the binary sub-mode; `None` for length-prefixed strings.
    pub fn width(&self) -> Option<usize> {
        match self {
            FieldKind::Int => Some(size_of::<i32>()),
            FieldKind::Double => Some(size_of::<f64>()),
            FieldKind::Bool => Some(size_of::<u8>()),
            FieldKind::Str => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Int => "int",
            FieldKind::Double => "double",
            FieldKind::Bool => "bool",
            FieldKind::Str => "string",
        };
        f.write_str(name)
    }
}

/// One typed value of a request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Int(i32),
    Double(f64),
    Bool(bool),
    Str(String),
}

impl Field {
    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Int(_) => FieldKind::Int,
            Field::Double(_) => FieldKind::Double,
            Field::Bool(_) => FieldKind::Bool,
            Field::Str(_) => FieldKind::Str,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Field::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Field::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Field::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Field::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i32> for Field {
    fn from(value: i32) -> Self {
        Field::Int(value)
    }
}

impl From<f64> for Field {
    fn from(value: f64) -> Self {
        Field::Double(value)
    }
}

impl From<bool> for Field {
    fn from(value: bool) -> Self {
        Field::Bool(value)
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::Str(value.to_string())
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Field::Str(value)
    }
}

/// Text token form used by the line framing.
impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Int(v) => write!(f, "{v}"),
            Field::Double(v) => write!(f, "{v}"),
            Field::Bool(v) => f.write_str(if *v { "1" } else { "0" }),
            Field::Str(v) => f.write_str(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_widths() {
        assert_eq!(FieldKind::Int.width(), Some(4));
        assert_eq!(FieldKind::Double.width(), Some(8));
        assert_eq!(FieldKind::Bool.width(), Some(1));
        assert_eq!(FieldKind::Str.width(), None);
    }

    #[test]
    fn text_tokens() {
        assert_eq!(Field::from(-12).to_string(), "-12");
        assert_eq!(Field::from(0.5).to_string(), "0.5");
        assert_eq!(Field::from(true).to_string(), "1");
        assert_eq!(Field::from(false).to_string(), "0");
        assert_eq!(Field::from("speed").to_string(), "speed");
    }

    #[test]
    fn typed_accessors() {
        let field = Field::from("speed");
        assert_eq!(field.as_str(), Some("speed"));
        assert_eq!(field.as_int(), None);
        assert_eq!(Field::from(2.0).as_double(), Some(2.0));
        assert_eq!(Field::from(7).as_int(), Some(7));
        assert_eq!(Field::from(true).as_bool(), Some(true));
    }
}
