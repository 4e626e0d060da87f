//! Parsed method and field descriptors
//!
//! The class loader hands the core pre-parsed descriptors; this module is the
//! typed form both sides agree on. Small integral types (byte, short, char,
//! boolean) all widen to `Int` on the operand stack, so the compiler sees the
//! five canonical value types plus the `jsr` return-address pseudo-type.

use std::fmt;
use std::sync::Arc;

/// Canonical operand-stack types tracked by the stack analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int,
    Long,
    Float,
    Double,
    /// Any reference, including arrays and `null`.
    Address,
    /// A `jsr` return address; storable into a local, consumable by `ret`.
    Ret,
}

impl ValueType {
    /// Whether the type occupies two local-variable slots in class-file terms.
    pub fn is_twoword(self) -> bool {
        matches!(self, ValueType::Long | ValueType::Double)
    }

    /// Whether the type lives in floating-point registers.
    pub fn is_float(self) -> bool {
        matches!(self, ValueType::Float | ValueType::Double)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Int => "int",
            ValueType::Long => "long",
            ValueType::Float => "float",
            ValueType::Double => "double",
            ValueType::Address => "adr",
            ValueType::Ret => "ret",
        };
        f.write_str(s)
    }
}

/// A fully parsed field/parameter/return type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JavaType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Class or interface type with its binary name.
    Reference(Arc<str>),
    /// Array type; the component is the element descriptor string.
    Array(Arc<str>),
}

impl JavaType {
    /// The operand-stack type this parameter occupies.
    pub fn value_type(&self) -> ValueType {
        match self {
            JavaType::Boolean
            | JavaType::Byte
            | JavaType::Char
            | JavaType::Short
            | JavaType::Int => ValueType::Int,
            JavaType::Long => ValueType::Long,
            JavaType::Float => ValueType::Float,
            JavaType::Double => ValueType::Double,
            JavaType::Reference(_) | JavaType::Array(_) => ValueType::Address,
        }
    }

    /// Local-variable slots consumed in class-file numbering.
    pub fn slot_count(&self) -> u16 {
        if self.value_type().is_twoword() {
            2
        } else {
            1
        }
    }

    /// Size in bytes of the type when stored in an array element.
    pub fn element_size(&self) -> usize {
        match self {
            JavaType::Boolean | JavaType::Byte => 1,
            JavaType::Char | JavaType::Short => 2,
            JavaType::Int | JavaType::Float => 4,
            JavaType::Long | JavaType::Double => 8,
            JavaType::Reference(_) | JavaType::Array(_) => 8,
        }
    }
}

/// Error from descriptor parsing
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("truncated descriptor")]
    Truncated,
    #[error("unknown type character '{0}'")]
    UnknownType(char),
    #[error("missing '(' in method descriptor")]
    MissingParen,
}

/// A parsed method descriptor: parameter types, return type, slot counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Declared parameters, excluding the receiver.
    pub params: Vec<JavaType>,
    /// `None` for `void`.
    pub ret: Option<JavaType>,
    /// Total parameter slots in class-file numbering, excluding the receiver.
    pub param_slots: u16,
}

impl MethodDescriptor {
    /// Parse a descriptor string such as `(I[JLjava/lang/String;)V`.
    pub fn parse(desc: &str) -> Result<Self, DescriptorError> {
        let mut chars = desc.char_indices().peekable();
        match chars.next() {
            Some((_, '(')) => {}
            _ => return Err(DescriptorError::MissingParen),
        }

        let mut params = Vec::new();
        loop {
            match chars.peek() {
                Some((_, ')')) => {
                    chars.next();
                    break;
                }
                Some(_) => params.push(parse_one(desc, &mut chars)?),
                None => return Err(DescriptorError::Truncated),
            }
        }

        let ret = match chars.peek() {
            Some((_, 'V')) => None,
            Some(_) => Some(parse_one(desc, &mut chars)?),
            None => return Err(DescriptorError::Truncated),
        };

        let param_slots = params.iter().map(|p| p.slot_count()).sum();
        Ok(MethodDescriptor {
            params,
            ret,
            param_slots,
        })
    }

    /// Operand-stack type of the return value, if any.
    pub fn return_value_type(&self) -> Option<ValueType> {
        self.ret.as_ref().map(|t| t.value_type())
    }
}

type CharIter<'a> = std::iter::Peekable<std::str::CharIndices<'a>>;

fn parse_one(desc: &str, chars: &mut CharIter<'_>) -> Result<JavaType, DescriptorError> {
    let (start, c) = chars.next().ok_or(DescriptorError::Truncated)?;
    match c {
        'Z' => Ok(JavaType::Boolean),
        'B' => Ok(JavaType::Byte),
        'C' => Ok(JavaType::Char),
        'S' => Ok(JavaType::Short),
        'I' => Ok(JavaType::Int),
        'J' => Ok(JavaType::Long),
        'F' => Ok(JavaType::Float),
        'D' => Ok(JavaType::Double),
        'L' => {
            let name_start = start + 1;
            for (i, c) in chars.by_ref() {
                if c == ';' {
                    return Ok(JavaType::Reference(Arc::from(&desc[name_start..i])));
                }
            }
            Err(DescriptorError::Truncated)
        }
        '[' => {
            // Consume the component type, then reference the raw descriptor
            // text so nested arrays keep their full shape.
            let comp_start = start + 1;
            parse_one(desc, chars)?;
            let end = chars.peek().map(|(i, _)| *i).unwrap_or(desc.len());
            Ok(JavaType::Array(Arc::from(&desc[comp_start..end])))
        }
        other => Err(DescriptorError::UnknownType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_descriptor() {
        let d = MethodDescriptor::parse("(II)I").unwrap();
        assert_eq!(d.params, vec![JavaType::Int, JavaType::Int]);
        assert_eq!(d.ret, Some(JavaType::Int));
        assert_eq!(d.param_slots, 2);
    }

    #[test]
    fn test_void_and_wide_params() {
        let d = MethodDescriptor::parse("(JD)V").unwrap();
        assert_eq!(d.params.len(), 2);
        assert_eq!(d.ret, None);
        assert_eq!(d.param_slots, 4);
    }

    #[test]
    fn test_reference_and_array() {
        let d = MethodDescriptor::parse("([ILjava/lang/String;)[J").unwrap();
        assert_eq!(d.params[0], JavaType::Array(Arc::from("I")));
        assert_eq!(
            d.params[1],
            JavaType::Reference(Arc::from("java/lang/String"))
        );
        assert_eq!(d.ret, Some(JavaType::Array(Arc::from("J"))));
        assert_eq!(d.param_slots, 2);
    }

    #[test]
    fn test_nested_array() {
        let d = MethodDescriptor::parse("([[I)V").unwrap();
        assert_eq!(d.params[0], JavaType::Array(Arc::from("[I")));
    }

    #[test]
    fn test_value_types() {
        assert_eq!(JavaType::Boolean.value_type(), ValueType::Int);
        assert_eq!(JavaType::Char.value_type(), ValueType::Int);
        assert_eq!(JavaType::Long.value_type(), ValueType::Long);
        assert!(ValueType::Double.is_twoword());
        assert!(!ValueType::Address.is_twoword());
        assert!(ValueType::Float.is_float());
    }

    #[test]
    fn test_malformed() {
        assert_eq!(
            MethodDescriptor::parse("II)I"),
            Err(DescriptorError::MissingParen)
        );
        assert_eq!(
            MethodDescriptor::parse("(I"),
            Err(DescriptorError::Truncated)
        );
        assert!(matches!(
            MethodDescriptor::parse("(Q)V"),
            Err(DescriptorError::UnknownType('Q'))
        ));
    }
}
