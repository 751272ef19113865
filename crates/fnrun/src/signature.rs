//! # Structural Signatures
//!
//! Members are indexed by `(name, signature)` where the signature is a method
//! descriptor in the classic `(params)return` form:
//!
//! ```text
//! (ILjava/lang/String;)V      int, String -> void
//! ([JZ)Ljava/util/List;       long[], boolean -> List
//! ```
//!
//! Overloads differ only in their signature, so the registry needs both a way
//! to build these strings from typed parameter lists and a parser to count
//! parameters when checking call arity.

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum TypeTag {
    Void,
    Bool,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Fully-qualified reference type, dotted (`java.lang.String`).
    Object(String),
    Array(Box<TypeTag>),
}

impl TypeTag {
    pub fn object(name: impl Into<String>) -> Self {
        Self::Object(name.into())
    }

    pub fn array(element: TypeTag) -> Self {
        Self::Array(Box::new(element))
    }

    pub fn string() -> Self {
        Self::object("java.lang.String")
    }

    fn write(&self, out: &mut String) {
        match self {
            Self::Void => out.push('V'),
            Self::Bool => out.push('Z'),
            Self::Byte => out.push('B'),
            Self::Char => out.push('C'),
            Self::Short => out.push('S'),
            Self::Int => out.push('I'),
            Self::Long => out.push('J'),
            Self::Float => out.push('F'),
            Self::Double => out.push('D'),
            Self::Object(name) => {
                out.push('L');
                out.push_str(&name.replace('.', "/"));
                out.push(';');
            }
            Self::Array(element) => {
                out.push('[');
                element.write(out);
            }
        }
    }

    pub fn descriptor(&self) -> String {
        let mut out = String::new();
        self.write(&mut out);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Malformed { signature: String, position: usize },
    VoidParameter { signature: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed { signature, position } => {
                write!(f, "Malformed signature '{}' at byte {}", signature, position)
            }
            Self::VoidParameter { signature } => {
                write!(f, "Signature '{}' declares a void parameter", signature)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Builds a method descriptor from parameter and return types.
pub fn descriptor(params: &[TypeTag], ret: &TypeTag) -> String {
    let mut out = String::from("(");
    for param in params {
        param.write(&mut out);
    }
    out.push(')');
    ret.write(&mut out);
    out
}

/// A parsed method descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodType {
    pub params: Vec<TypeTag>,
    pub ret: TypeTag,
}

struct Cursor<'a> {
    signature: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn malformed(&self) -> Error {
        Error::Malformed {
            signature: self.signature.to_string(),
            position: self.pos,
        }
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.bytes.get(self.pos) == Some(&byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.malformed())
        }
    }

    fn tag(&mut self) -> Result<TypeTag> {
        let Some(&byte) = self.bytes.get(self.pos) else {
            return Err(self.malformed());
        };
        self.pos += 1;
        let tag = match byte {
            b'V' => TypeTag::Void,
            b'Z' => TypeTag::Bool,
            b'B' => TypeTag::Byte,
            b'C' => TypeTag::Char,
            b'S' => TypeTag::Short,
            b'I' => TypeTag::Int,
            b'J' => TypeTag::Long,
            b'F' => TypeTag::Float,
            b'D' => TypeTag::Double,
            b'L' => {
                let start = self.pos;
                let Some(len) = self.signature[start..].find(';') else {
                    return Err(self.malformed());
                };
                if len == 0 {
                    return Err(self.malformed());
                }
                self.pos = start + len + 1;
                TypeTag::Object(self.signature[start..start + len].replace('/', "."))
            }
            b'[' => {
                let element = self.tag()?;
                if element == TypeTag::Void {
                    return Err(self.malformed());
                }
                TypeTag::array(element)
            }
            _ => {
                self.pos -= 1;
                return Err(self.malformed());
            }
        };
        Ok(tag)
    }
}

/// Parses a method descriptor.
pub fn parse(signature: &str) -> Result<MethodType> {
    let mut cursor = Cursor {
        signature,
        bytes: signature.as_bytes(),
        pos: 0,
    };
    cursor.expect(b'(')?;

    let mut params = Vec::new();
    while cursor.bytes.get(cursor.pos) != Some(&b')') {
        let tag = cursor.tag()?;
        if tag == TypeTag::Void {
            return Err(Error::VoidParameter {
                signature: signature.to_string(),
            });
        }
        params.push(tag);
    }
    cursor.expect(b')')?;

    let ret = cursor.tag()?;
    if cursor.pos != cursor.bytes.len() {
        return Err(cursor.malformed());
    }
    Ok(MethodType { params, ret })
}

pub fn param_count(signature: &str) -> Result<usize> {
    parse(signature).map(|method| method.params.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_descriptor() {
        let sig = descriptor(&[TypeTag::Int, TypeTag::string()], &TypeTag::Void);
        assert_eq!(sig, "(ILjava/lang/String;)V");

        let sig = descriptor(
            &[TypeTag::array(TypeTag::Long), TypeTag::Bool],
            &TypeTag::object("java.util.List"),
        );
        assert_eq!(sig, "([JZ)Ljava/util/List;");
    }

    #[test]
    fn test_parse_counts_parameters() {
        assert_eq!(param_count("()V").expect("parse"), 0);
        assert_eq!(param_count("(ILjava/lang/String;)V").expect("parse"), 2);
        assert_eq!(param_count("([[ILjava/lang/Object;D)J").expect("parse"), 3);
    }

    #[test]
    fn test_parse_restores_dotted_names() {
        let method = parse("(Lcom/acme/Point;)Lcom/acme/Point;").expect("parse");
        assert_eq!(method.params, vec![TypeTag::object("com.acme.Point")]);
        assert_eq!(method.ret, TypeTag::object("com.acme.Point"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "I", "(I", "(I)", "(Q)V", "(Ljava/lang/String)V", "()VV", "(V)V", "(L;)V"] {
            assert!(parse(bad).is_err(), "{bad:?} should not parse");
        }
    }
}
