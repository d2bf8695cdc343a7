/// The single-letter type codes of the D-Bus type system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeCode {
    /// 8-bit unsigned integer.
    Byte = b'y',
    /// Boolean value, 0 is FALSE and 1 is TRUE. Everything else is invalid.
    Boolean = b'b',
    /// 16-bit signed integer.
    Int16 = b'n',
    /// 16-bit unsigned integer.
    Uint16 = b'q',
    /// 32-bit signed integer.
    Int32 = b'i',
    /// 32-bit unsigned integer.
    Uint32 = b'u',
    /// 64-bit signed integer.
    Int64 = b'x',
    /// 64-bit unsigned integer.
    Uint64 = b't',
    /// IEEE 754 double.
    Double = b'd',
    /// UTF-8 string. Nul terminated on the wire and free of interior nuls.
    String = b's',
    /// Name of an object instance.
    ObjectPath = b'o',
    /// A type signature.
    Signature = b'g',
    /// Unsigned 32-bit index into the out-of-band file descriptor array.
    UnixFd = b'h',
    /// Array of a single element type.
    Array = b'a',
    /// Struct with one or more fields.
    Struct = b'(',
    /// Variant type: the type of the value is part of the value itself.
    Variant = b'v',
    /// Entry in a dict; only valid as the immediate element of an array.
    DictEntry = b'{',
}

impl TypeCode {
    /// Decode a basic (non-container) type code, including variant.
    pub(crate) fn from_basic_byte(byte: u8) -> Option<Self> {
        match byte {
            b'y' => Some(Self::Byte),
            b'b' => Some(Self::Boolean),
            b'n' => Some(Self::Int16),
            b'q' => Some(Self::Uint16),
            b'i' => Some(Self::Int32),
            b'u' => Some(Self::Uint32),
            b'x' => Some(Self::Int64),
            b't' => Some(Self::Uint64),
            b'd' => Some(Self::Double),
            b's' => Some(Self::String),
            b'o' => Some(Self::ObjectPath),
            b'g' => Some(Self::Signature),
            b'h' => Some(Self::UnixFd),
            b'v' => Some(Self::Variant),
            _ => None,
        }
    }

    /// The character spelling of this code.
    pub fn as_char(self) -> char {
        self as u8 as char
    }

    /// The wire alignment of a value of this type.
    pub fn alignment(self) -> usize {
        match self {
            Self::Byte | Self::Signature | Self::Variant => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Boolean
            | Self::Int32
            | Self::Uint32
            | Self::Double
            | Self::String
            | Self::ObjectPath
            | Self::UnixFd
            | Self::Array => 4,
            Self::Int64 | Self::Uint64 | Self::Struct | Self::DictEntry => 8,
        }
    }

    /// Test if this is a basic type, usable as a dict-entry key.
    pub fn is_basic(self) -> bool {
        !matches!(
            self,
            Self::Array | Self::Struct | Self::DictEntry | Self::Variant
        )
    }
}

impl TypeCode {
    /// Fixed-size-ness of a code on its own; `None` for aggregates whose
    /// answer depends on their fields.
    fn fixed_size(self) -> Option<bool> {
        match self {
            Self::Byte
            | Self::Boolean
            | Self::Int16
            | Self::Uint16
            | Self::Int32
            | Self::Uint32
            | Self::Int64
            | Self::Uint64
            | Self::Double
            | Self::UnixFd => Some(true),
            Self::String | Self::ObjectPath | Self::Signature | Self::Array | Self::Variant => {
                Some(false)
            }
            Self::Struct | Self::DictEntry => None,
        }
    }
}

/// One complete type in a parsed signature.
///
/// Container nodes own their children: an array has exactly one child (the
/// element type), a struct has its fields in order and a dict entry has a key
/// and a value child. Variants carry no child at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignatureNode {
    code: TypeCode,
    children: Vec<SignatureNode>,
    fixed_size: bool,
}

impl SignatureNode {
    pub(crate) fn basic(code: TypeCode) -> Self {
        debug_assert!(!matches!(
            code,
            TypeCode::Array | TypeCode::Struct | TypeCode::DictEntry
        ));

        Self {
            fixed_size: code.fixed_size().unwrap_or(false),
            code,
            children: Vec::new(),
        }
    }

    pub(crate) fn array(element: SignatureNode) -> Self {
        Self {
            code: TypeCode::Array,
            children: vec![element],
            fixed_size: false,
        }
    }

    pub(crate) fn structure(fields: Vec<SignatureNode>) -> Self {
        Self {
            fixed_size: fields.iter().all(|f| f.fixed_size),
            code: TypeCode::Struct,
            children: fields,
        }
    }

    pub(crate) fn dict_entry(key: SignatureNode, value: SignatureNode) -> Self {
        Self {
            fixed_size: key.fixed_size && value.fixed_size,
            code: TypeCode::DictEntry,
            children: vec![key, value],
        }
    }

    /// The type code of this node.
    pub fn code(&self) -> TypeCode {
        self.code
    }

    /// The wire alignment of this node.
    pub fn alignment(&self) -> usize {
        self.code.alignment()
    }

    /// Test if values of this type occupy a size independent of the value.
    ///
    /// Basic numeric types are fixed, and so are structs all of whose fields
    /// are fixed.
    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size
    }

    /// Children of this node.
    pub fn children(&self) -> &[SignatureNode] {
        &self.children
    }

    /// The array element type.
    ///
    /// # Panics
    ///
    /// Panics if this node is not an array.
    pub(crate) fn element(&self) -> &SignatureNode {
        &self.children[0]
    }

    /// The human readable spelling of this complete type.
    ///
    /// # Examples
    ///
    /// ```
    /// use async_dbus::signature::parse_signature;
    ///
    /// let nodes = parse_signature("a(yv)")?;
    /// assert_eq!(nodes[0].text(), "a(yv)");
    /// # Ok::<_, async_dbus::signature::SignatureError>(())
    /// ```
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.write_text(&mut out);
        out
    }

    pub(crate) fn write_text(&self, out: &mut String) {
        match self.code {
            TypeCode::Array => {
                out.push('a');
                self.children[0].write_text(out);
            }
            TypeCode::Struct => {
                out.push('(');

                for child in &self.children {
                    child.write_text(out);
                }

                out.push(')');
            }
            TypeCode::DictEntry => {
                out.push('{');
                self.children[0].write_text(out);
                self.children[1].write_text(out);
                out.push('}');
            }
            code => out.push(code.as_char()),
        }
    }
}
