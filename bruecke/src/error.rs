use std::fmt;

/// Error raised while lexing or parsing a declaration string.
///
/// Carries the 1-based line within the string handed to `Ffi::define`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub line: u32,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        ParseError {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on line {}", self.message, self.line)
    }
}

impl std::error::Error for ParseError {}

/// Error raised while converting host values to or from C memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    /// A value could not be represented in the requested C type. `index`
    /// is the 1-based argument position when the conversion happened while
    /// preparing a call frame.
    Convert {
        index: Option<usize>,
        from: String,
        to: String,
    },
    UnknownMember {
        type_name: String,
        member: String,
    },
    NotIndexable {
        type_name: String,
    },
    NotCallable {
        type_name: String,
    },
    /// Instances of `void` cannot be created.
    VoidInstance,
    UndefinedInstance {
        type_name: String,
    },
    /// A variable-sized type was instantiated without an element count.
    VariableInstance {
        type_name: String,
    },
    ArgCount {
        expected: usize,
        given: usize,
        variadic: bool,
    },
    StringConvert,
    PointerArith {
        lhs: String,
        rhs: String,
    },
    Compare {
        lhs: String,
        rhs: String,
    },
    DivideByZero,
    NullPointer,
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::Convert {
                index: Some(i),
                from,
                to,
            } => {
                write!(f, "unable to convert argument {i} from {from} to {to}")
            }
            MarshalError::Convert {
                index: None,
                from,
                to,
            } => {
                write!(f, "unable to convert {from} to {to}")
            }
            MarshalError::UnknownMember { type_name, member } => {
                write!(f, "type {type_name} has no member {member}")
            }
            MarshalError::NotIndexable { type_name } => {
                write!(f, "type {type_name} can not be indexed")
            }
            MarshalError::NotCallable { type_name } => {
                write!(f, "type {type_name} is not callable")
            }
            MarshalError::VoidInstance => {
                write!(f, "can't create an instance of type void")
            }
            MarshalError::UndefinedInstance { type_name } => {
                write!(f, "can't create an instance of undefined type {type_name}")
            }
            MarshalError::VariableInstance { type_name } => {
                write!(
                    f,
                    "missing length for variable sized type {type_name}"
                )
            }
            MarshalError::ArgCount {
                expected,
                given,
                variadic,
            } => {
                if *variadic {
                    write!(f, "expected at least {expected} arguments, got {given}")
                } else {
                    write!(f, "expected {expected} arguments, got {given}")
                }
            }
            MarshalError::StringConvert => {
                write!(f, "unable to convert the value to a string")
            }
            MarshalError::PointerArith { lhs, rhs } => {
                write!(f, "invalid pointer arithmetic on {lhs} and {rhs}")
            }
            MarshalError::Compare { lhs, rhs } => {
                write!(f, "can not compare {lhs} with {rhs}")
            }
            MarshalError::DivideByZero => write!(f, "divide by zero"),
            MarshalError::NullPointer => {
                write!(f, "attempt to access a null pointer")
            }
        }
    }
}

impl std::error::Error for MarshalError {}

/// Internal failure inside the stub compiler. These indicate a signature
/// the backend can not express or an OS refusal, never bad user input, so
/// each variant carries a stable diagnostic code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    UnsupportedArgument { index: usize, type_name: String },
    UnsupportedReturn { type_name: String },
    VariadicCallback,
    MapFailed { len: usize },
    ProtectFailed,
}

impl JitError {
    pub fn code(&self) -> u32 {
        match self {
            JitError::UnsupportedArgument { .. } => 1,
            JitError::UnsupportedReturn { .. } => 2,
            JitError::VariadicCallback => 3,
            JitError::MapFailed { .. } => 4,
            JitError::ProtectFailed => 5,
        }
    }
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "jit error {}: ", self.code())?;
        match self {
            JitError::UnsupportedArgument { index, type_name } => {
                write!(f, "can not pass argument {index} of type {type_name}")
            }
            JitError::UnsupportedReturn { type_name } => {
                write!(f, "can not return type {type_name}")
            }
            JitError::VariadicCallback => {
                write!(f, "callbacks can not be variadic")
            }
            JitError::MapFailed { len } => {
                write!(f, "mapping {len} bytes of executable memory failed")
            }
            JitError::ProtectFailed => {
                write!(f, "changing page protection failed")
            }
        }
    }
}

impl std::error::Error for JitError {}

/// Error raised while opening a shared library or resolving a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryError {
    OpenFailed { name: String, reason: String },
    MissingDeclaration { name: String },
    SymbolNotFound { name: String },
}

impl fmt::Display for LibraryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryError::OpenFailed { name, reason } => {
                write!(f, "could not load library {name}: {reason}")
            }
            LibraryError::MissingDeclaration { name } => {
                write!(f, "missing declaration for function {name}")
            }
            LibraryError::SymbolNotFound { name } => {
                write!(f, "failed to find function {name}")
            }
        }
    }
}

impl std::error::Error for LibraryError {}

/// Any error the interface can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Parse(ParseError),
    Marshal(MarshalError),
    Jit(JitError),
    Library(LibraryError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse(e) => e.fmt(f),
            Error::Marshal(e) => e.fmt(f),
            Error::Jit(e) => e.fmt(f),
            Error::Library(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Parse(e) => Some(e),
            Error::Marshal(e) => Some(e),
            Error::Jit(e) => Some(e),
            Error::Library(e) => Some(e),
        }
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Parse(e)
    }
}

impl From<MarshalError> for Error {
    fn from(e: MarshalError) -> Self {
        Error::Marshal(e)
    }
}

impl From<JitError> for Error {
    fn from(e: JitError) -> Self {
        Error::Jit(e)
    }
}

impl From<LibraryError> for Error {
    fn from(e: LibraryError) -> Self {
        Error::Library(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_carries_line() {
        let err = ParseError::new("unknown type foo", 3);
        assert_eq!(err.to_string(), "unknown type foo on line 3");
    }

    #[test]
    fn convert_error_names_both_sides() {
        let err = MarshalError::Convert {
            index: Some(2),
            from: "string".to_string(),
            to: "struct point*".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unable to convert argument 2 from string to struct point*"
        );
    }

    #[test]
    fn jit_error_codes_are_stable() {
        assert_eq!(JitError::VariadicCallback.code(), 3);
        assert_eq!(JitError::ProtectFailed.code(), 5);
        let err = JitError::MapFailed { len: 4096 };
        assert!(err.to_string().starts_with("jit error 4:"));
    }

    #[test]
    fn wrapper_preserves_message() {
        let err: Error = LibraryError::SymbolNotFound {
            name: "strlen".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "failed to find function strlen");
    }
}
