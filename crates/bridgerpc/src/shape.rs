//! # Call Shapes
//!
//! What a call is addressed to. Each shape carries exactly the fields that
//! kind of call needs, so a method call without a target object cannot be
//! built.

use std::fmt;
use std::str::FromStr;

use bridgepack::Handle;

use crate::error::Error;

/// The target of one remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallShape {
    /// A function from a module with a known, generated interface.
    Function { module: String, function: String },
    /// A method on a live remote object.
    Method { target: Handle, method: String },
    /// Instantiates `class` from `module`; the reply is normally a ref.
    Constructor { module: String, class: String },
    /// A function located by name at call time, with no generated interface.
    Dynamic { module: String, function: String },
    /// Like `Dynamic`, but the remote answers with a chunk stream.
    DynamicStream { module: String, function: String },
    /// A named helper registered on the remote side.
    Helper { name: String },
    /// Reads an attribute of a live remote object.
    GetAttr { target: Handle, attr: String },
    /// Writes an attribute of a live remote object; the new value is the
    /// first positional argument.
    SetAttr { target: Handle, attr: String },
    /// Reads a module-level attribute such as a constant.
    ModuleAttr { module: String, attr: String },
}

impl CallShape {
    pub fn call_type(&self) -> CallType {
        match self {
            Self::Function { .. } => CallType::Function,
            Self::Method { .. } => CallType::Method,
            Self::Constructor { .. } => CallType::Constructor,
            Self::Dynamic { .. } => CallType::Dynamic,
            Self::DynamicStream { .. } => CallType::DynamicStream,
            Self::Helper { .. } => CallType::Helper,
            Self::GetAttr { .. } => CallType::GetAttr,
            Self::SetAttr { .. } => CallType::SetAttr,
            Self::ModuleAttr { .. } => CallType::ModuleAttr,
        }
    }

    /// Dotted module path the call resolves against.
    ///
    /// For object-addressed shapes this is the module of the object's type.
    /// For helpers it is everything before the last dot of the helper name.
    pub fn remote_module(&self) -> &str {
        match self {
            Self::Function { module, .. }
            | Self::Constructor { module, .. }
            | Self::Dynamic { module, .. }
            | Self::DynamicStream { module, .. }
            | Self::ModuleAttr { module, .. } => module,
            Self::Method { target, .. } | Self::GetAttr { target, .. } | Self::SetAttr { target, .. } => {
                &target.remote_module
            }
            Self::Helper { name } => name.rsplit_once('.').map(|(m, _)| m).unwrap_or(""),
        }
    }

    /// Top-level library name, the first segment of [`Self::remote_module`].
    pub fn library(&self) -> &str {
        match self {
            Self::Method { target, .. } | Self::GetAttr { target, .. } | Self::SetAttr { target, .. } => {
                &target.library
            }
            Self::Helper { name } => name.split('.').next().unwrap_or(name),
            _ => {
                let module = self.remote_module();
                module.split('.').next().unwrap_or(module)
            }
        }
    }

    /// The function, method, class, attribute or helper being invoked.
    pub fn function_or_method(&self) -> &str {
        match self {
            Self::Function { function, .. }
            | Self::Dynamic { function, .. }
            | Self::DynamicStream { function, .. } => function,
            Self::Method { method, .. } => method,
            Self::Constructor { class, .. } => class,
            Self::Helper { name } => name,
            Self::GetAttr { attr, .. } | Self::SetAttr { attr, .. } | Self::ModuleAttr { attr, .. } => attr,
        }
    }

    /// The remote object this call is addressed to, if any.
    pub fn target(&self) -> Option<&Handle> {
        match self {
            Self::Method { target, .. } | Self::GetAttr { target, .. } | Self::SetAttr { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Some(target) => write!(f, "{} {}.{}", self.call_type(), target, self.function_or_method()),
            None => write!(f, "{} {}.{}", self.call_type(), self.remote_module(), self.function_or_method()),
        }
    }
}

/// The bare `call_type` tag, without the fields a [`CallShape`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallType {
    Function,
    Method,
    Constructor,
    Dynamic,
    DynamicStream,
    Helper,
    GetAttr,
    SetAttr,
    ModuleAttr,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Constructor => "constructor",
            Self::Dynamic => "dynamic",
            Self::DynamicStream => "dynamic-stream",
            Self::Helper => "helper",
            Self::GetAttr => "get_attr",
            Self::SetAttr => "set_attr",
            Self::ModuleAttr => "module_attr",
        }
    }

    /// Whether replies to this call type arrive as a chunk stream.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::DynamicStream)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "function" => Self::Function,
            "method" => Self::Method,
            "constructor" | "class" => Self::Constructor,
            "dynamic" => Self::Dynamic,
            "dynamic-stream" | "dynamic_stream" | "stream" => Self::DynamicStream,
            "helper" => Self::Helper,
            "get_attr" => Self::GetAttr,
            "set_attr" => Self::SetAttr,
            "module_attr" => Self::ModuleAttr,
            other => return Err(Error::UnknownCallType(other.to_string())),
        })
    }
}
