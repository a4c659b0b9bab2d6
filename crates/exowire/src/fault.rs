//! # Remote Errors
//!
//! The error categories that survive the trip across a unit boundary, and
//! their plain-map envelopes.
//!
//! An envelope is an ordinary map tagged with an `@@type` entry. The receiving
//! side recognises the tag and rebuilds the error with its original category,
//! so a generic exception with a custom `name` and `code` comes back with the
//! same `name`, `code` and `message`.

use std::collections::BTreeMap;

use crate::value::WireValue;

/// Key of the discriminator entry in an error envelope.
pub const TYPE_KEY: &str = "@@type";

const TAG_EXCEPTION: &str = "Error";
const TAG_DOM: &str = "DOMException";
const TAG_AGGREGATE: &str = "AggregateError";

/// Which family of error an envelope encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A generic exception carrying name, message and an optional code.
    Exception,
    /// A platform exception in the DOM style: abort, data-clone and friends.
    Dom,
    /// Several errors reported together.
    Aggregate,
}

impl ErrorKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Exception => TAG_EXCEPTION,
            Self::Dom => TAG_DOM,
            Self::Aggregate => TAG_AGGREGATE,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            TAG_EXCEPTION => Some(Self::Exception),
            TAG_DOM => Some(Self::Dom),
            TAG_AGGREGATE => Some(Self::Aggregate),
            _ => None,
        }
    }
}

/// An error raised on one side of the boundary and observed on the other.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub name: String,
    pub message: String,
    pub code: Option<String>,
    pub stack: Option<String>,
    /// Member errors of an aggregate; empty for the other kinds.
    pub errors: Vec<RemoteError>,
}

impl RemoteError {
    /// A generic exception named `Error`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Exception,
            name: "Error".into(),
            message: message.into(),
            code: None,
            stack: None,
            errors: Vec::new(),
        }
    }

    /// An `AbortError` in the DOM exception family.
    pub fn abort(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Dom,
            name: "AbortError".into(),
            ..Self::new(message)
        }
    }

    /// A `DataCloneError`: the value could not be copied across the boundary.
    pub fn data_clone(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Dom,
            name: "DataCloneError".into(),
            ..Self::new(message)
        }
    }

    pub fn aggregate(errors: Vec<RemoteError>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Aggregate,
            name: "AggregateError".into(),
            errors,
            ..Self::new(message)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// True when the error complains that some value could not be cloned.
    pub fn is_not_cloneable(&self) -> bool {
        self.name == "DataCloneError" || self.message.contains("could not be cloned")
    }

    /// Appends a synthetic frame naming the callable that produced this error.
    pub fn push_frame(&mut self, function: &str, module: &str) {
        let frame = format!("    at {} ({})", function, module);
        self.stack = Some(match self.stack.take() {
            Some(stack) if !stack.is_empty() => format!("{}\n{}", stack, frame),
            _ => format!("{}: {}\n{}", self.name, self.message, frame),
        });
    }

    /// Encodes this error as a tagged map.
    pub fn to_envelope(&self) -> WireValue {
        let mut map = BTreeMap::new();
        map.insert(TYPE_KEY.to_string(), WireValue::Str(self.kind.as_tag().into()));
        map.insert("name".into(), WireValue::Str(self.name.clone()));
        map.insert("message".into(), WireValue::Str(self.message.clone()));
        if let Some(code) = &self.code {
            map.insert("code".into(), WireValue::Str(code.clone()));
        }
        if let Some(stack) = &self.stack {
            map.insert("stack".into(), WireValue::Str(stack.clone()));
        }
        if self.kind == ErrorKind::Aggregate {
            let errors = self.errors.iter().map(RemoteError::to_envelope).collect();
            map.insert("errors".into(), WireValue::List(errors));
        }
        WireValue::Map(map)
    }

    /// Decodes a tagged map. Returns `None` if `wire` is not a known envelope.
    pub fn from_envelope(wire: &WireValue) -> Option<Self> {
        match wire {
            WireValue::Map(map) => Self::from_map(map),
            _ => None,
        }
    }

    /// Decodes the entries of a map that may be an envelope.
    pub fn from_map(map: &BTreeMap<String, WireValue>) -> Option<Self> {
        let Some(WireValue::Str(tag)) = map.get(TYPE_KEY) else { return None };
        let kind = ErrorKind::from_tag(tag)?;

        let text = |key: &str| match map.get(key) {
            Some(WireValue::Str(s)) => Some(s.clone()),
            _ => None,
        };

        let errors = match map.get("errors") {
            Some(WireValue::List(items)) => items
                .iter()
                .map(|item| Self::from_envelope(item).unwrap_or_else(|| Self::from_payload(item)))
                .collect(),
            _ => Vec::new(),
        };

        Some(Self {
            kind,
            name: text("name").unwrap_or_else(|| kind.as_tag().to_string()),
            message: text("message").unwrap_or_default(),
            code: text("code"),
            stack: text("stack"),
            errors,
        })
    }

    /// Interprets any payload as an error: envelopes are unboxed, anything
    /// else becomes a generic exception describing the payload.
    pub fn from_payload(wire: &WireValue) -> Self {
        if let Some(error) = Self::from_envelope(wire) {
            return error;
        }
        match wire {
            WireValue::Str(message) => Self::new(message.clone()),
            other => Self::new(format!("{:?}", other)),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.name, code, self.message),
            None => write!(f, "{}: {}", self.name, self.message),
        }
    }
}

impl std::error::Error for RemoteError {}
