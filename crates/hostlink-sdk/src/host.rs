//! Host value model
//!
//! The host side of the bridge holds real objects; the module only ever sees
//! handles to them. Values are a closed set of categories so that every
//! consumer (equality, class checks, debug rendering) matches exhaustively.
//! Heap categories are `Rc`-shared: two handle slots may own the same object
//! and release it independently.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Result of invoking a host callable: `Err` carries the thrown value.
pub type HostResult = Result<HostValue, HostValue>;

/// Signature of a host-callable body.
pub type HostCallable = dyn Fn(&[HostValue]) -> HostResult;

/// A host value.
#[derive(Clone)]
pub enum HostValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// IEEE 754 number
    Number(f64),
    /// Immutable text
    String(Rc<str>),
    /// Unique symbol with optional description
    Symbol(Rc<HostSymbol>),
    /// Callable
    Function(Rc<HostFunction>),
    /// Growable array
    Array(Rc<RefCell<Vec<HostValue>>>),
    /// Error object
    Error(Rc<HostError>),
    /// Any other object, tagged with its class name
    Object(Rc<HostObject>),
}

/// Unique symbol.
#[derive(Debug)]
pub struct HostSymbol {
    description: Option<String>,
}

impl HostSymbol {
    /// Symbol description, if one was given
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Host callable with a stable identity.
pub struct HostFunction {
    name: String,
    body: Box<HostCallable>,
    state: Option<Rc<dyn Any>>,
}

impl HostFunction {
    /// Function name (may be empty)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke with host arguments
    pub fn call(&self, args: &[HostValue]) -> HostResult {
        (self.body)(args)
    }

    /// Engine-private state attached at creation (trampoline bookkeeping)
    pub fn state(&self) -> Option<&Rc<dyn Any>> {
        self.state.as_ref()
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("trampoline", &self.state.is_some())
            .finish()
    }
}

/// Error object.
#[derive(Debug, Clone)]
pub struct HostError {
    name: String,
    message: String,
    stack: String,
}

impl HostError {
    /// Create an error with an empty stack
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: String::new(),
        }
    }

    /// Attach a stack trace
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }

    /// Error class name (e.g. `Error`, `TypeError`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stack trace text
    pub fn stack(&self) -> &str {
        &self.stack
    }
}

/// Generic host object with ordered properties.
#[derive(Debug)]
pub struct HostObject {
    class: String,
    properties: RefCell<Vec<(String, HostValue)>>,
}

impl HostObject {
    /// Class name (`Object` for plain objects)
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Read a property
    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.properties
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Write a property, keeping insertion order for new keys
    pub fn set(&self, key: impl Into<String>, value: HostValue) {
        let key = key.into();
        let mut props = self.properties.borrow_mut();
        match props.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => props.push((key, value)),
        }
    }

    /// Snapshot of the properties in insertion order
    pub fn entries(&self) -> Vec<(String, HostValue)> {
        self.properties.borrow().clone()
    }
}

impl HostValue {
    // ========================================================================
    // Constructors
    // ========================================================================

    /// Create a string value
    pub fn string(s: impl AsRef<str>) -> Self {
        HostValue::String(Rc::from(s.as_ref()))
    }

    /// Create a number value
    pub fn number(n: f64) -> Self {
        HostValue::Number(n)
    }

    /// Create a fresh symbol
    pub fn symbol(description: Option<&str>) -> Self {
        HostValue::Symbol(Rc::new(HostSymbol {
            description: description.map(str::to_string),
        }))
    }

    /// Create an array
    pub fn array(items: Vec<HostValue>) -> Self {
        HostValue::Array(Rc::new(RefCell::new(items)))
    }

    /// Create an empty object of the given class
    pub fn object(class: impl Into<String>) -> Self {
        HostValue::Object(Rc::new(HostObject {
            class: class.into(),
            properties: RefCell::new(Vec::new()),
        }))
    }

    /// Create a plain object from key/value pairs
    pub fn plain_object<K: Into<String>>(entries: impl IntoIterator<Item = (K, HostValue)>) -> Self {
        HostValue::Object(Rc::new(HostObject {
            class: "Object".to_string(),
            properties: RefCell::new(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }))
    }

    /// Create an error value
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        HostValue::Error(Rc::new(HostError::new(name, message)))
    }

    /// Wrap a prepared error
    pub fn from_error(error: HostError) -> Self {
        HostValue::Error(Rc::new(error))
    }

    /// Create a host function
    pub fn function(
        name: impl Into<String>,
        body: impl Fn(&[HostValue]) -> HostResult + 'static,
    ) -> Self {
        HostValue::Function(Rc::new(HostFunction {
            name: name.into(),
            body: Box::new(body),
            state: None,
        }))
    }

    /// Create a host function carrying engine-private state
    pub fn function_with_state(
        name: impl Into<String>,
        state: Rc<dyn Any>,
        body: impl Fn(&[HostValue]) -> HostResult + 'static,
    ) -> Self {
        HostValue::Function(Rc::new(HostFunction {
            name: name.into(),
            body: Box::new(body),
            state: Some(state),
        }))
    }

    // ========================================================================
    // Type checks
    // ========================================================================

    /// `typeof`-style category name
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "object",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Symbol(_) => "symbol",
            HostValue::Function(_) => "function",
            HostValue::Array(_) | HostValue::Error(_) | HostValue::Object(_) => "object",
        }
    }

    /// Check for `undefined`
    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    /// Check for `null`
    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    /// `undefined` or `null`
    pub fn is_like_none(&self) -> bool {
        matches!(self, HostValue::Undefined | HostValue::Null)
    }

    /// Borrow string contents
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(&**s),
            _ => None,
        }
    }

    /// Extract a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Extract a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow the function, if callable
    pub fn as_function(&self) -> Option<&Rc<HostFunction>> {
        match self {
            HostValue::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Borrow the object, if a generic object
    pub fn as_object(&self) -> Option<&Rc<HostObject>> {
        match self {
            HostValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Borrow the error, if an error object
    pub fn as_error(&self) -> Option<&Rc<HostError>> {
        match self {
            HostValue::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Strict equality: identity for heap values, value equality for
    /// primitives (`NaN` is never equal to itself)
    pub fn strict_eq(&self, other: &HostValue) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) => true,
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Symbol(a), HostValue::Symbol(b)) => Rc::ptr_eq(a, b),
            (HostValue::Function(a), HostValue::Function(b)) => Rc::ptr_eq(a, b),
            (HostValue::Array(a), HostValue::Array(b)) => Rc::ptr_eq(a, b),
            (HostValue::Error(a), HostValue::Error(b)) => Rc::ptr_eq(a, b),
            (HostValue::Object(a), HostValue::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `instanceof`-style class check
    pub fn instance_of(&self, class: &str) -> bool {
        match self {
            HostValue::Object(o) => o.class == class || class == "Object",
            HostValue::Error(e) => class == "Error" || e.name == class || class == "Object",
            HostValue::Array(_) => class == "Array" || class == "Object",
            HostValue::Function(_) => class == "Function" || class == "Object",
            _ => false,
        }
    }
}

impl Default for HostValue {
    fn default() -> Self {
        HostValue::Undefined
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::string(s)
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(Rc::from(s))
    }
}

/// Render a number the way the host prints it: integral values without a
/// fraction, `NaN`, `Infinity`, and exponent form outside `[1e-6, 1e21)`.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let abs = n.abs();
    if abs >= 1e21 || abs < 1e-6 {
        let formatted = format!("{n:e}");
        return match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => formatted,
        };
    }
    format!("{n}")
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => f.write_str("undefined"),
            HostValue::Null => f.write_str("null"),
            HostValue::Bool(b) => write!(f, "{b}"),
            HostValue::Number(n) => f.write_str(&number_to_string(*n)),
            HostValue::String(s) => f.write_str(s),
            HostValue::Symbol(s) => match s.description() {
                Some(d) => write!(f, "Symbol({d})"),
                None => f.write_str("Symbol()"),
            },
            HostValue::Function(func) => write!(f, "function {}() {{ [native code] }}", func.name),
            HostValue::Array(items) => {
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    if !item.is_like_none() {
                        write!(f, "{item}")?;
                    }
                }
                Ok(())
            }
            HostValue::Error(e) if e.message.is_empty() => f.write_str(&e.name),
            HostValue::Error(e) => write!(f, "{}: {}", e.name, e.message),
            HostValue::Object(o) => write!(f, "[object {}]", o.class),
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => write!(f, "HostValue::Undefined"),
            HostValue::Null => write!(f, "HostValue::Null"),
            HostValue::Bool(b) => write!(f, "HostValue::Bool({b})"),
            HostValue::Number(n) => write!(f, "HostValue::Number({n})"),
            HostValue::String(s) => write!(f, "HostValue::String({s:?})"),
            HostValue::Symbol(s) => write!(f, "HostValue::Symbol({:?})", s.description),
            HostValue::Function(func) => write!(f, "HostValue::Function({:?})", func.name),
            HostValue::Array(items) => write!(f, "HostValue::Array(len={})", items.borrow().len()),
            HostValue::Error(e) => write!(f, "HostValue::Error({}: {})", e.name, e.message),
            HostValue::Object(o) => write!(f, "HostValue::Object({})", o.class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_eq_identity() {
        let a = HostValue::object("Window");
        let b = a.clone();
        let c = HostValue::object("Window");
        assert!(a.strict_eq(&b));
        assert!(!a.strict_eq(&c));
        assert!(HostValue::string("x").strict_eq(&HostValue::string("x")));
        assert!(!HostValue::number(f64::NAN).strict_eq(&HostValue::number(f64::NAN)));
    }

    #[test]
    fn test_object_properties_keep_order() {
        let obj = HostValue::object("Object");
        let o = obj.as_object().unwrap();
        o.set("b", HostValue::number(1.0));
        o.set("a", HostValue::number(2.0));
        o.set("b", HostValue::number(3.0));
        let keys: Vec<String> = o.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(o.get("b").unwrap().as_number(), Some(3.0));
    }

    #[test]
    fn test_number_to_string() {
        assert_eq!(number_to_string(1.0), "1");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(2.5), "2.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(number_to_string(1e21), "1e+21");
        assert_eq!(number_to_string(1.5e-7), "1.5e-7");
    }

    #[test]
    fn test_instance_of() {
        let canvas = HostValue::object("HTMLCanvasElement");
        assert!(canvas.instance_of("HTMLCanvasElement"));
        assert!(!canvas.instance_of("Window"));
        assert!(HostValue::error("TypeError", "bad").instance_of("Error"));
        assert!(!HostValue::number(1.0).instance_of("Object"));
    }

    #[test]
    fn test_function_call() {
        let f = HostValue::function("double", |args| {
            let n = args.first().and_then(HostValue::as_number).unwrap_or(0.0);
            Ok(HostValue::number(n * 2.0))
        });
        let result = f.as_function().unwrap().call(&[HostValue::number(4.0)]).unwrap();
        assert_eq!(result.as_number(), Some(8.0));
    }
}
