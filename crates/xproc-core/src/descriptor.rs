//! Interface descriptors: the static table a proxy and a stub agree on.
//!
//! Transaction codes are handed out in declaration order starting at
//! [`FIRST_CALL_TRANSACTION`]. A method that is removed from a contract is
//! declared with [`InterfaceDescriptorBuilder::retired`] instead of being
//! deleted, so its code stays consumed and every later method keeps the code
//! older peers were built with.

use crate::codec::{Value, WireType};
use crate::error::{Result, XprocError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Reserved for the bind handshake.
pub const HANDSHAKE_TRANSACTION: u32 = 0;
/// Code of the first declared method.
pub const FIRST_CALL_TRANSACTION: u32 = 1;

/// Local fallback body for an optional method.
pub type DefaultBody = fn(&[Value]) -> Result<Value>;

/// One method of an interface contract.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    name: String,
    code: u32,
    argument_types: Vec<WireType>,
    return_type: WireType,
    default_body: Option<DefaultBody>,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn argument_types(&self) -> &[WireType] {
        &self.argument_types
    }

    pub fn return_type(&self) -> WireType {
        self.return_type
    }

    /// True when the method carries a local fallback usable against peers
    /// that do not implement it.
    pub fn has_default_implementation(&self) -> bool {
        self.default_body.is_some()
    }

    /// Run the local fallback, if any.
    pub fn run_default(&self, args: &[Value]) -> Option<Result<Value>> {
        self.default_body.map(|body| body(args))
    }
}

/// Immutable method table for one interface contract.
#[derive(Debug)]
pub struct InterfaceDescriptor {
    name: String,
    methods: Vec<MethodDescriptor>,
    by_code: HashMap<u32, usize>,
    by_name: HashMap<String, usize>,
    retired: Vec<(u32, String)>,
}

impl InterfaceDescriptor {
    /// Start declaring an interface.
    pub fn builder(name: impl Into<String>) -> InterfaceDescriptorBuilder {
        InterfaceDescriptorBuilder {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Methods in declaration order.
    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn method_by_code(&self, code: u32) -> Option<&MethodDescriptor> {
        self.by_code.get(&code).map(|&i| &self.methods[i])
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.by_name.get(name).map(|&i| &self.methods[i])
    }

    /// Whether `code` belonged to a method that has since been removed.
    pub fn is_retired(&self, code: u32) -> bool {
        self.retired.iter().any(|(c, _)| *c == code)
    }

    /// Serializable view for tooling and logs.
    pub fn summary(&self) -> DescriptorSummary {
        DescriptorSummary {
            interface: self.name.clone(),
            methods: self
                .methods
                .iter()
                .map(|m| MethodSummary {
                    code: m.code,
                    name: m.name.clone(),
                    arguments: m.argument_types.clone(),
                    returns: m.return_type,
                    has_default: m.has_default_implementation(),
                })
                .collect(),
            retired: self.retired.iter().map(|(code, _)| *code).collect(),
        }
    }
}

/// JSON-friendly description of an interface.
#[derive(Debug, Clone, Serialize)]
pub struct DescriptorSummary {
    pub interface: String,
    pub methods: Vec<MethodSummary>,
    pub retired: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodSummary {
    pub code: u32,
    pub name: String,
    pub arguments: Vec<WireType>,
    pub returns: WireType,
    pub has_default: bool,
}

enum Entry {
    Method {
        name: String,
        argument_types: Vec<WireType>,
        return_type: WireType,
        default_body: Option<DefaultBody>,
    },
    Retired(String),
}

impl Entry {
    fn name(&self) -> &str {
        match self {
            Entry::Method { name, .. } | Entry::Retired(name) => name,
        }
    }
}

/// Declares the methods of an interface in order.
pub struct InterfaceDescriptorBuilder {
    name: String,
    entries: Vec<Entry>,
}

impl InterfaceDescriptorBuilder {
    /// Declare a method the remote end must implement.
    pub fn method(mut self, name: &str, args: &[WireType], returns: WireType) -> Self {
        self.entries.push(Entry::Method {
            name: name.to_string(),
            argument_types: args.to_vec(),
            return_type: returns,
            default_body: None,
        });
        self
    }

    /// Declare a method with a local fallback body.
    pub fn optional_method(
        mut self,
        name: &str,
        args: &[WireType],
        returns: WireType,
        default_body: DefaultBody,
    ) -> Self {
        self.entries.push(Entry::Method {
            name: name.to_string(),
            argument_types: args.to_vec(),
            return_type: returns,
            default_body: Some(default_body),
        });
        self
    }

    /// Keep the code of a removed method consumed.
    pub fn retired(mut self, name: &str) -> Self {
        self.entries.push(Entry::Retired(name.to_string()));
        self
    }

    pub fn build(self) -> Result<InterfaceDescriptor> {
        if self.name.trim().is_empty() {
            return Err(XprocError::Config {
                message: "interface name cannot be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.name().to_string()) {
                return Err(XprocError::Config {
                    message: format!("{}: duplicate method {}", self.name, entry.name()),
                });
            }
        }

        let mut methods = Vec::new();
        let mut retired = Vec::new();
        for (code, entry) in (FIRST_CALL_TRANSACTION..).zip(self.entries) {
            match entry {
                Entry::Retired(name) => retired.push((code, name)),
                Entry::Method {
                    name,
                    argument_types,
                    return_type,
                    default_body,
                } => {
                    if argument_types.contains(&WireType::Void) {
                        return Err(XprocError::Config {
                            message: format!("{}.{}: void is not an argument type", self.name, name),
                        });
                    }
                    methods.push(MethodDescriptor {
                        name,
                        code,
                        argument_types,
                        return_type,
                        default_body,
                    });
                }
            }
        }

        let by_code = methods.iter().enumerate().map(|(i, m)| (m.code, i)).collect();
        let by_name = methods
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.clone(), i))
            .collect();

        Ok(InterfaceDescriptor {
            name: self.name,
            methods,
            by_code,
            by_name,
            retired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &[Value]) -> Result<Value> {
        Ok(Value::Void)
    }

    #[test]
    fn test_codes_follow_declaration_order() {
        let descriptor = InterfaceDescriptor::builder("Clock")
            .method("now", &[], WireType::I64)
            .method("label", &[WireType::I32], WireType::NullableString)
            .build()
            .unwrap();

        assert_eq!(descriptor.method("now").unwrap().code(), FIRST_CALL_TRANSACTION);
        assert_eq!(descriptor.method("label").unwrap().code(), FIRST_CALL_TRANSACTION + 1);
        assert_eq!(descriptor.method_by_code(2).unwrap().name(), "label");
        assert!(descriptor.method_by_code(HANDSHAKE_TRANSACTION).is_none());
    }

    #[test]
    fn test_retired_codes_are_never_reused() {
        let v1 = InterfaceDescriptor::builder("Clock")
            .method("now", &[], WireType::I64)
            .method("legacy", &[], WireType::Void)
            .method("label", &[], WireType::String)
            .build()
            .unwrap();
        let v2 = InterfaceDescriptor::builder("Clock")
            .method("now", &[], WireType::I64)
            .retired("legacy")
            .method("label", &[], WireType::String)
            .method("reset", &[], WireType::Void)
            .build()
            .unwrap();

        assert_eq!(
            v1.method("label").unwrap().code(),
            v2.method("label").unwrap().code()
        );
        assert!(v2.method_by_code(2).is_none());
        assert!(v2.is_retired(2));
        assert_eq!(v2.method("reset").unwrap().code(), 4);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = InterfaceDescriptor::builder("Clock")
            .method("now", &[], WireType::I64)
            .retired("now")
            .build();
        assert!(matches!(result, Err(XprocError::Config { .. })));
    }

    #[test]
    fn test_void_argument_rejected() {
        let result = InterfaceDescriptor::builder("Clock")
            .method("set", &[WireType::Void], WireType::Void)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_interface_name_rejected() {
        assert!(InterfaceDescriptor::builder(" ").build().is_err());
    }

    #[test]
    fn test_default_flag_and_body() {
        let descriptor = InterfaceDescriptor::builder("Clock")
            .method("now", &[], WireType::I64)
            .optional_method("start", &[], WireType::Void, noop)
            .build()
            .unwrap();

        let start = descriptor.method("start").unwrap();
        assert!(start.has_default_implementation());
        assert_eq!(start.run_default(&[]).unwrap().unwrap(), Value::Void);
        assert!(!descriptor.method("now").unwrap().has_default_implementation());
        assert!(descriptor.method("now").unwrap().run_default(&[]).is_none());
    }

    #[test]
    fn test_summary_serializes() {
        let descriptor = InterfaceDescriptor::builder("Clock")
            .method("label", &[WireType::I32], WireType::NullableString)
            .build()
            .unwrap();
        let json = serde_json::to_value(descriptor.summary()).unwrap();

        assert_eq!(json["interface"], "Clock");
        assert_eq!(json["methods"][0]["arguments"][0], "i32");
        assert_eq!(json["methods"][0]["returns"], "nullable_string");
    }
}
